use rusqlite::{params, OptionalExtension};

use parley_shared::UserId;

use crate::changes::{EntityKind, StoreChange};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::UserProfile;

impl Database {
    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO users (id, display_name, avatar_path) VALUES (?1, ?2, ?3)",
            params![user.id.as_str(), user.display_name, user.avatar_path],
        )?;
        self.publish([StoreChange::Changed {
            entity: EntityKind::User,
            id: user.id.to_string(),
            fields: vec!["display_name", "avatar_path"],
        }]);
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<UserProfile> {
        self.conn()?
            .query_row(
                "SELECT id, display_name, avatar_path FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(UserProfile {
                        id: UserId(row.get(0)?),
                        display_name: row.get(1)?,
                        avatar_path: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }
}
