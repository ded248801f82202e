//! CRUD operations for [`Conversation`] records.

use rusqlite::{params, OptionalExtension};

use parley_shared::{ConversationId, MessageId};

use crate::changes::{EntityKind, StoreChange};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Participant};

impl Database {
    /// Insert a conversation or replace the stored copy.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let change = {
            let conn = self.conn()?;
            let previous = select_conversation(&conn, &conversation.id)?;
            write_conversation(&conn, conversation)?;
            match previous {
                None => Some(StoreChange::Inserted {
                    entity: EntityKind::Conversation,
                    id: conversation.id.to_string(),
                }),
                Some(prev) => {
                    let fields = prev.changed_fields(conversation);
                    (!fields.is_empty()).then(|| StoreChange::Changed {
                        entity: EntityKind::Conversation,
                        id: conversation.id.to_string(),
                        fields,
                    })
                }
            }
        };
        self.publish(change);
        Ok(())
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let conn = self.conn()?;
        select_conversation(&conn, id)?.ok_or(StoreError::NotFound)
    }

    /// Apply `mutation` to a stored conversation inside a transaction.
    pub fn modify_conversation(
        &self,
        id: &ConversationId,
        mutation: &mut dyn FnMut(&mut Conversation),
    ) -> Result<Option<Conversation>> {
        let (updated, change) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let Some(before) = select_conversation(&tx, id)? else {
                return Ok(None);
            };
            let mut after = before.clone();
            mutation(&mut after);
            after.id = before.id.clone();
            let fields = before.changed_fields(&after);
            if !fields.is_empty() {
                write_conversation(&tx, &after)?;
            }
            tx.commit()?;
            let change = (!fields.is_empty()).then(|| StoreChange::Changed {
                entity: EntityKind::Conversation,
                id: id.to_string(),
                fields,
            });
            (after, change)
        };
        self.publish(change);
        Ok(Some(updated))
    }
}

fn write_conversation(conn: &rusqlite::Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO conversations
             (id, name, is_group, recent_message_id, message_count, participants)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation.id.as_str(),
            conversation.name,
            conversation.is_group,
            conversation.recent_message_id.as_ref().map(|id| id.as_str()),
            conversation.message_count as i64,
            serde_json::to_string(&conversation.participants)?,
        ],
    )?;
    Ok(())
}

fn select_conversation(
    conn: &rusqlite::Connection,
    id: &ConversationId,
) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, name, is_group, recent_message_id, message_count, participants
             FROM conversations WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((id, name, is_group, recent, count, participants_json)) = row else {
        return Ok(None);
    };
    let participants: Vec<Participant> = serde_json::from_str(&participants_json)?;

    Ok(Some(Conversation {
        id: ConversationId(id),
        name,
        participants,
        is_group,
        recent_message_id: recent.map(MessageId),
        message_count: count.max(0) as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation::new("c1".into(), true, ["alice".into(), "bob".into()])
    }

    #[test]
    fn upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let conv = conversation();
        db.upsert_conversation(&conv).unwrap();
        assert_eq!(db.get_conversation(&"c1".into()).unwrap(), conv);
    }

    #[test]
    fn modify_publishes_changed_fields() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_conversation(&conversation()).unwrap();
        let mut rx = db.subscribe();

        let updated = db
            .modify_conversation(&"c1".into(), &mut |c| {
                c.participant_mut(&"bob".into()).unwrap().unseen_count = 3;
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.unseen_count_for(&"bob".into()), 3);

        match rx.try_recv().unwrap() {
            StoreChange::Changed { fields, .. } => assert_eq!(fields, vec!["participants"]),
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn modify_missing_returns_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .modify_conversation(&"nope".into(), &mut |_| {})
            .unwrap()
            .is_none());
    }
}
