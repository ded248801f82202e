//! CRUD operations for [`Message`] records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};

use parley_shared::{ConversationId, MessageId, ModelError, UserId};

use crate::changes::{EntityKind, StoreChange};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageKind, SeenState};
use crate::query::{MessageQuery, RangeBound, SortOrder};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, timestamp_ms, body, kind, \
     media_path, seen_status, seen_by, replied_to_id, reactions, edited";

impl Database {
    // ------------------------------------------------------------------
    // Create / replace
    // ------------------------------------------------------------------

    /// Insert or replace a batch of messages in one transaction.
    pub fn upsert_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut changes = Vec::with_capacity(messages.len());
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for message in messages {
                let previous = select_by_id(&tx, &message.id)?;
                write_message(&tx, message)?;
                changes.push(match previous {
                    None => StoreChange::Inserted {
                        entity: EntityKind::Message,
                        id: message.id.to_string(),
                    },
                    Some(prev) => StoreChange::Changed {
                        entity: EntityKind::Message,
                        id: message.id.to_string(),
                        fields: prev.changed_fields(message),
                    },
                });
            }
            tx.commit()?;
        }

        tracing::debug!(count = messages.len(), "stored messages");
        self.publish(changes);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message_by_id(&self, id: &MessageId) -> Result<Message> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.as_str()],
            row_to_message,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })
    }

    pub fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let (sql, values) = build_select(query, MESSAGE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply `mutation` to one message and persist the result.
    ///
    /// Returns `Ok(None)` when the message does not exist.
    pub fn modify_message(
        &self,
        id: &MessageId,
        mutation: &mut dyn FnMut(&mut Message),
    ) -> Result<Option<Message>> {
        let change;
        let updated;
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let Some(before) = select_by_id(&tx, id)? else {
                return Ok(None);
            };
            let mut after = before.clone();
            mutation(&mut after);
            // The primary key is not ours to change.
            after.id = before.id.clone();
            let fields = before.changed_fields(&after);
            if !fields.is_empty() {
                write_message(&tx, &after)?;
            }
            tx.commit()?;
            change = (!fields.is_empty()).then(|| StoreChange::Changed {
                entity: EntityKind::Message,
                id: id.to_string(),
                fields,
            });
            updated = after;
        }
        self.publish(change);
        Ok(Some(updated))
    }

    /// Apply `mutation` to every message matching `query` in one transaction.
    ///
    /// The mutation reports whether it changed the message; only changed
    /// messages are written and returned.
    pub fn modify_messages(
        &self,
        query: &MessageQuery,
        mutation: &mut dyn FnMut(&mut Message) -> bool,
    ) -> Result<Vec<Message>> {
        let mut changed = Vec::new();
        let mut changes = Vec::new();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let candidates = {
                let (sql, values) = build_select(query, MESSAGE_COLUMNS);
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for before in candidates {
                let mut after = before.clone();
                if !mutation(&mut after) {
                    continue;
                }
                after.id = before.id.clone();
                write_message(&tx, &after)?;
                changes.push(StoreChange::Changed {
                    entity: EntityKind::Message,
                    id: after.id.to_string(),
                    fields: before.changed_fields(&after),
                });
                changed.push(after);
            }
            tx.commit()?;
        }
        self.publish(changes);
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete messages by id. Returns the number of rows removed.
    pub fn delete_messages(&self, ids: &[MessageId]) -> Result<usize> {
        let mut removed = Vec::new();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for id in ids {
                let affected =
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
                if affected > 0 {
                    removed.push(id.clone());
                }
            }
            tx.commit()?;
        }

        let count = removed.len();
        self.publish(removed.into_iter().map(|id| StoreChange::Deleted {
            entity: EntityKind::Message,
            id: id.to_string(),
        }));
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn select_by_id(tx: &Transaction<'_>, id: &MessageId) -> Result<Option<Message>> {
    Ok(tx
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.as_str()],
            row_to_message,
        )
        .optional()?)
}

fn write_message(tx: &Transaction<'_>, message: &Message) -> Result<()> {
    let (seen_status, seen_by) = match &message.seen {
        SeenState::Private(seen) => (*seen, None),
        SeenState::Group(readers) => (false, Some(serde_json::to_string(readers)?)),
    };

    tx.execute(
        "INSERT OR REPLACE INTO messages
             (id, conversation_id, sender_id, timestamp_ms, body, kind, media_path,
              seen_status, seen_by, replied_to_id, reactions, edited)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            message.id.as_str(),
            message.conversation_id.as_str(),
            message.sender_id.as_str(),
            message.timestamp.timestamp_millis(),
            message.body,
            message.kind.as_str(),
            message.media_path,
            seen_status,
            seen_by,
            message.replied_to_id.as_ref().map(|id| id.as_str()),
            serde_json::to_string(&message.reactions)?,
            message.edited,
        ],
    )?;
    Ok(())
}

/// Translate a [`MessageQuery`] into a parameterised `SELECT`.
fn build_select(query: &MessageQuery, columns: &str) -> (String, Vec<Value>) {
    let mut clauses = vec!["conversation_id = ?".to_string()];
    let mut values = vec![Value::Text(query.conversation_id.to_string())];

    if let Some(ids) = &query.ids {
        if ids.is_empty() {
            clauses.push("0".to_string());
        } else {
            let marks = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("id IN ({marks})"));
            values.extend(ids.iter().map(|id| Value::Text(id.to_string())));
        }
    }

    if let Some(sender) = &query.sender_not {
        clauses.push("sender_id != ?".to_string());
        values.push(Value::Text(sender.to_string()));
    }

    if let Some(reader) = &query.not_seen_by {
        clauses.push(
            "((seen_by IS NULL AND seen_status = 0) OR (seen_by IS NOT NULL AND NOT EXISTS \
             (SELECT 1 FROM json_each(messages.seen_by) WHERE json_each.value = ?)))"
                .to_string(),
        );
        values.push(Value::Text(reader.to_string()));
    }

    match &query.bound {
        None => {}
        Some(RangeBound::Before { cursor, inclusive }) => {
            let op = if *inclusive { "<=" } else { "<" };
            clauses.push(format!(
                "(timestamp_ms < ? OR (timestamp_ms = ? AND id {op} ?))"
            ));
            let ms = cursor.timestamp.timestamp_millis();
            values.extend([Value::Integer(ms), Value::Integer(ms), Value::Text(cursor.id.to_string())]);
        }
        Some(RangeBound::After { cursor, inclusive }) => {
            let op = if *inclusive { ">=" } else { ">" };
            clauses.push(format!(
                "(timestamp_ms > ? OR (timestamp_ms = ? AND id {op} ?))"
            ));
            let ms = cursor.timestamp.timestamp_millis();
            values.extend([Value::Integer(ms), Value::Integer(ms), Value::Text(cursor.id.to_string())]);
        }
        Some(RangeBound::AtOrBefore(ts)) => {
            clauses.push("timestamp_ms <= ?".to_string());
            values.push(Value::Integer(ts.timestamp_millis()));
        }
    }

    let order = match query.order {
        SortOrder::Ascending => "timestamp_ms ASC, id ASC",
        SortOrder::Descending => "timestamp_ms DESC, id DESC",
    };

    let mut sql = format!(
        "SELECT {columns} FROM messages WHERE {} ORDER BY {order}",
        clauses.join(" AND ")
    );
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));
    }
    (sql, values)
}

fn conversion_error(
    column: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let timestamp_ms: i64 = row.get(3)?;
    let body: String = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let media_path: Option<String> = row.get(6)?;
    let seen_status: bool = row.get(7)?;
    let seen_by: Option<String> = row.get(8)?;
    let replied_to_id: Option<String> = row.get(9)?;
    let reactions_json: String = row.get(10)?;
    let edited: bool = row.get(11)?;

    let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .ok_or_else(|| conversion_error(3, ModelError::InvalidTimestamp(timestamp_ms)))?;

    let kind: MessageKind = kind_str.parse().map_err(|e| conversion_error(5, e))?;

    let seen = match seen_by {
        None => SeenState::Private(seen_status),
        Some(json) => {
            let readers: BTreeSet<UserId> =
                serde_json::from_str(&json).map_err(|e| conversion_error(8, e))?;
            SeenState::Group(readers)
        }
    };

    let reactions: BTreeMap<String, BTreeSet<UserId>> =
        serde_json::from_str(&reactions_json).map_err(|e| conversion_error(10, e))?;

    Ok(Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        timestamp,
        body,
        kind,
        media_path,
        seen,
        replied_to_id: replied_to_id.map(MessageId),
        reactions,
        edited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Cursor;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn group_msg(id: &str, minutes: i64, sender: &str) -> Message {
        Message::text(
            "conv".into(),
            sender.into(),
            format!("body {id}"),
            base() + Duration::minutes(minutes),
            true,
        )
        .with_id(id)
    }

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let msgs: Vec<_> = (0..6)
            .map(|i| group_msg(&format!("m{i}"), i, if i % 2 == 0 { "alice" } else { "bob" }))
            .collect();
        db.upsert_messages(&msgs).unwrap();
        db
    }

    #[test]
    fn upsert_then_get_preserves_all_fields() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = group_msg("x", 0, "alice");
        msg.seen.mark_seen_by(&"bob".into());
        msg.reactions
            .entry("👍".to_string())
            .or_default()
            .insert("carol".into());
        msg.replied_to_id = Some("gone".into());
        msg.kind = MessageKind::Image;
        msg.media_path = Some("images/x.jpg".into());
        db.upsert_messages(std::slice::from_ref(&msg)).unwrap();

        assert_eq!(db.get_message_by_id(&"x".into()).unwrap(), msg);
    }

    #[test]
    fn missing_message_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_message_by_id(&"nope".into()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn exclusive_before_page_never_returns_anchor() {
        let db = seeded();
        let anchor = db.get_message_by_id(&"m3".into()).unwrap();
        let page = db
            .query_messages(
                &MessageQuery::for_conversation("conv".into())
                    .before(Cursor::of(&anchor), false)
                    .order(SortOrder::Descending)
                    .limit(10),
            )
            .unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1", "m0"]);
    }

    #[test]
    fn not_seen_by_and_sender_not_combine() {
        let db = seeded();
        db.modify_message(&"m1".into(), &mut |m| {
            m.seen.mark_seen_by(&"alice".into());
        })
        .unwrap();

        let query = MessageQuery::for_conversation("conv".into())
            .sender_not("alice".into())
            .not_seen_by("alice".into());
        let ids: Vec<_> = db
            .query_messages(&query)
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, ["m3", "m5"]);
    }

    #[test]
    fn modify_messages_only_writes_changed_rows() {
        let db = seeded();
        let mut rx = db.subscribe();
        let reader = UserId::new("carol");
        let changed = db
            .modify_messages(
                &MessageQuery::for_conversation("conv".into()).at_or_before(base() + Duration::minutes(2)),
                &mut |m| m.seen.mark_seen_by(&reader),
            )
            .unwrap();
        assert_eq!(changed.len(), 3);

        let change = rx.try_recv().unwrap();
        assert!(matches!(
            change,
            StoreChange::Changed { ref fields, .. } if fields == &vec!["seen"]
        ));
    }

    #[test]
    fn delete_reports_only_existing_rows() {
        let db = seeded();
        let removed = db
            .delete_messages(&["m0".into(), "missing".into()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_message_by_id(&"m0".into()).is_err());
    }

    #[test]
    fn empty_id_set_matches_nothing() {
        let db = seeded();
        let q = MessageQuery::for_conversation("conv".into()).ids(Vec::new());
        assert!(db.query_messages(&q).unwrap().is_empty());
    }
}
