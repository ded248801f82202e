//! Message predicates understood by the local store.
//!
//! A [`MessageQuery`] is translated to SQL by the SQLite backend and can
//! also be evaluated in memory with [`MessageQuery::matches`], which is what
//! the in-memory remote store and the tests use.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{ConversationId, MessageId, UserId};

use crate::models::Message;

/// Total ordering position of a message: `(timestamp, id)`.
///
/// Timestamps are not unique, so every range query breaks ties on the id to
/// keep anchors exclusive without skipping same-millisecond neighbours.
/// Positions are compared at millisecond precision, the resolution the
/// stores keep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: MessageId,
}

impl Cursor {
    pub fn of(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            id: message.id.clone(),
        }
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor {}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .timestamp_millis()
            .cmp(&other.timestamp.timestamp_millis())
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeBound {
    /// Strictly (or, if `inclusive`, non-strictly) older than the cursor.
    Before { cursor: Cursor, inclusive: bool },
    /// Strictly (or, if `inclusive`, non-strictly) newer than the cursor.
    After { cursor: Cursor, inclusive: bool },
    /// Timestamp at or before the given instant, regardless of id.
    AtOrBefore(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Predicate over the messages of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub conversation_id: ConversationId,
    /// `id IN (...)`
    pub ids: Option<Vec<MessageId>>,
    /// `sender_id != ...`
    pub sender_not: Option<UserId>,
    /// Seen state does not contain the user.
    pub not_seen_by: Option<UserId>,
    pub bound: Option<RangeBound>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn for_conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            ids: None,
            sender_not: None,
            not_seen_by: None,
            bound: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn sender_not(mut self, user: UserId) -> Self {
        self.sender_not = Some(user);
        self
    }

    pub fn not_seen_by(mut self, user: UserId) -> Self {
        self.not_seen_by = Some(user);
        self
    }

    pub fn before(mut self, cursor: Cursor, inclusive: bool) -> Self {
        self.bound = Some(RangeBound::Before { cursor, inclusive });
        self
    }

    pub fn after(mut self, cursor: Cursor, inclusive: bool) -> Self {
        self.bound = Some(RangeBound::After { cursor, inclusive });
        self
    }

    pub fn at_or_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.bound = Some(RangeBound::AtOrBefore(timestamp));
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate every predicate except ordering and limit.
    pub fn matches(&self, message: &Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&message.id) {
                return false;
            }
        }
        if let Some(sender) = &self.sender_not {
            if &message.sender_id == sender {
                return false;
            }
        }
        if let Some(reader) = &self.not_seen_by {
            if message.is_seen_by(reader) {
                return false;
            }
        }
        match &self.bound {
            None => true,
            Some(RangeBound::Before { cursor, inclusive }) => {
                let pos = Cursor::of(message);
                pos < *cursor || (*inclusive && pos == *cursor)
            }
            Some(RangeBound::After { cursor, inclusive }) => {
                let pos = Cursor::of(message);
                pos > *cursor || (*inclusive && pos == *cursor)
            }
            Some(RangeBound::AtOrBefore(ts)) => {
                message.timestamp.timestamp_millis() <= ts.timestamp_millis()
            }
        }
    }

    /// Filter, sort and truncate an in-memory collection with this query.
    pub fn apply<'a, I>(&self, messages: I) -> Vec<Message>
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut out: Vec<Message> = messages
            .into_iter()
            .filter(|m| self.matches(m))
            .cloned()
            .collect();
        out.sort_by_key(Cursor::of);
        if self.order == SortOrder::Descending {
            out.reverse();
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: &str, minute: u32) -> Message {
        Message::text(
            "c".into(),
            "alice".into(),
            id,
            Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap(),
            true,
        )
        .with_id(id)
    }

    #[test]
    fn exclusive_bounds_skip_the_anchor_but_keep_ties() {
        let a = msg("a", 1);
        let b = msg("b", 1);
        let c = msg("c", 2);
        let all = [a.clone(), b.clone(), c.clone()];

        let after_a = MessageQuery::for_conversation("c".into())
            .after(Cursor::of(&a), false)
            .apply(all.iter());
        let ids: Vec<_> = after_a.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        let before_c = MessageQuery::for_conversation("c".into())
            .before(Cursor::of(&c), false)
            .order(SortOrder::Descending)
            .limit(1)
            .apply(all.iter());
        assert_eq!(before_c[0].id.as_str(), "b");
    }

    #[test]
    fn cursors_agree_with_their_ordering_below_a_millisecond() {
        let stored = msg("a", 1);
        let mut precise = stored.clone();
        precise.timestamp += chrono::Duration::microseconds(250);

        let (stored, precise) = (Cursor::of(&stored), Cursor::of(&precise));
        assert_eq!(stored.cmp(&precise), Ordering::Equal);
        assert_eq!(stored, precise);

        // The inclusive bound still matches the anchor itself.
        let from_precise = MessageQuery::for_conversation("c".into())
            .after(precise, true)
            .apply([msg("a", 1)].iter());
        assert_eq!(from_precise.len(), 1);
    }

    #[test]
    fn not_seen_by_filters_readers() {
        let mut seen = msg("a", 1);
        seen.seen.mark_seen_by(&"bob".into());
        let unseen = msg("b", 2);
        let q = MessageQuery::for_conversation("c".into()).not_seen_by("bob".into());
        assert!(!q.matches(&seen));
        assert!(q.matches(&unseen));
    }
}
