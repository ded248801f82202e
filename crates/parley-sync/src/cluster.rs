//! Day-bucketed, inverted view of a conversation.
//!
//! Sections are calendar days, newest day first. Rows inside a section are
//! newest first as well, so row 0 of section 0 is the newest message on
//! screen. Batches are inserted at one end only: newer messages are
//! prepended, older messages appended. The existing structure is never
//! re-sorted.
//!
//! Diffs follow the usual table-view convention: rows belonging to an
//! inserted (or removed) section are reported through the section only.

use std::collections::{HashMap, HashSet};

use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;

use parley_shared::{Direction, MessageId};
use parley_store::{Cursor, Message};

use crate::metadata::MessageMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

impl IndexPath {
    pub fn new(section: usize, row: usize) -> Self {
        Self { section, row }
    }
}

/// A message together with the metadata fetched for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub message: Message,
    pub metadata: MessageMetadata,
}

impl MessageRow {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_metadata(message: Message, metadata: MessageMetadata) -> Self {
        Self { message, metadata }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageItem {
    Message(MessageRow),
    /// Marks the boundary above the first unseen message.
    UnseenDivider,
}

impl MessageItem {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Message(row) => Some(&row.message),
            Self::UnseenDivider => None,
        }
    }

    pub fn row(&self) -> Option<&MessageRow> {
        match self {
            Self::Message(row) => Some(row),
            Self::UnseenDivider => None,
        }
    }

    fn is_message(&self, id: &MessageId) -> bool {
        self.message().is_some_and(|m| &m.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageCluster {
    pub date: NaiveDate,
    pub items: Vec<MessageItem>,
}

impl MessageCluster {
    fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.items.iter().filter_map(MessageItem::message)
    }

    fn has_messages(&self) -> bool {
        self.messages().next().is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterDiff {
    pub inserted_sections: Vec<usize>,
    pub removed_sections: Vec<usize>,
    pub inserted: Vec<IndexPath>,
    pub removed: Vec<IndexPath>,
    pub updated: Vec<IndexPath>,
    /// Insertion direction, when the diff came from an insert.
    pub direction: Option<Direction>,
}

impl ClusterDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted_sections.is_empty()
            && self.removed_sections.is_empty()
            && self.inserted.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
    }

    pub fn updated(paths: impl IntoIterator<Item = IndexPath>) -> Self {
        Self {
            updated: paths.into_iter().collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageClusterer {
    clusters: Vec<MessageCluster>,
    offset: FixedOffset,
    index: HashMap<MessageId, NaiveDate>,
}

impl MessageClusterer {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            clusters: Vec::new(),
            offset,
            index: HashMap::new(),
        }
    }

    pub fn clusters(&self) -> &[MessageCluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Messages in display order (newest first).
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.clusters.iter().flat_map(|c| c.messages())
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages().map(|m| m.id.clone()).collect()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages().next()
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.clusters
            .iter()
            .rev()
            .flat_map(|c| c.messages().rev())
            .next()
    }

    pub fn get(&self, id: &MessageId) -> Option<&MessageRow> {
        let path = self.position(id)?;
        self.clusters[path.section].items[path.row].row()
    }

    pub fn position(&self, id: &MessageId) -> Option<IndexPath> {
        let date = self.index.get(id)?;
        let section = self.clusters.iter().position(|c| &c.date == date)?;
        let row = self.clusters[section]
            .items
            .iter()
            .position(|item| item.is_message(id))?;
        Some(IndexPath::new(section, row))
    }

    /// Insert a batch of rows.
    ///
    /// Rows whose id is already clustered, or repeated inside the batch, are
    /// skipped. The direction is decided once for the whole batch.
    pub fn insert(&mut self, rows: Vec<MessageRow>) -> ClusterDiff {
        let mut seen = HashSet::new();
        let mut fresh: Vec<MessageRow> = rows
            .into_iter()
            .filter(|r| !self.index.contains_key(&r.message.id) && seen.insert(r.message.id.clone()))
            .collect();
        if fresh.is_empty() {
            return ClusterDiff::default();
        }

        fresh.sort_by_key(|r| Cursor::of(&r.message));
        let newest_incoming = fresh.last().map(|r| Cursor::of(&r.message));
        let direction = match (self.newest().map(Cursor::of), newest_incoming) {
            (Some(existing), Some(incoming)) if incoming <= existing => Direction::Descending,
            _ => Direction::Ascending,
        };
        if direction == Direction::Descending {
            fresh.reverse();
        }

        let mut new_sections = HashSet::new();
        let mut ids = Vec::with_capacity(fresh.len());
        for row in fresh {
            let date = row.message.day_key(&self.offset);
            ids.push(row.message.id.clone());
            self.index.insert(row.message.id.clone(), date);

            let section = match self.clusters.iter().position(|c| c.date == date) {
                Some(section) => section,
                None => {
                    new_sections.insert(date);
                    let cluster = MessageCluster {
                        date,
                        items: Vec::new(),
                    };
                    match direction {
                        Direction::Ascending => {
                            self.clusters.insert(0, cluster);
                            0
                        }
                        Direction::Descending => {
                            self.clusters.push(cluster);
                            self.clusters.len() - 1
                        }
                    }
                }
            };
            let items = &mut self.clusters[section].items;
            match direction {
                Direction::Ascending => items.insert(0, MessageItem::Message(row)),
                Direction::Descending => items.push(MessageItem::Message(row)),
            }
        }

        let mut diff = ClusterDiff {
            direction: Some(direction),
            ..ClusterDiff::default()
        };
        for (section, cluster) in self.clusters.iter().enumerate() {
            if new_sections.contains(&cluster.date) {
                diff.inserted_sections.push(section);
            }
        }
        for id in &ids {
            if let Some(path) = self.position(id) {
                if !diff.inserted_sections.contains(&path.section) {
                    diff.inserted.push(path);
                }
            }
        }
        diff.inserted.sort();
        diff
    }

    /// Remove messages by id. Sections left without messages are dropped.
    pub fn remove(&mut self, ids: &[MessageId]) -> ClusterDiff {
        let before: Vec<IndexPath> = ids.iter().filter_map(|id| self.position(id)).collect();
        if before.is_empty() {
            return ClusterDiff::default();
        }

        for id in ids {
            if let Some(date) = self.index.remove(id) {
                if let Some(cluster) = self.clusters.iter_mut().find(|c| c.date == date) {
                    cluster.items.retain(|item| !item.is_message(id));
                }
            }
        }

        let emptied: Vec<usize> = self
            .clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.has_messages())
            .map(|(i, _)| i)
            .collect();
        for section in emptied.iter().rev() {
            self.clusters.remove(*section);
        }

        let mut removed: Vec<IndexPath> = before
            .into_iter()
            .filter(|p| !emptied.contains(&p.section))
            .collect();
        removed.sort();
        ClusterDiff {
            removed_sections: emptied,
            removed,
            ..ClusterDiff::default()
        }
    }

    /// Replace a clustered message in place, keeping its metadata.
    pub fn update(&mut self, message: Message) -> Option<IndexPath> {
        let path = self.position(&message.id)?;
        if let MessageItem::Message(row) = &mut self.clusters[path.section].items[path.row] {
            row.message = message;
        }
        Some(path)
    }

    /// Replace a clustered row, metadata included.
    pub fn replace(&mut self, new_row: MessageRow) -> Option<IndexPath> {
        let path = self.position(&new_row.message.id)?;
        self.clusters[path.section].items[path.row] = MessageItem::Message(new_row);
        Some(path)
    }

    pub fn divider_position(&self) -> Option<IndexPath> {
        self.clusters.iter().enumerate().find_map(|(section, c)| {
            c.items
                .iter()
                .position(|item| matches!(item, MessageItem::UnseenDivider))
                .map(|row| IndexPath::new(section, row))
        })
    }

    /// Place the unseen divider just above (older side of) `first_unseen`,
    /// replacing any existing divider.
    pub fn insert_unseen_divider(&mut self, first_unseen: &MessageId) -> ClusterDiff {
        let Some(target) = self.position(first_unseen) else {
            return ClusterDiff::default();
        };
        let mut diff = self.remove_unseen_divider();
        // Dropping the old divider may have shifted the target row.
        let target = self.position(first_unseen).unwrap_or(target);
        let path = IndexPath::new(target.section, target.row + 1);
        self.clusters[path.section]
            .items
            .insert(path.row, MessageItem::UnseenDivider);
        diff.inserted.push(path);
        diff
    }

    pub fn remove_unseen_divider(&mut self) -> ClusterDiff {
        let Some(path) = self.divider_position() else {
            return ClusterDiff::default();
        };
        self.clusters[path.section].items.remove(path.row);
        ClusterDiff {
            removed: vec![path],
            ..ClusterDiff::default()
        }
    }

    /// Sections strictly newest-first by date, messages strictly newest-first
    /// by `(timestamp, id)`, and every message in the section of its day.
    pub fn is_chronological(&self) -> bool {
        let dates_ok = self.clusters.windows(2).all(|w| w[0].date > w[1].date);
        let days_ok = self
            .clusters
            .iter()
            .all(|c| c.messages().all(|m| m.day_key(&self.offset) == c.date));
        let cursors: Vec<Cursor> = self.messages().map(Cursor::of).collect();
        let order_ok = cursors.windows(2).all(|w| w[0] > w[1]);
        dates_ok && days_ok && order_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn row(id: &str, ts: DateTime<Utc>) -> MessageRow {
        MessageRow::new(Message::text("c".into(), "alice".into(), id, ts, false).with_id(id))
    }

    fn ids(c: &MessageClusterer) -> Vec<String> {
        c.messages().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn empty_list_inserts_ascending_in_inverted_order() {
        let mut c = MessageClusterer::new(utc());
        let diff = c.insert(vec![row("b", at(1, 10)), row("a", at(1, 9)), row("c", at(2, 8))]);

        assert_eq!(diff.direction, Some(Direction::Ascending));
        assert_eq!(diff.inserted_sections, vec![0, 1]);
        assert!(diff.inserted.is_empty());
        assert_eq!(ids(&c), ["c", "b", "a"]);
        assert_eq!(c.clusters().len(), 2);
        assert!(c.is_chronological());
    }

    #[test]
    fn older_batch_appends_and_newer_batch_prepends() {
        let mut c = MessageClusterer::new(utc());
        c.insert(vec![row("m", at(3, 12))]);

        let older = c.insert(vec![row("k", at(3, 10)), row("l", at(3, 11))]);
        assert_eq!(older.direction, Some(Direction::Descending));
        assert_eq!(older.inserted, vec![IndexPath::new(0, 1), IndexPath::new(0, 2)]);

        let newer = c.insert(vec![row("n", at(3, 13))]);
        assert_eq!(newer.direction, Some(Direction::Ascending));
        assert_eq!(newer.inserted, vec![IndexPath::new(0, 0)]);

        assert_eq!(ids(&c), ["n", "m", "l", "k"]);
        assert_eq!(c.newest().unwrap().id.as_str(), "n");
        assert_eq!(c.oldest().unwrap().id.as_str(), "k");
        assert!(c.is_chronological());
    }

    #[test]
    fn insert_is_idempotent_and_dedupes_within_batch() {
        let mut c = MessageClusterer::new(utc());
        c.insert(vec![row("a", at(1, 1)), row("a", at(1, 1)), row("b", at(1, 2))]);
        assert_eq!(c.len(), 2);

        let snapshot = c.clusters().to_vec();
        let diff = c.insert(vec![row("a", at(1, 1)), row("b", at(1, 2))]);
        assert!(diff.is_empty());
        assert_eq!(c.clusters(), snapshot.as_slice());
    }

    #[test]
    fn same_timestamp_ties_break_on_id() {
        let mut c = MessageClusterer::new(utc());
        c.insert(vec![row("a", at(1, 5))]);
        c.insert(vec![row("b", at(1, 5))]);
        assert_eq!(ids(&c), ["b", "a"]);
        assert!(c.is_chronological());
    }

    #[test]
    fn removing_last_message_drops_the_section() {
        let mut c = MessageClusterer::new(utc());
        c.insert(vec![row("a", at(1, 1)), row("b", at(2, 1)), row("c", at(2, 2))]);

        let diff = c.remove(&["a".into(), "c".into()]);
        assert_eq!(diff.removed_sections, vec![1]);
        assert_eq!(diff.removed, vec![IndexPath::new(0, 0)]);
        assert_eq!(ids(&c), ["b"]);
        assert!(!c.contains(&"a".into()));

        assert!(c.remove(&["zzz".into()]).is_empty());
    }

    #[test]
    fn day_keys_follow_the_configured_offset() {
        let plus_three = FixedOffset::east_opt(3 * 3600).unwrap();
        let mut c = MessageClusterer::new(plus_three);
        // 22:00 UTC on the 1st is already the 2nd at UTC+3.
        c.insert(vec![row("late", at(1, 22)), row("early", at(1, 20))]);
        assert_eq!(c.clusters().len(), 2);
        assert_eq!(c.clusters()[0].date, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn divider_sits_above_the_first_unseen_message() {
        let mut c = MessageClusterer::new(utc());
        let base = at(4, 9);
        c.insert(
            (0..4)
                .map(|i| row(&format!("m{i}"), base + Duration::minutes(i)))
                .collect(),
        );

        let diff = c.insert_unseen_divider(&"m2".into());
        assert_eq!(diff.inserted, vec![IndexPath::new(0, 2)]);
        assert_eq!(c.divider_position(), Some(IndexPath::new(0, 2)));
        assert_eq!(c.position(&"m1".into()), Some(IndexPath::new(0, 3)));

        // Moving it replaces the old one.
        c.insert_unseen_divider(&"m3".into());
        assert_eq!(c.divider_position(), Some(IndexPath::new(0, 1)));
        assert_eq!(c.newest().unwrap().id.as_str(), "m3");

        let removed = c.remove_unseen_divider();
        assert_eq!(removed.removed, vec![IndexPath::new(0, 1)]);
        assert_eq!(c.divider_position(), None);
        assert!(c.is_chronological());
    }

    #[test]
    fn update_keeps_position_and_metadata() {
        let mut c = MessageClusterer::new(utc());
        let mut first = row("a", at(1, 1));
        first.metadata.media = Some(bytes::Bytes::from_static(b"img"));
        c.insert(vec![first]);

        let mut edited = c.get(&"a".into()).unwrap().message.clone();
        edited.body = "edited".into();
        assert_eq!(c.update(edited), Some(IndexPath::new(0, 0)));

        let stored = c.get(&"a".into()).unwrap();
        assert_eq!(stored.message.body, "edited");
        assert!(stored.metadata.media.is_some());
    }
}
