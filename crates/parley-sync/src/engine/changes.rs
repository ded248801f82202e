//! Listener batches: classification, reconciliation with the local store,
//! and deletion checks.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use parley_shared::{MessageId, UserId};
use parley_store::{Message, MessageQuery, SortOrder};

use super::{follows_new_messages, torn_down, EngineInner};
use crate::cluster::{ClusterDiff, MessageRow};
use crate::error::Result;
use crate::events::{RowAnimation, SyncEvent};
use crate::remote::{ChangeEvent, ChangeType};

/// One listener batch grouped by change type.
#[derive(Debug, Default, PartialEq)]
pub(super) struct ChangeSet {
    pub added: Vec<Message>,
    pub modified: Vec<Message>,
    pub removed: Vec<MessageId>,
}

impl ChangeSet {
    /// Removal wins over any addition or modification of the same id in the
    /// batch. Repeated ids keep their last version.
    pub fn partition(batch: Vec<ChangeEvent>) -> Self {
        let removed_ids: HashSet<MessageId> = batch
            .iter()
            .filter(|e| e.change == ChangeType::Removed)
            .map(|e| e.message.id.clone())
            .collect();

        let mut set = Self::default();
        for ChangeEvent { message, change } in batch {
            match change {
                ChangeType::Removed => {
                    if !set.removed.contains(&message.id) {
                        set.removed.push(message.id);
                    }
                }
                _ if removed_ids.contains(&message.id) => {}
                ChangeType::Added => {
                    set.modified.retain(|m| m.id != message.id);
                    keep_last(&mut set.added, message);
                }
                ChangeType::Modified => {
                    // A modification of something added in the same batch is
                    // just a newer version of the addition.
                    match set.added.iter_mut().find(|m| m.id == message.id) {
                        Some(slot) => *slot = message,
                        None => keep_last(&mut set.modified, message),
                    }
                }
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

fn keep_last(list: &mut Vec<Message>, message: Message) {
    match list.iter_mut().find(|m| m.id == message.id) {
        Some(slot) => *slot = message,
        None => list.push(message),
    }
}

/// Whether the additions of a batch are news to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Arrival {
    /// Live additions; unseen ones raise the user's counter.
    New,
    /// A listener's attach snapshot. The counter already covers it.
    Snapshot,
}

/// Carry the local "seen by me" mark over to a remote copy that has not
/// caught up yet. Returns whether `incoming` changed.
pub(super) fn merge_local_seen(local: &Message, incoming: &mut Message, user: &UserId) -> bool {
    if &incoming.sender_id == user || !local.is_seen_by(user) || incoming.is_seen_by(user) {
        return false;
    }
    incoming.seen.mark_seen_by(user)
}

impl EngineInner {
    pub(super) async fn apply_changes(&self, batch: Vec<ChangeEvent>, arrival: Arrival) -> Result<()> {
        let conversation = self.conversation()?;
        let changes = ChangeSet::partition(batch);
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            conversation = %conversation.id,
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            ?arrival,
            "Processing remote changes"
        );

        let rows = self
            .metadata
            .fetch_all(changes.added, conversation.is_group)
            .await;

        // Pagination stays out until all three phases are applied.
        self.gate.wait_until_idle().await;
        let _serial = self.pagination_lock.lock().await;
        self.ensure_live()?;

        let follows = follows_new_messages(&conversation, self.user());
        self.apply_removed(&changes.removed).await?;
        self.apply_added(rows, follows && arrival == Arrival::New, follows)?;
        self.apply_modified(changes.modified)?;
        Ok(())
    }

    /// Merge local seen marks into freshly fetched rows.
    ///
    /// Returns how many rows are new to the local store and unseen by the
    /// current user.
    pub(super) fn merge_with_local(&self, rows: &mut [MessageRow]) -> Result<u32> {
        let user = self.user();
        let mut fresh_unseen = 0u32;
        for row in rows.iter_mut() {
            match self.local.get_message(&row.message.id)? {
                Some(local) => {
                    if merge_local_seen(&local, &mut row.message, user) {
                        debug!(message = %row.message.id, "Kept local seen mark");
                    }
                }
                None => {
                    if &row.message.sender_id != user && !row.message.is_seen_by(user) {
                        fresh_unseen += 1;
                    }
                }
            }
        }
        Ok(fresh_unseen)
    }

    pub(super) fn store_rows(&self, rows: &[MessageRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let messages: Vec<Message> = rows.iter().map(|r| r.message.clone()).collect();
        self.local.add_messages(&messages)?;
        Ok(())
    }

    /// Store added rows and replace their clustered copies. New rows join
    /// the window only when `extend` holds and the window reaches the head.
    fn apply_added(&self, mut rows: Vec<MessageRow>, count_unseen: bool, extend: bool) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let fresh_unseen = self.merge_with_local(&mut rows)?;
        self.store_rows(&rows)?;

        let (updated, inserted) = {
            let mut state = self.state();
            let mut updated = Vec::new();
            let mut new_rows = Vec::new();
            for row in rows {
                if state.clusters.contains(&row.message.id) {
                    updated.extend(state.clusters.replace(row));
                } else if extend && state.reached_newest {
                    new_rows.push(row);
                }
            }
            (ClusterDiff::updated(updated), state.clusters.insert(new_rows))
        };
        self.emit_diff(updated, RowAnimation::None);
        let animation = RowAnimation::for_insert(inserted.direction);
        self.emit_diff(inserted, animation);

        if count_unseen && fresh_unseen > 0 {
            if let Some(conversation) =
                self.unseen
                    .update_local(self.conversation_id(), self.user(), fresh_unseen, true)?
            {
                self.refresh_conversation(conversation);
            }
        }
        Ok(())
    }

    /// The remote version is stored as-is.
    fn apply_modified(&self, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.local.add_messages(&messages)?;
        let diff = {
            let mut state = self.state();
            let paths: Vec<_> = messages
                .into_iter()
                .filter_map(|m| state.clusters.update(m))
                .collect();
            ClusterDiff::updated(paths)
        };
        self.emit_diff(diff, RowAnimation::None);
        Ok(())
    }

    pub(super) async fn apply_removed(&self, ids: &[MessageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let deleted = self.local.remove_messages(ids)?;
        let (diff, recent_removed) = {
            let mut state = self.state();
            let diff = state.clusters.remove(ids);
            let recent_removed = state
                .conversation
                .as_ref()
                .and_then(|c| c.recent_message_id.as_ref())
                .is_some_and(|recent| ids.contains(recent));
            (diff, recent_removed)
        };
        debug!(conversation = %self.conversation_id(), requested = ids.len(), deleted, "Removed messages");
        self.emit_diff(diff, RowAnimation::Fade);

        if recent_removed {
            self.recompute_recent().await?;
        }
        Ok(())
    }

    /// Point the conversation at its newest remaining message, or at nothing.
    async fn recompute_recent(&self) -> Result<()> {
        let conversation_id = self.conversation_id();
        let query = MessageQuery::for_conversation(conversation_id.clone())
            .order(SortOrder::Descending)
            .limit(1);
        let head = self
            .local
            .query_messages(&query)?
            .into_iter()
            .next()
            .map(|m| m.id);

        if let Err(e) = self
            .remote
            .set_recent_message(conversation_id, head.as_ref())
            .await
        {
            self.emit_error("Failed to update recent message", &e.into());
        }

        let updated = self.local.update_conversation(conversation_id, &mut |c| {
            c.recent_message_id = head.clone();
        })?;
        if let Some(conversation) = updated {
            self.refresh_conversation(conversation);
        }
        info!(conversation = %conversation_id, recent = ?head, "Recent message recomputed");
        self.emit(SyncEvent::RecentMessageChanged { message_id: head });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion checks
    // ------------------------------------------------------------------

    pub(super) fn schedule_deletion_check(self: &Arc<Self>, ids: Vec<MessageId>) {
        let engine = Arc::downgrade(self);
        self.deletion.schedule(ids, async move {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(e) = engine.run_deletion_check().await {
                engine.emit_error("Deletion check failed", &e);
            }
        });
    }

    pub(super) async fn run_deletion_check(&self) -> Result<Vec<MessageId>> {
        self.ensure_live()?;
        let pending = self.deletion.take_pending();
        let deleted = match self
            .deletion
            .validate_for_deletion(self.conversation_id(), &pending)
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(conversation = %self.conversation_id(), count = pending.len(), "Deletion check failed, keeping ids pending");
                self.deletion.requeue(pending);
                return Err(e);
            }
        };
        if deleted.is_empty() {
            return Ok(deleted);
        }

        info!(conversation = %self.conversation_id(), count = deleted.len(), "Messages deleted remotely");
        self.gate.wait_until_idle().await;
        self.paginator
            .perform(async {
                let _serial = self.pagination_lock.lock().await;
                self.apply_removed(&deleted).await
            })
            .await
            .unwrap_or_else(|| Err(torn_down()))?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_store::SeenState;

    fn message(id: &str, sender: &str) -> Message {
        Message::text(
            "c".into(),
            sender.into(),
            id,
            Utc.with_ymd_and_hms(2024, 4, 4, 4, 4, 4).unwrap(),
            false,
        )
        .with_id(id)
    }

    #[test]
    fn removal_wins_within_a_batch() {
        let a = message("a", "them");
        let b = message("b", "them");
        let set = ChangeSet::partition(vec![
            ChangeEvent::added(a.clone()),
            ChangeEvent::modified(b.clone()),
            ChangeEvent::removed(a.clone()),
            ChangeEvent::added(b.clone()),
        ]);

        assert_eq!(set.removed, vec![a.id]);
        assert_eq!(set.added, vec![b]);
        assert!(set.modified.is_empty());
    }

    #[test]
    fn repeated_ids_keep_the_last_version() {
        let first = message("a", "them");
        let mut second = first.clone();
        second.body = "edited".into();
        let set = ChangeSet::partition(vec![
            ChangeEvent::modified(first.clone()),
            ChangeEvent::modified(second.clone()),
        ]);
        assert_eq!(set.modified, vec![second]);
    }

    #[test]
    fn local_seen_mark_survives_a_stale_echo() {
        let me = UserId::new("me");
        let mut local = message("a", "them");
        local.seen = SeenState::Private(true);
        let mut incoming = message("a", "them");
        incoming.body = "remote body".into();

        assert!(merge_local_seen(&local, &mut incoming, &me));
        assert!(incoming.is_seen_by(&me));
        assert_eq!(incoming.body, "remote body");

        // Own messages and already-seen copies are left alone.
        let mut mine = message("b", "me");
        assert!(!merge_local_seen(&local, &mut mine, &me));
        assert!(!mine.is_seen_by(&me));
    }
}
