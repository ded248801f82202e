//! Bidirectional pagination, local store first.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use parley_shared::{Direction, MessageId};
use parley_store::{Cursor, Message, MessageQuery, SortOrder};

use super::EngineInner;
use crate::cluster::{ClusterDiff, MessageRow};
use crate::error::Result;
use crate::events::RowAnimation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaginationOutcome {
    DidPaginate,
    NoMoreMessages,
}

/// Whether an ascending page ran into the conversation's recent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Boundary {
    NotReached,
    /// The recent message closed the page and was dropped from it.
    Dropped,
    /// The page held nothing but the recent message.
    OnlyBoundary,
}

/// Drop the recent message from the end of an ascending page; the upcoming
/// listener already delivers it.
pub(super) fn trim_boundary(page: &mut Vec<Message>, recent: Option<&MessageId>) -> Boundary {
    let Some(recent) = recent else {
        return Boundary::NotReached;
    };
    match page.last() {
        Some(last) if &last.id == recent => {
            if page.len() == 1 {
                Boundary::OnlyBoundary
            } else {
                page.pop();
                Boundary::Dropped
            }
        }
        _ => Boundary::NotReached,
    }
}

impl EngineInner {
    /// Extend the window from the local store. Returns whether anything was added.
    pub(super) async fn paginate_local(self: &Arc<Self>, ascending: bool) -> Result<bool> {
        let _serial = self.pagination_lock.lock().await;
        let _active = self.gate.begin();
        let conversation = self.conversation()?;

        let anchor = {
            let state = self.state();
            // Newer messages held locally may not be contiguous with the
            // window until the window reaches the head.
            if ascending && !state.reached_newest {
                return Ok(false);
            }
            let edge = if ascending {
                state.clusters.newest()
            } else {
                state.clusters.oldest()
            };
            edge.map(Cursor::of)
        };

        let query = MessageQuery::for_conversation(conversation.id.clone()).limit(self.config.page_size);
        let query = match anchor {
            Some(cursor) if ascending => query.after(cursor, false).order(SortOrder::Ascending),
            Some(cursor) => query.before(cursor, false).order(SortOrder::Descending),
            None => query.order(SortOrder::Descending),
        };
        let page = self.local.query_messages(&query)?;
        if page.is_empty() {
            debug!(conversation = %conversation.id, ascending, "Local store exhausted");
            return Ok(false);
        }

        let ids: Vec<MessageId> = page.iter().map(|m| m.id.clone()).collect();
        let rows = self.metadata.fetch_all(page, conversation.is_group).await;
        self.store_rows(&rows)?;

        let diff = {
            let mut state = self.state();
            let diff = state.clusters.insert(rows);
            if let Some(recent) = &conversation.recent_message_id {
                if state.clusters.contains(recent) {
                    state.reached_newest = true;
                }
            }
            diff
        };
        debug!(conversation = %conversation.id, ascending, count = ids.len(), "Paginated locally");
        let animation = RowAnimation::for_insert(diff.direction);
        self.emit_diff(diff, animation);

        self.schedule_deletion_check(ids);
        Ok(true)
    }

    /// Extend the window from the remote store.
    pub(super) async fn paginate_remote(
        self: &Arc<Self>,
        direction: Direction,
    ) -> Result<PaginationOutcome> {
        let _serial = self.pagination_lock.lock().await;
        let _active = self.gate.begin();
        let conversation = self.conversation()?;
        let ascending = direction.is_ascending();

        let anchor = {
            let state = self.state();
            let edge = if ascending {
                state.clusters.newest()
            } else {
                state.clusters.oldest()
            };
            edge.map(|m| m.id.clone())
        };

        let mut page = self
            .remote
            .fetch_page(
                &conversation.id,
                anchor.as_ref(),
                false,
                direction,
                self.config.page_size,
            )
            .await?;

        let recent = conversation.recent_message_id.as_ref();
        let boundary = if ascending {
            trim_boundary(&mut page, recent)
        } else {
            Boundary::NotReached
        };
        if boundary == Boundary::OnlyBoundary || page.is_empty() {
            if ascending {
                self.reach_newest(recent);
            }
            debug!(conversation = %conversation.id, ?direction, "No more remote messages");
            return Ok(PaginationOutcome::NoMoreMessages);
        }

        let mut rows = self.metadata.fetch_all(page, conversation.is_group).await;
        self.merge_with_local(&mut rows)?;
        self.store_rows(&rows)?;

        let window = rows
            .iter()
            .map(|r| &r.message)
            .min_by_key(|m| Cursor::of(m))
            .map(|m| (m.id.clone(), rows.len()));

        let diff = {
            let mut state = self.state();
            let diff = state.clusters.insert(rows);
            if recent.map_or(true, |id| state.clusters.contains(id)) {
                state.reached_newest = true;
            }
            diff
        };
        let animation = RowAnimation::for_insert(diff.direction);
        self.emit_diff(diff, animation);

        if boundary == Boundary::Dropped {
            self.reach_newest(recent);
        }
        if let Some((start_at, len)) = window {
            if let Err(e) = self.listen_window(&start_at, len) {
                warn!(conversation = %conversation.id, error = %e, "Could not watch paginated page");
            }
        }
        Ok(PaginationOutcome::DidPaginate)
    }

    /// The window now ends at the head of the conversation. Cluster the copy
    /// of the recent message the upcoming listener stored, if any.
    fn reach_newest(&self, recent: Option<&MessageId>) {
        let held = match recent.map(|id| self.local.get_message(id)) {
            Some(Ok(found)) => found,
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read recent message");
                None
            }
            None => None,
        };

        let diff = {
            let mut state = self.state();
            state.reached_newest = true;
            match held {
                Some(message) if !state.clusters.contains(&message.id) => {
                    state.clusters.insert(vec![MessageRow::new(message)])
                }
                _ => ClusterDiff::default(),
            }
        };
        self.emit_diff(diff, RowAnimation::Bottom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn page(ids: &[&str]) -> Vec<Message> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                Message::text(
                    "c".into(),
                    "them".into(),
                    *id,
                    Utc.with_ymd_and_hms(2024, 8, 8, 8, 0, 0).unwrap() + Duration::minutes(i as i64),
                    false,
                )
                .with_id(*id)
            })
            .collect()
    }

    #[test]
    fn boundary_message_is_dropped_from_a_longer_page() {
        let mut p = page(&["x", "recent"]);
        assert_eq!(trim_boundary(&mut p, Some(&"recent".into())), Boundary::Dropped);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].id.as_str(), "x");
    }

    #[test]
    fn lone_boundary_message_means_no_more() {
        let mut p = page(&["recent"]);
        assert_eq!(trim_boundary(&mut p, Some(&"recent".into())), Boundary::OnlyBoundary);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn pages_not_ending_on_recent_are_untouched() {
        let mut p = page(&["recent", "y"]);
        assert_eq!(trim_boundary(&mut p, Some(&"recent".into())), Boundary::NotReached);
        assert_eq!(p.len(), 2);
        assert_eq!(trim_boundary(&mut p, None), Boundary::NotReached);
    }
}
