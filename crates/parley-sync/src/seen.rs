//! Seen-status propagation, locally and to the remote store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use parley_shared::{ConversationId, MessageId, UserId};
use parley_store::{LocalStore, Message, MessageQuery, SeenState};

use crate::error::Result;
use crate::remote::{RemoteStore, UnseenPageQuery};

pub struct SeenStatusSyncService {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    batch_size: usize,
}

impl SeenStatusSyncService {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>, batch_size: usize) -> Self {
        Self {
            local,
            remote,
            batch_size: batch_size.max(1),
        }
    }

    /// Mark every local message at or before `from` and not sent by `user`
    /// as seen by `user`.
    ///
    /// Returns the messages that actually changed; their number is the
    /// unseen-counter decrement.
    pub fn update_locally(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        is_group: bool,
        from: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let query = MessageQuery::for_conversation(conversation_id.clone())
            .at_or_before(from)
            .sender_not(user.clone())
            .not_seen_by(user.clone());

        let changed = self.local.update_messages(&query, &mut |message| {
            if message.seen.is_group() != is_group {
                message.seen = SeenState::unseen(is_group);
            }
            message.seen.mark_seen_by(user)
        })?;

        debug!(conversation = %conversation_id, count = changed.len(), "Marked messages seen locally");
        Ok(changed)
    }

    /// Mark remote messages up to `from` as seen by `reader`, one atomic
    /// batch per page.
    ///
    /// Groups record the reader in each message's reader set; private
    /// conversations flip the single flag. Stops on a short page or once
    /// `limit` messages were written. Returns the number written.
    pub async fn update_remote(
        &self,
        from: &MessageId,
        conversation_id: &ConversationId,
        reader: &UserId,
        is_group: bool,
        limit: Option<usize>,
    ) -> Result<usize> {
        let up_to = match self.local.get_message(from)? {
            Some(anchor) => anchor.timestamp,
            None => self.remote.fetch_message(conversation_id, from).await?.timestamp,
        };
        let seen_by = is_group.then_some(reader);

        let mut written = 0;
        let mut start_after: Option<MessageId> = None;
        loop {
            let want = match limit {
                Some(limit) => self.batch_size.min(limit.saturating_sub(written)),
                None => self.batch_size,
            };
            if want == 0 {
                break;
            }

            let query = UnseenPageQuery {
                reader: reader.clone(),
                up_to,
                start_after: start_after.take(),
                limit: want,
            };
            let page = self.remote.query_unseen_page(conversation_id, &query).await?;
            if page.is_empty() {
                break;
            }

            self.remote
                .commit_seen_batch(conversation_id, &page, seen_by)
                .await?;
            written += page.len();
            debug!(conversation = %conversation_id, batch = page.len(), written, "Committed seen batch");

            if page.len() < want {
                break;
            }
            start_after = page.last().cloned();
        }

        info!(conversation = %conversation_id, written, "Remote seen status updated");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use chrono::{Duration, TimeZone};
    use parley_store::{Conversation, Database};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 9, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn unseen(n: i64, is_group: bool) -> Vec<Message> {
        (0..n)
            .map(|i| {
                Message::text("c".into(), "them".into(), "hi", at(i), is_group)
                    .with_id(format!("m{i:04}"))
            })
            .collect()
    }

    fn service(is_group: bool, n: i64) -> (SeenStatusSyncService, Arc<Database>, Arc<MemoryRemote>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        remote.insert_conversation(Conversation::new("c".into(), is_group, ["me".into(), "them".into()]));
        remote.seed_messages(unseen(n, is_group));
        let service = SeenStatusSyncService::new(db.clone(), remote.clone(), 500);
        (service, db, remote)
    }

    #[tokio::test]
    async fn remote_update_pages_through_more_than_one_batch() {
        let (service, _, remote) = service(true, 600);
        let written = service
            .update_remote(&"m0599".into(), &"c".into(), &"me".into(), true, None)
            .await
            .unwrap();

        assert_eq!(written, 600);
        assert_eq!(remote.seen_commits(), vec![500, 100]);
        assert!(remote
            .messages(&"c".into())
            .iter()
            .all(|m| m.is_seen_by(&"me".into())));
    }

    #[tokio::test]
    async fn full_last_page_ends_on_the_empty_follow_up() {
        let (service, _, remote) = service(false, 500);
        service
            .update_remote(&"m0499".into(), &"c".into(), &"me".into(), false, None)
            .await
            .unwrap();
        assert_eq!(remote.seen_commits(), vec![500]);
    }

    #[tokio::test]
    async fn remote_update_respects_anchor_and_limit() {
        let (service, _, remote) = service(false, 20);
        let written = service
            .update_remote(&"m0009".into(), &"c".into(), &"me".into(), false, Some(4))
            .await
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(remote.seen_commits(), vec![4]);

        let written = service
            .update_remote(&"m0009".into(), &"c".into(), &"me".into(), false, None)
            .await
            .unwrap();
        // Only m0000..=m0009 are at or before the anchor.
        assert_eq!(written, 6);
    }

    #[test]
    fn local_update_counts_only_real_changes() {
        let (service, db, _) = service(true, 0);
        let mut messages = unseen(5, true);
        messages[0].seen.mark_seen_by(&"me".into());
        messages[1].sender_id = "me".into();
        db.upsert_messages(&messages).unwrap();

        let changed = service
            .update_locally(&"c".into(), &"me".into(), true, at(3))
            .unwrap();
        let ids: Vec<_> = changed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m0002", "m0003"]);

        let again = service
            .update_locally(&"c".into(), &"me".into(), true, at(3))
            .unwrap();
        assert!(again.is_empty());
    }
}
