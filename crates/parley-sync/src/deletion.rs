//! Detection of messages deleted remotely while they sat in the local store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::try_join_all;
use tracing::debug;

use parley_shared::{ConversationId, MessageId};

use crate::debounce::Debouncer;
use crate::error::Result;
use crate::remote::RemoteStore;

pub struct DeletionReconciler {
    remote: Arc<dyn RemoteStore>,
    chunk: usize,
    pending: Mutex<Vec<MessageId>>,
    debouncer: Debouncer,
}

impl DeletionReconciler {
    pub fn new(remote: Arc<dyn RemoteStore>, chunk: usize, debounce: Duration) -> Self {
        Self {
            remote,
            chunk: chunk.max(1),
            pending: Mutex::new(Vec::new()),
            debouncer: Debouncer::new(debounce),
        }
    }

    /// The subset of `ids` that no longer exists remotely, in input order.
    pub async fn validate_for_deletion(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let lookups = ids
            .chunks(self.chunk)
            .map(|chunk| self.remote.existing_ids(conversation_id, chunk));
        let existing: HashSet<MessageId> = try_join_all(lookups).await?.into_iter().flatten().collect();

        let deleted: Vec<MessageId> = ids
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect();
        debug!(conversation = %conversation_id, checked = ids.len(), deleted = deleted.len(), "Validated ids");
        Ok(deleted)
    }

    /// Add ids to the next check and re-arm the timer with `check`.
    pub fn schedule<F>(&self, ids: impl IntoIterator<Item = MessageId>, check: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut pending = self.lock();
            for id in ids {
                if !pending.contains(&id) {
                    pending.push(id);
                }
            }
        }
        self.debouncer.schedule(check);
    }

    pub fn take_pending(&self) -> Vec<MessageId> {
        std::mem::take(&mut *self.lock())
    }

    /// Put ids back ahead of anything scheduled since they were taken.
    /// The timer is left alone; the next trigger or a manual check picks
    /// them up.
    pub fn requeue(&self, ids: Vec<MessageId>) {
        let mut pending = self.lock();
        let later = std::mem::replace(&mut *pending, ids);
        for id in later {
            if !pending.contains(&id) {
                pending.push(id);
            }
        }
    }

    pub fn cancel(&self) {
        self.debouncer.cancel();
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MessageId>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use parley_store::{Conversation, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn remote_with(n: i64) -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote.insert_conversation(Conversation::new("c".into(), false, ["a".into(), "b".into()]));
        remote.seed_messages((0..n).map(|i| {
            Message::text(
                "c".into(),
                "a".into(),
                "x",
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(i),
                false,
            )
            .with_id(format!("m{i}"))
        }));
        remote
    }

    #[tokio::test]
    async fn chunks_queries_and_keeps_input_order() {
        let remote = remote_with(20);
        let reconciler = DeletionReconciler::new(remote.clone(), 10, Duration::from_secs(2));

        let mut ids: Vec<MessageId> = (0..20).map(|i| MessageId::new(format!("m{i}"))).collect();
        ids.insert(3, "gone-1".into());
        ids.push("gone-2".into());
        remote.delete_message(&"c".into(), &"m7".into());

        let deleted = reconciler.validate_for_deletion(&"c".into(), &ids).await.unwrap();
        assert_eq!(
            deleted,
            vec![MessageId::from("gone-1"), "m7".into(), "gone-2".into()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_coalesce_into_one_check() {
        let reconciler = DeletionReconciler::new(remote_with(0), 10, Duration::from_secs(2));
        let runs = Arc::new(AtomicUsize::new(0));

        for batch in [["a", "b"], ["b", "c"]] {
            let runs = runs.clone();
            reconciler.schedule(batch.map(MessageId::from), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let pending: Vec<_> = reconciler.take_pending().iter().map(|id| id.to_string()).collect();
        assert_eq!(pending, ["a", "b", "c"]);
        assert!(reconciler.take_pending().is_empty());
    }

    #[tokio::test]
    async fn requeued_ids_go_first_without_duplicates() {
        let reconciler = DeletionReconciler::new(remote_with(0), 10, Duration::from_secs(2));
        reconciler.schedule(["a", "b"].map(MessageId::from), async {});
        let taken = reconciler.take_pending();
        reconciler.schedule(["b", "c"].map(MessageId::from), async {});
        reconciler.requeue(taken);

        let pending: Vec<_> = reconciler.take_pending().iter().map(|id| id.to_string()).collect();
        assert_eq!(pending, ["a", "b", "c"]);
    }
}
