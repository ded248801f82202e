//! Per-participant unseen counters.
//!
//! Local updates are immediate. Remote updates are coalesced per
//! `(conversation, user)` into a single signed delta and pushed once the
//! debounce window has been quiet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use parley_shared::{ConversationId, UserId};
use parley_store::{Conversation, LocalStore};

use crate::debounce::Debouncer;
use crate::error::Result;
use crate::remote::RemoteStore;

type PendingDeltas = Arc<Mutex<HashMap<(ConversationId, UserId), i64>>>;

pub struct UnseenCounterSyncService {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    pending: PendingDeltas,
    debouncer: Debouncer,
}

impl UnseenCounterSyncService {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>, debounce: Duration) -> Self {
        Self {
            local,
            remote,
            pending: Arc::default(),
            debouncer: Debouncer::new(debounce),
        }
    }

    /// Adjust `user`'s counter in the local store, never below zero.
    pub fn update_local(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        delta: u32,
        increment: bool,
    ) -> Result<Option<Conversation>> {
        let updated = self.local.update_conversation(conversation_id, &mut |conversation| {
            if let Some(participant) = conversation.participant_mut(user) {
                participant.unseen_count = if increment {
                    participant.unseen_count.saturating_add(delta)
                } else {
                    participant.unseen_count.saturating_sub(delta)
                };
            }
        })?;
        Ok(updated)
    }

    /// Queue a remote counter change and re-arm the debounce timer.
    pub fn schedule_remote_update(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        delta: u32,
        increment: bool,
    ) {
        if delta == 0 {
            return;
        }
        let signed = if increment {
            i64::from(delta)
        } else {
            -i64::from(delta)
        };
        *lock(&self.pending)
            .entry((conversation_id.clone(), user.clone()))
            .or_insert(0) += signed;

        let remote = self.remote.clone();
        let pending = self.pending.clone();
        self.debouncer.schedule(async move {
            push_pending(remote.as_ref(), &pending).await;
        });
    }

    /// Push whatever is pending now.
    pub async fn flush(&self) {
        self.debouncer.cancel();
        push_pending(self.remote.as_ref(), &self.pending).await;
    }

    /// Drop pending deltas without pushing them.
    pub fn cancel(&self) {
        self.debouncer.cancel();
        lock(&self.pending).clear();
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.pending).values().any(|d| *d != 0)
    }

    /// Bump every other active participant's counter by one, in one call.
    pub async fn update_participants_unseen_counter_remote(
        &self,
        conversation: &Conversation,
        sender: &UserId,
    ) -> Result<()> {
        let recipients = conversation.other_members(sender);
        if recipients.is_empty() {
            return Ok(());
        }
        self.remote
            .increment_unseen_counters(&conversation.id, &recipients, 1)
            .await?;
        Ok(())
    }
}

fn lock(pending: &PendingDeltas) -> MutexGuard<'_, HashMap<(ConversationId, UserId), i64>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn push_pending(remote: &dyn RemoteStore, pending: &PendingDeltas) {
    let entries: Vec<_> = lock(pending).drain().filter(|(_, d)| *d != 0).collect();
    for ((conversation_id, user), delta) in entries {
        match remote
            .increment_unseen_counters(&conversation_id, std::slice::from_ref(&user), delta)
            .await
        {
            Ok(()) => debug!(conversation = %conversation_id, user = %user, delta, "Pushed unseen counter"),
            Err(e) => warn!(conversation = %conversation_id, user = %user, delta, error = %e, "Unseen counter update failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::CounterUpdate;
    use crate::remote::MemoryRemote;
    use parley_store::Database;

    fn setup() -> (UnseenCounterSyncService, Arc<Database>, Arc<MemoryRemote>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let conv = Conversation::new("c".into(), true, ["a".into(), "b".into(), "c".into()]);
        db.upsert_conversation(&conv).unwrap();
        remote.insert_conversation(conv);
        let service = UnseenCounterSyncService::new(db.clone(), remote.clone(), Duration::from_millis(750));
        (service, db, remote)
    }

    #[test]
    fn local_counter_never_goes_negative() {
        let (service, _, _) = setup();
        let conv = service.update_local(&"c".into(), &"a".into(), 2, true).unwrap().unwrap();
        assert_eq!(conv.unseen_count_for(&"a".into()), 2);

        let conv = service.update_local(&"c".into(), &"a".into(), 5, false).unwrap().unwrap();
        assert_eq!(conv.unseen_count_for(&"a".into()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_changes_coalesce_into_one_remote_call() {
        let (service, _, remote) = setup();
        for delta in [1, 2, 3] {
            service.schedule_remote_update(&"c".into(), &"a".into(), delta, false);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        service.schedule_remote_update(&"c".into(), &"a".into(), 1, true);
        assert!(remote.counter_updates().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            remote.counter_updates(),
            vec![CounterUpdate {
                conversation_id: "c".into(),
                participants: vec!["a".into()],
                delta: -5,
            }]
        );
        assert!(!service.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_updates() {
        let (service, _, remote) = setup();
        service.schedule_remote_update(&"c".into(), &"a".into(), 3, true);
        service.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(remote.counter_updates().is_empty());
    }

    #[tokio::test]
    async fn flush_pushes_immediately() {
        let (service, _, remote) = setup();
        service.schedule_remote_update(&"c".into(), &"b".into(), 2, true);
        service.flush().await;
        assert_eq!(remote.counter_updates().len(), 1);
        assert_eq!(
            remote.conversation(&"c".into()).unwrap().unseen_count_for(&"b".into()),
            2
        );
    }

    #[tokio::test]
    async fn send_bumps_everyone_but_the_sender_once() {
        let (service, db, remote) = setup();
        let mut conv = db.get_conversation(&"c".into()).unwrap();
        conv.participant_mut(&"c".into()).unwrap().is_deleted = true;

        service
            .update_participants_unseen_counter_remote(&conv, &"a".into())
            .await
            .unwrap();
        let calls = remote.counter_updates();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].participants, vec![UserId::from("b")]);
        assert_eq!(calls[0].delta, 1);
    }
}
