//! A scripted conversation session against the in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use parley_shared::{ConversationId, Direction, MessageId, UserId};
use parley_store::{Conversation, LocalStore, Message, MessageKind, UserProfile};
use parley_sync::remote::memory::{MemoryMetadata, MemoryRemote};
use parley_sync::{ConversationSyncEngine, PaginationOutcome, SyncConfig, SyncEvent, SyncSession};

use crate::config::SimConfig;

/// Upper bound on pagination rounds per direction.
const MAX_PAGES: usize = 64;

pub struct Scenario {
    config: SimConfig,
    me: UserId,
    peer: UserId,
    conversation: Conversation,
    remote: Arc<MemoryRemote>,
    metadata: Arc<MemoryMetadata>,
}

impl Scenario {
    pub fn new(config: SimConfig) -> Self {
        let me = UserId::new(config.user.clone());
        let peer = UserId::new("bob");
        let mut members = vec![me.clone(), peer.clone()];
        if config.group {
            members.push(UserId::new("carol"));
        }
        let id = ConversationId::new(if config.group { "sim-group" } else { "sim-chat" });
        let mut conversation = Conversation::new(id, config.group, members);
        conversation.name = config.group.then(|| "Simulated group".to_string());
        let unseen = (config.history.saturating_sub(config.unseen)..config.history)
            .filter(|&i| !sent_by_me(i))
            .count();
        if let Some(p) = conversation.participant_mut(&me) {
            p.unseen_count = u32::try_from(unseen).unwrap_or(u32::MAX);
        }

        Self {
            config,
            me,
            peer,
            conversation,
            remote: Arc::new(MemoryRemote::new()),
            metadata: Arc::new(MemoryMetadata::new()),
        }
    }

    /// Fill the remote with a history spread over several days.
    pub fn seed(&self) {
        self.remote.insert_conversation(self.conversation.clone());
        for member in &self.conversation.participants {
            self.metadata.insert_profile(UserProfile {
                id: member.user_id.clone(),
                display_name: member.user_id.as_str().to_uppercase(),
                avatar_path: None,
            });
        }

        let total = self.config.history;
        let first_unseen = total.saturating_sub(self.config.unseen);
        let start = Utc::now() - ChronoDuration::minutes(47 * total as i64);
        let mut history = Vec::with_capacity(total);
        for i in 0..total {
            let sender = if sent_by_me(i) { &self.me } else { &self.peer };
            let mut message = Message::text(
                self.conversation.id.clone(),
                sender.clone(),
                format!("message #{i}"),
                start + ChronoDuration::minutes(47 * i as i64),
                self.conversation.is_group,
            )
            .with_id(format!("msg-{i:05}"));
            if i < first_unseen || sender == &self.me {
                message.seen.mark_seen_by(&self.me);
            }
            if i % 15 == 7 {
                let path = format!("media/{i}.jpg");
                self.metadata.insert_media(path.clone(), vec![0xff_u8; 64]);
                message.kind = MessageKind::Image;
                message.media_path = Some(path);
            }
            if i % 20 == 19 {
                message.replied_to_id = Some(MessageId::new(format!("msg-{:05}", i - 1)));
            }
            history.push(message);
        }
        self.remote.seed_messages(history);
        info!(
            conversation = %self.conversation.id,
            total,
            unseen = self.config.unseen,
            "Seeded remote history"
        );
    }

    pub async fn run(&self, local: Arc<dyn LocalStore>, sync: SyncConfig) -> anyhow::Result<()> {
        let engine = ConversationSyncEngine::new(
            SyncSession::new(self.me.clone(), self.conversation.id.clone()),
            sync.clone(),
            local,
            self.remote.clone(),
            self.metadata.clone(),
        );
        let logger = tokio::spawn(log_events(engine.subscribe()));

        let strategy = engine.open().await.context("opening conversation")?;
        info!(
            anchor = ?strategy.anchor().map(|m| &m.id),
            loaded = engine.message_ids().len(),
            unseen = engine.unseen_count(),
            divider = ?engine.divider_position(),
            "Conversation open"
        );
        settle().await;

        self.paginate_all(&engine, Direction::Descending).await?;
        self.paginate_all(&engine, Direction::Ascending).await?;

        if let Some(newest) = engine.message_ids().first().cloned() {
            let marked = engine.mark_seen_up_to(&newest).await.context("marking seen")?;
            info!(marked, unseen = engine.unseen_count(), "Caught up");
        }

        // The peer keeps talking, edits and retracts something.
        let incoming = Message::text(
            self.conversation.id.clone(),
            self.peer.clone(),
            "are you there?",
            Utc::now(),
            self.conversation.is_group,
        );
        let incoming_id = incoming.id.clone();
        self.remote.seed_messages([incoming]);
        settle().await;
        self.remote.modify_message(&self.conversation.id, &incoming_id, |m| {
            m.body = "are you still there?".into();
            m.edited = true;
        });
        settle().await;
        if let Some(oldest) = engine.with_clusters(|c| c.oldest().map(|m| m.id.clone())) {
            self.remote.delete_message(&self.conversation.id, &oldest);
            settle().await;
        }

        let reply = Message::text(
            self.conversation.id.clone(),
            self.me.clone(),
            "yes, here",
            Utc::now(),
            self.conversation.is_group,
        );
        engine.send_message(reply).await.context("sending reply")?;
        settle().await;

        engine.flush_unseen_counters().await;
        tokio::time::sleep(sync.deletion_debounce + Duration::from_millis(100)).await;
        match engine.check_deletions().await {
            Ok(deleted) => debug!(count = deleted.len(), "Deletion check"),
            Err(e) => warn!(error = %e, "Deletion check failed"),
        }

        let remote_conversation = self.remote.conversation(&self.conversation.id);
        info!(
            loaded = engine.message_ids().len(),
            clusters = engine.clusters().len(),
            unseen = engine.unseen_count(),
            chronological = engine.with_clusters(|c| c.is_chronological()),
            remote_recent = ?remote_conversation.as_ref().and_then(|c| c.recent_message_id.clone()),
            peer_unseen = remote_conversation.map_or(0, |c| c.unseen_count_for(&self.peer)),
            seen_commits = ?self.remote.seen_commits(),
            "Session finished"
        );

        engine.teardown();
        settle().await;
        logger.abort();
        Ok(())
    }

    async fn paginate_all(&self, engine: &ConversationSyncEngine, direction: Direction) -> anyhow::Result<()> {
        for round in 1..=MAX_PAGES {
            let outcome = engine
                .paginate(direction)
                .await
                .with_context(|| format!("paginating {direction:?}"))?;
            debug!(?direction, round, ?outcome, loaded = engine.message_ids().len(), "Paginated");
            if outcome == PaginationOutcome::NoMoreMessages {
                return Ok(());
            }
            settle().await;
        }
        warn!(?direction, "Stopped paginating after {MAX_PAGES} rounds");
        Ok(())
    }
}

fn sent_by_me(index: usize) -> bool {
    index % 4 == 0
}

/// Give listener tasks a moment to drain.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn log_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Clusters { diff, animation }) => debug!(
                inserted = diff.inserted.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                sections = diff.inserted_sections.len(),
                ?animation,
                "Clusters changed"
            ),
            Ok(SyncEvent::UnseenCountChanged { count }) => info!(count, "Unseen count"),
            Ok(SyncEvent::RecentMessageChanged { message_id }) => {
                info!(recent = ?message_id, "Recent message")
            }
            Ok(SyncEvent::Error { message }) => warn!(%message, "Engine error"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::Database;

    #[tokio::test]
    async fn scripted_session_runs_against_an_in_memory_store() {
        let config = SimConfig {
            history: 40,
            unseen: 12,
            ..SimConfig::default()
        };
        let scenario = Scenario::new(config);
        scenario.seed();

        let local = Arc::new(Database::open_in_memory().unwrap());
        let sync = SyncConfig {
            page_size: 10,
            deletion_debounce: Duration::from_millis(10),
            unseen_debounce: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        scenario.run(local.clone(), sync).await.unwrap();

        let remote = scenario.remote.conversation(&scenario.conversation.id).unwrap();
        assert_eq!(remote.unseen_count_for(&scenario.me), 0);
        assert_eq!(remote.unseen_count_for(&scenario.peer), 1);
        assert_eq!(scenario.remote.active_listeners(), 0);
    }
}
