//! The per-conversation orchestrator.
//!
//! A [`ConversationSyncEngine`] owns the cluster list and the conversation
//! snapshot for one open conversation. Remote listener batches are run one
//! at a time through the [`RemoteMessagePaginator`]; manual pagination is
//! serialized separately and advertised through the [`PaginationGate`] so
//! listener work can wait for it. Shared state sits behind a std mutex that
//! is only ever held between suspension points.

mod changes;
mod pagination;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::constants::EVENT_CHANNEL_CAPACITY;
use parley_shared::{ConversationId, Direction, MessageId, UserId};
use parley_store::{Conversation, EntityKind, LocalStore, Message, StoreChange};

use crate::cluster::{ClusterDiff, IndexPath, MessageCluster, MessageClusterer, MessageRow};
use crate::config::SyncConfig;
use crate::deletion::DeletionReconciler;
use crate::error::{RemoteError, Result, SyncError};
use crate::events::{RowAnimation, SyncEvent};
use crate::metadata::{MetadataFetcher, MetadataSource};
use crate::paginator::{PaginationGate, RemoteMessagePaginator};
use crate::remote::{ChangeEvent, ChangeStream, ChangeType, RemoteStore};
use crate::seen::SeenStatusSyncService;
use crate::session::SyncSession;
use crate::strategy::{fetch_limit, select_strategy, FetchStrategy, LocalState};
use crate::unseen::UnseenCounterSyncService;

use changes::Arrival;
pub use pagination::PaginationOutcome;

#[derive(Debug, Clone, Copy)]
enum ListenerKind {
    /// The head of the conversation onwards.
    Upcoming,
    /// Edits and removals within a page already loaded.
    Window,
}

struct ConversationState {
    conversation: Option<Conversation>,
    clusters: MessageClusterer,
    /// Id of the oldest unseen message found on open.
    first_unseen: Option<MessageId>,
    /// Whether the clusters reach the newest message of the conversation.
    reached_newest: bool,
    torn_down: bool,
}

struct EngineInner {
    session: SyncSession,
    config: SyncConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    metadata: MetadataFetcher,
    state: Mutex<ConversationState>,
    paginator: RemoteMessagePaginator,
    gate: PaginationGate,
    pagination_lock: tokio::sync::Mutex<()>,
    seen: SeenStatusSyncService,
    unseen: UnseenCounterSyncService,
    deletion: DeletionReconciler,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Synchronizes one conversation between the local and the remote store.
pub struct ConversationSyncEngine {
    inner: Arc<EngineInner>,
}

impl ConversationSyncEngine {
    pub fn new(
        session: SyncSession,
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = EngineInner {
            metadata: MetadataFetcher::new(local.clone(), remote.clone(), metadata),
            seen: SeenStatusSyncService::new(local.clone(), remote.clone(), config.seen_batch_size),
            unseen: UnseenCounterSyncService::new(local.clone(), remote.clone(), config.unseen_debounce),
            deletion: DeletionReconciler::new(remote.clone(), config.id_query_chunk, config.deletion_debounce),
            state: Mutex::new(ConversationState {
                conversation: None,
                clusters: MessageClusterer::new(config.utc_offset),
                first_unseen: None,
                reached_newest: false,
                torn_down: false,
            }),
            paginator: RemoteMessagePaginator::new(),
            gate: PaginationGate::new(),
            pagination_lock: tokio::sync::Mutex::new(()),
            events,
            tasks: Mutex::new(Vec::new()),
            session,
            config,
            local,
            remote,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn session(&self) -> &SyncSession {
        &self.inner.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Load the conversation, fill the window with the selected strategy
    /// and start listening for remote changes.
    pub async fn open(&self) -> Result<FetchStrategy> {
        self.inner.open().await
    }

    /// Apply one listener batch, queued behind any batch in progress.
    pub async fn process_changes(&self, batch: Vec<ChangeEvent>) -> Result<()> {
        self.inner
            .paginator
            .perform(self.inner.apply_changes(batch, Arrival::New))
            .await
            .unwrap_or_else(|| Err(torn_down()))
    }

    pub async fn paginate_local(&self, ascending: bool) -> Result<bool> {
        self.inner.paginate_local(ascending).await
    }

    pub async fn paginate_remote(&self, direction: Direction) -> Result<PaginationOutcome> {
        self.inner.paginate_remote(direction).await
    }

    /// Local pages first, then the remote store.
    pub async fn paginate(&self, direction: Direction) -> Result<PaginationOutcome> {
        if self.inner.paginate_local(direction.is_ascending()).await? {
            return Ok(PaginationOutcome::DidPaginate);
        }
        self.inner.paginate_remote(direction).await
    }

    /// Mark everything up to and including `message_id` as seen by the
    /// current user. Returns how many local messages changed.
    pub async fn mark_seen_up_to(&self, message_id: &MessageId) -> Result<usize> {
        self.inner.mark_seen_up_to(message_id).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.send_message(message).await
    }

    /// Run the pending deletion check now instead of waiting for the debounce.
    pub async fn check_deletions(&self) -> Result<Vec<MessageId>> {
        self.inner.run_deletion_check().await
    }

    /// Push coalesced unseen-counter updates now.
    pub async fn flush_unseen_counters(&self) {
        self.inner.unseen.flush().await;
    }

    /// Stop listening and drop all pending work. Running work finishes;
    /// later calls fail with [`SyncError::Invariant`].
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.state().torn_down
    }

    pub fn conversation(&self) -> Option<Conversation> {
        self.inner.state().conversation.clone()
    }

    pub fn unseen_count(&self) -> u32 {
        let user = &self.inner.session.current_user;
        self.inner
            .state()
            .conversation
            .as_ref()
            .map_or(0, |c| c.unseen_count_for(user))
    }

    pub fn clusters(&self) -> Vec<MessageCluster> {
        self.inner.state().clusters.clusters().to_vec()
    }

    /// Clustered message ids, newest first.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.inner.state().clusters.message_ids()
    }

    pub fn divider_position(&self) -> Option<IndexPath> {
        self.inner.state().clusters.divider_position()
    }

    pub fn reached_newest(&self) -> bool {
        self.inner.state().reached_newest
    }

    /// Read the cluster list under the engine's lock.
    pub fn with_clusters<R>(&self, f: impl FnOnce(&MessageClusterer) -> R) -> R {
        f(&self.inner.state().clusters)
    }
}

/// Former group members keep a read-only window and see no new messages.
fn follows_new_messages(conversation: &Conversation, user: &UserId) -> bool {
    !conversation.is_group || conversation.is_member(user)
}

fn torn_down() -> SyncError {
    SyncError::Invariant("conversation session was torn down".into())
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn conversation_id(&self) -> &ConversationId {
        &self.session.conversation_id
    }

    fn user(&self) -> &UserId {
        &self.session.current_user
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state().torn_down {
            return Err(torn_down());
        }
        Ok(())
    }

    /// The opened conversation, or an invariant error before `open`.
    fn conversation(&self) -> Result<Conversation> {
        let state = self.state();
        if state.torn_down {
            return Err(torn_down());
        }
        state
            .conversation
            .clone()
            .ok_or_else(|| SyncError::Invariant("conversation is not open".into()))
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_diff(&self, diff: ClusterDiff, animation: RowAnimation) {
        if !diff.is_empty() {
            self.emit(SyncEvent::Clusters { diff, animation });
        }
    }

    fn emit_error(&self, context: &str, error: &SyncError) {
        warn!(conversation = %self.conversation_id(), error = %error, "{context}");
        self.emit(SyncEvent::Error {
            message: format!("{context}: {error}"),
        });
    }

    /// Replace the conversation snapshot, announcing counter changes.
    fn refresh_conversation(&self, conversation: Conversation) {
        let user = self.user();
        let (before, after) = {
            let mut state = self.state();
            let before = state.conversation.as_ref().map(|c| c.unseen_count_for(user));
            let after = conversation.unseen_count_for(user);
            state.conversation = Some(conversation);
            (before, after)
        };
        if before != Some(after) {
            self.emit(SyncEvent::UnseenCountChanged { count: after });
        }
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    async fn open(self: &Arc<Self>) -> Result<FetchStrategy> {
        self.ensure_live()?;
        let conversation_id = self.conversation_id().clone();

        let conversation = match self.remote.fetch_conversation(&conversation_id).await {
            Ok(conversation) => {
                self.local.upsert_conversation(&conversation)?;
                conversation
            }
            Err(RemoteError::NotFound(id)) => return Err(SyncError::NotFound(id)),
            Err(e) => {
                let Some(cached) = self.local.get_conversation(&conversation_id)? else {
                    return Err(SyncError::Remote(e));
                };
                warn!(conversation = %conversation_id, error = %e, "Remote unavailable, opening from the local store");
                return self.open_offline(cached).await;
            }
        };

        let local_state = LocalState::gather(
            self.local.as_ref(),
            self.remote.as_ref(),
            &conversation,
            self.user(),
            self.config.page_size,
        )
        .await?;
        // Held locally so a trimmed ascending page can still show it.
        if let Some(recent) = &local_state.recent {
            self.local.add_messages(std::slice::from_ref(recent))?;
        }
        let strategy = select_strategy(&conversation, &local_state);
        let limit = fetch_limit(&conversation, &local_state, self.config.page_size);
        info!(
            conversation = %conversation_id,
            history = ?local_state.history,
            strategy = strategy_name(&strategy),
            "Opening conversation"
        );

        let fetched = self.execute(&strategy, limit).await?;
        let mut rows = self.metadata.fetch_all(fetched, conversation.is_group).await;
        self.merge_with_local(&mut rows)?;
        self.store_rows(&rows)?;

        let first_unseen = local_state.first_unseen.as_ref().map(|m| m.id.clone());
        let recent = conversation.recent_message_id.clone();
        let diff = {
            let mut state = self.state();
            let mut diff = state.clusters.insert(rows);
            state.reached_newest = match &recent {
                Some(id) => state.clusters.contains(id),
                None => true,
            };
            if let Some(id) = &first_unseen {
                let divider = state.clusters.insert_unseen_divider(id);
                diff.inserted.extend(divider.inserted);
            }
            state.first_unseen = first_unseen;
            diff
        };
        self.refresh_conversation(conversation.clone());
        self.emit_diff(diff, RowAnimation::None);

        self.attach_listeners(&conversation)?;
        self.spawn_observer();
        Ok(strategy)
    }

    /// Show the newest locally held page. No listeners are attached; the
    /// caller reopens once the remote is reachable again.
    async fn open_offline(self: &Arc<Self>, conversation: Conversation) -> Result<FetchStrategy> {
        self.refresh_conversation(conversation);
        self.paginate_local(false).await?;
        self.spawn_observer();
        Ok(FetchStrategy::None)
    }

    async fn execute(&self, strategy: &FetchStrategy, limit: usize) -> Result<Vec<Message>> {
        let conversation_id = self.conversation_id();
        let messages = match strategy {
            FetchStrategy::Ascending { from, inclusive } => {
                self.remote
                    .fetch_page(conversation_id, Some(&from.id), *inclusive, Direction::Ascending, limit)
                    .await?
            }
            FetchStrategy::Descending { from, inclusive } => {
                self.remote
                    .fetch_page(conversation_id, Some(&from.id), *inclusive, Direction::Descending, limit)
                    .await?
            }
            FetchStrategy::Hybrid { from } => {
                let (mut older, newer) = tokio::try_join!(
                    self.remote
                        .fetch_page(conversation_id, Some(&from.id), false, Direction::Descending, limit),
                    self.remote
                        .fetch_page(conversation_id, Some(&from.id), true, Direction::Ascending, limit),
                )?;
                older.extend(newer);
                older
            }
            FetchStrategy::None => Vec::new(),
        };
        debug!(conversation = %conversation_id, count = messages.len(), "Fetched initial window");
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn attach_listeners(self: &Arc<Self>, conversation: &Conversation) -> Result<()> {
        let conversation_id = self.conversation_id();

        if follows_new_messages(conversation, self.user()) {
            let recent = conversation.recent_message_id.as_ref();
            let upcoming = match self.remote.listen_upcoming(conversation_id, recent) {
                Err(RemoteError::NotFound(_)) if recent.is_some() => {
                    let newest = self.state().clusters.newest().map(|m| m.id.clone());
                    debug!(conversation = %conversation_id, from = ?newest, "Recent message gone, listening from the window head");
                    self.remote.listen_upcoming(conversation_id, newest.as_ref())?
                }
                other => other?,
            };
            self.spawn_listener(upcoming, ListenerKind::Upcoming);
        } else {
            debug!(conversation = %conversation_id, "Not a member, skipping upcoming listener");
        }

        let window = {
            let state = self.state();
            state
                .clusters
                .oldest()
                .map(|m| (m.id.clone(), state.clusters.len()))
        };
        if let Some((oldest, len)) = window {
            self.listen_window(&oldest, len)?;
        }
        Ok(())
    }

    /// Watch modifications and removals of `len` messages starting at `start_at`.
    fn listen_window(self: &Arc<Self>, start_at: &MessageId, len: usize) -> Result<()> {
        let stream = self
            .remote
            .listen_existing(self.conversation_id(), start_at, true, len)?;
        self.spawn_listener(stream, ListenerKind::Window);
        Ok(())
    }

    fn spawn_listener(self: &Arc<Self>, mut stream: ChangeStream, kind: ListenerKind) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut arrival = Arrival::Snapshot;
            while let Some(item) = stream.next().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let current = std::mem::replace(&mut arrival, Arrival::New);
                let batch = match item {
                    Ok(batch) => batch,
                    Err(e) => {
                        engine.emit_error("Listener failed", &SyncError::from(e));
                        continue;
                    }
                };
                let batch = match kind {
                    ListenerKind::Upcoming => batch,
                    // Additions only ever repeat the window we already hold.
                    ListenerKind::Window => batch
                        .into_iter()
                        .filter(|e| e.change != ChangeType::Added)
                        .collect(),
                };
                if batch.is_empty() {
                    continue;
                }
                match engine
                    .paginator
                    .perform(engine.apply_changes(batch, current))
                    .await
                {
                    Some(Ok(())) => {}
                    Some(Err(e)) => engine.emit_error("Failed to apply remote changes", &e),
                    None => break,
                }
            }
        });
        self.track(handle);
    }

    /// Follow local writes to the conversation made by anyone.
    fn spawn_observer(self: &Arc<Self>) {
        let mut changes = self.local.observe();
        let engine: Weak<Self> = Arc::downgrade(self);
        let id = self.conversation_id().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Store observer lagged");
                        StoreChange::Changed {
                            entity: EntityKind::Conversation,
                            id: id.clone(),
                            fields: Vec::new(),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !change.is_about(EntityKind::Conversation, &id) {
                    continue;
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.local.get_conversation(engine.conversation_id()) {
                    Ok(Some(conversation)) => engine.refresh_conversation(conversation),
                    Ok(None) => debug!(conversation = %id, "Conversation removed locally"),
                    Err(e) => engine.emit_error("Failed to reload conversation", &e.into()),
                }
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    // ------------------------------------------------------------------
    // Seen / send
    // ------------------------------------------------------------------

    async fn mark_seen_up_to(&self, message_id: &MessageId) -> Result<usize> {
        let conversation = self.conversation()?;
        let conversation_id = &conversation.id;
        let user = self.user();

        let anchor = {
            let state = self.state();
            state.clusters.get(message_id).map(|row| row.message.timestamp)
        };
        let anchor = match anchor {
            Some(ts) => ts,
            None => match self.local.get_message(message_id)? {
                Some(message) => message.timestamp,
                None => self.remote.fetch_message(conversation_id, message_id).await?.timestamp,
            },
        };

        let changed = self
            .seen
            .update_locally(conversation_id, user, conversation.is_group, anchor)?;
        let count = changed.len();
        let diff = {
            let mut state = self.state();
            let paths: Vec<IndexPath> = changed
                .into_iter()
                .filter_map(|message| state.clusters.update(message))
                .collect();
            ClusterDiff::updated(paths)
        };
        self.emit_diff(diff, RowAnimation::None);

        if count > 0 {
            let delta = u32::try_from(count).unwrap_or(u32::MAX);
            if let Some(updated) = self.unseen.update_local(conversation_id, user, delta, false)? {
                self.refresh_conversation(updated);
            }
            self.unseen
                .schedule_remote_update(conversation_id, user, delta, false);

            if let Err(e) = self
                .seen
                .update_remote(message_id, conversation_id, user, conversation.is_group, Some(count))
                .await
            {
                self.emit_error("Remote seen update failed", &e);
            }
        }

        let cleared = {
            let mut state = self.state();
            let remaining = state
                .conversation
                .as_ref()
                .map_or(0, |c| c.unseen_count_for(user));
            if remaining == 0 && state.first_unseen.take().is_some() {
                Some(state.clusters.remove_unseen_divider())
            } else {
                None
            }
        };
        if let Some(diff) = cleared {
            self.emit_diff(diff, RowAnimation::Fade);
        }

        Ok(count)
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let conversation = self.conversation()?;
        if message.conversation_id != conversation.id {
            return Err(SyncError::Invariant(format!(
                "message {} belongs to conversation {}",
                message.id, message.conversation_id
            )));
        }
        if &message.sender_id != self.user() {
            return Err(SyncError::Invariant(format!(
                "message {} is not authored by the current user",
                message.id
            )));
        }

        self.local.add_messages(std::slice::from_ref(&message))?;
        let diff = self
            .state()
            .clusters
            .insert(vec![MessageRow::new(message.clone())]);
        self.emit_diff(diff, RowAnimation::Bottom);

        self.remote.add_message(&message).await?;
        self.remote
            .set_recent_message(&conversation.id, Some(&message.id))
            .await?;

        let updated = self.local.update_conversation(&conversation.id, &mut |c| {
            c.recent_message_id = Some(message.id.clone());
            c.message_count += 1;
        })?;
        if let Some(updated) = updated {
            self.refresh_conversation(updated);
        }
        self.emit(SyncEvent::RecentMessageChanged {
            message_id: Some(message.id.clone()),
        });

        if let Err(e) = self
            .unseen
            .update_participants_unseen_counter_remote(&conversation, self.user())
            .await
        {
            self.emit_error("Participant counter update failed", &e);
        }
        info!(conversation = %conversation.id, message = %message.id, "Message sent");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(&self) {
        {
            let mut state = self.state();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
        }
        self.abort_tasks();
        self.unseen.cancel();
        self.deletion.cancel();
        self.paginator.close();
        info!(conversation = %self.conversation_id(), "Conversation torn down");
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn strategy_name(strategy: &FetchStrategy) -> &'static str {
    match strategy {
        FetchStrategy::Ascending { .. } => "ascending",
        FetchStrategy::Descending { .. } => "descending",
        FetchStrategy::Hybrid { .. } => "hybrid",
        FetchStrategy::None => "none",
    }
}
