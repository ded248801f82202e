//! In-memory remote store.
//!
//! Models the parts of the remote document store the engine relies on:
//! `(timestamp, id)` ordering, cursor pagination, snapshot listeners that
//! report the current matches as `added` on attach, the 10-id cap on
//! existence queries and the 500-write cap on batch commits. The simulator
//! and the test suites use it in place of a real backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use parley_shared::constants::{REMOTE_IN_QUERY_LIMIT, SEEN_BATCH_LIMIT};
use parley_shared::{ConversationId, Direction, MessageId, UserId};
use parley_store::{Conversation, Cursor, Message, MessageQuery, SeenState, SortOrder, UserProfile};

use super::{ChangeEvent, ChangeStream, ChangeType, RemoteStore, UnseenPageQuery};
use crate::error::RemoteError;
use crate::metadata::MetadataSource;

/// A recorded `increment_unseen_counters` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub conversation_id: ConversationId,
    pub participants: Vec<UserId>,
    pub delta: i64,
}

enum ListenerScope {
    /// Everything at or after the cursor (everything when `None`).
    Upcoming(Option<Cursor>),
    /// A fixed set of documents.
    Window(HashSet<MessageId>),
}

struct Listener {
    conversation_id: ConversationId,
    scope: ListenerScope,
    tx: mpsc::UnboundedSender<Vec<ChangeEvent>>,
}

impl Listener {
    fn wants(&self, event: &ChangeEvent) -> bool {
        match &self.scope {
            ListenerScope::Upcoming(None) => true,
            ListenerScope::Upcoming(Some(start)) => Cursor::of(&event.message) >= *start,
            ListenerScope::Window(ids) => {
                event.change != ChangeType::Added && ids.contains(&event.message.id)
            }
        }
    }
}

#[derive(Default)]
struct RemoteState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    listeners: Vec<Listener>,
    seen_commits: Vec<usize>,
    counter_updates: Vec<CounterUpdate>,
    offline: bool,
}

impl RemoteState {
    fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn find(&self, conversation_id: &ConversationId, id: &MessageId) -> Result<Message, RemoteError> {
        self.messages(conversation_id)
            .iter()
            .find(|m| &m.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn notify(&mut self, conversation_id: &ConversationId, events: &[ChangeEvent]) {
        for listener in &self.listeners {
            if &listener.conversation_id != conversation_id {
                continue;
            }
            let batch: Vec<ChangeEvent> = events
                .iter()
                .filter(|e| listener.wants(e))
                .cloned()
                .collect();
            if !batch.is_empty() {
                let _ = listener.tx.send(batch);
            }
        }
        self.listeners.retain(|l| !l.tx.is_closed());
    }

    fn listen(
        &mut self,
        conversation_id: &ConversationId,
        scope: ListenerScope,
        initial: Vec<Message>,
    ) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        // The attach snapshot is delivered even when nothing matches.
        let _ = tx.send(initial.into_iter().map(ChangeEvent::added).collect());
        self.listeners.push(Listener {
            conversation_id: conversation_id.clone(),
            scope,
            tx,
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|batch| (Ok(batch), rx))
        })
        .boxed()
    }
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn online(&self) -> Result<MutexGuard<'_, RemoteState>, RemoteError> {
        let state = self.lock();
        if state.offline {
            return Err(RemoteError::Unavailable("remote store offline".into()));
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Test / simulation controls
    // ------------------------------------------------------------------

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.lock()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.lock().conversations.get(id).cloned()
    }

    /// All messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let state = self.lock();
        MessageQuery::for_conversation(conversation_id.clone()).apply(state.messages(conversation_id))
    }

    /// Insert messages as if written by other devices. Listeners are notified.
    pub fn seed_messages(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.lock();
        let mut by_conversation: HashMap<ConversationId, Vec<ChangeEvent>> = HashMap::new();
        for message in messages {
            let conversation_id = message.conversation_id.clone();
            let stored = state.messages.entry(conversation_id.clone()).or_default();
            stored.retain(|m| m.id != message.id);
            stored.push(message.clone());
            if let Some(conv) = state.conversations.get_mut(&conversation_id) {
                conv.message_count += 1;
            }
            by_conversation
                .entry(conversation_id)
                .or_default()
                .push(ChangeEvent::added(message));
        }
        for (conversation_id, events) in by_conversation {
            refresh_recent(&mut state, &conversation_id);
            state.notify(&conversation_id, &events);
        }
    }

    /// Delete a message as another device would. Returns `false` if absent.
    pub fn delete_message(&self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        let mut state = self.lock();
        let Ok(message) = state.find(conversation_id, id) else {
            return false;
        };
        if let Some(stored) = state.messages.get_mut(conversation_id) {
            stored.retain(|m| &m.id != id);
        }
        if let Some(conv) = state.conversations.get_mut(conversation_id) {
            conv.message_count = conv.message_count.saturating_sub(1);
        }
        state.notify(conversation_id, &[ChangeEvent::removed(message)]);
        true
    }

    /// Edit a message as another device would. Returns `false` if absent.
    pub fn modify_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
        mutation: impl FnOnce(&mut Message),
    ) -> bool {
        let mut state = self.lock();
        let Some(message) = state
            .messages
            .get_mut(conversation_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == id))
        else {
            return false;
        };
        mutation(message);
        let updated = message.clone();
        state.notify(conversation_id, &[ChangeEvent::modified(updated)]);
        true
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Size of every committed seen-status batch, in order.
    pub fn seen_commits(&self) -> Vec<usize> {
        self.lock().seen_commits.clone()
    }

    pub fn counter_updates(&self) -> Vec<CounterUpdate> {
        self.lock().counter_updates.clone()
    }

    /// Listeners whose stream is still alive.
    pub fn active_listeners(&self) -> usize {
        let mut state = self.lock();
        state.listeners.retain(|l| !l.tx.is_closed());
        state.listeners.len()
    }
}

fn refresh_recent(state: &mut RemoteState, conversation_id: &ConversationId) {
    let newest = state
        .messages(conversation_id)
        .iter()
        .max_by_key(|m| Cursor::of(m))
        .map(|m| m.id.clone());
    if let Some(conv) = state.conversations.get_mut(conversation_id) {
        conv.recent_message_id = newest;
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_conversation(&self, id: &ConversationId) -> Result<Conversation, RemoteError> {
        self.online()?
            .conversations
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        anchor: Option<&MessageId>,
        inclusive: bool,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Message>, RemoteError> {
        let state = self.online()?;
        let mut query = MessageQuery::for_conversation(conversation_id.clone()).limit(limit);
        if let Some(anchor) = anchor {
            let cursor = Cursor::of(&state.find(conversation_id, anchor)?);
            query = match direction {
                Direction::Ascending => query.after(cursor, inclusive),
                Direction::Descending => query.before(cursor, inclusive),
            };
        }
        query = query.order(match direction {
            Direction::Ascending => SortOrder::Ascending,
            Direction::Descending => SortOrder::Descending,
        });
        Ok(query.apply(state.messages(conversation_id)))
    }

    async fn fetch_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
    ) -> Result<Message, RemoteError> {
        self.online()?.find(conversation_id, id)
    }

    async fn first_unseen_message(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<Option<Message>, RemoteError> {
        let state = self.online()?;
        let query = MessageQuery::for_conversation(conversation_id.clone())
            .sender_not(reader.clone())
            .not_seen_by(reader.clone())
            .limit(1);
        Ok(query.apply(state.messages(conversation_id)).into_iter().next())
    }

    fn listen_upcoming(
        &self,
        conversation_id: &ConversationId,
        start_at: Option<&MessageId>,
    ) -> Result<ChangeStream, RemoteError> {
        let mut state = self.online()?;
        let start = match start_at {
            Some(id) => Some(Cursor::of(&state.find(conversation_id, id)?)),
            None => None,
        };
        let mut query = MessageQuery::for_conversation(conversation_id.clone());
        if let Some(cursor) = &start {
            query = query.after(cursor.clone(), true);
        }
        let initial = query.apply(state.messages(conversation_id));
        debug!(conversation = %conversation_id, initial = initial.len(), "upcoming listener attached");
        Ok(state.listen(conversation_id, ListenerScope::Upcoming(start), initial))
    }

    fn listen_existing(
        &self,
        conversation_id: &ConversationId,
        start_at: &MessageId,
        ascending: bool,
        limit: usize,
    ) -> Result<ChangeStream, RemoteError> {
        let mut state = self.online()?;
        let cursor = Cursor::of(&state.find(conversation_id, start_at)?);
        let query = MessageQuery::for_conversation(conversation_id.clone()).limit(limit);
        let query = if ascending {
            query.after(cursor, true).order(SortOrder::Ascending)
        } else {
            query.before(cursor, true).order(SortOrder::Descending)
        };
        let window = query.apply(state.messages(conversation_id));
        let ids = window.iter().map(|m| m.id.clone()).collect();
        debug!(conversation = %conversation_id, window = window.len(), "existing listener attached");
        Ok(state.listen(conversation_id, ListenerScope::Window(ids), window))
    }

    async fn query_unseen_page(
        &self,
        conversation_id: &ConversationId,
        query: &UnseenPageQuery,
    ) -> Result<Vec<MessageId>, RemoteError> {
        let state = self.online()?;
        let after = match &query.start_after {
            Some(id) => Some(Cursor::of(&state.find(conversation_id, id)?)),
            None => None,
        };
        let matches = MessageQuery::for_conversation(conversation_id.clone())
            .sender_not(query.reader.clone())
            .not_seen_by(query.reader.clone())
            .at_or_before(query.up_to)
            .apply(state.messages(conversation_id));
        Ok(matches
            .into_iter()
            .filter(|m| after.as_ref().map_or(true, |c| Cursor::of(m) > *c))
            .take(query.limit)
            .map(|m| m.id)
            .collect())
    }

    async fn commit_seen_batch(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
        seen_by: Option<&UserId>,
    ) -> Result<(), RemoteError> {
        if ids.len() > SEEN_BATCH_LIMIT {
            return Err(RemoteError::Rejected(format!(
                "batch of {} writes exceeds {SEEN_BATCH_LIMIT}",
                ids.len()
            )));
        }

        let mut state = self.online()?;
        let wanted: HashSet<&MessageId> = ids.iter().collect();
        let mut changed = Vec::new();
        if let Some(messages) = state.messages.get_mut(conversation_id) {
            for message in messages.iter_mut().filter(|m| wanted.contains(&m.id)) {
                let flipped = match (&mut message.seen, seen_by) {
                    (SeenState::Group(readers), Some(user)) => readers.insert(user.clone()),
                    (SeenState::Private(seen), None) => !std::mem::replace(seen, true),
                    _ => {
                        return Err(RemoteError::Rejected(format!(
                            "seen semantics mismatch on {}",
                            message.id
                        )))
                    }
                };
                if flipped {
                    changed.push(ChangeEvent::modified(message.clone()));
                }
            }
        }
        state.seen_commits.push(ids.len());
        state.notify(conversation_id, &changed);
        Ok(())
    }

    async fn existing_ids(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, RemoteError> {
        if ids.len() > REMOTE_IN_QUERY_LIMIT {
            return Err(RemoteError::Rejected(format!(
                "'in' query with {} ids exceeds {REMOTE_IN_QUERY_LIMIT}",
                ids.len()
            )));
        }
        let state = self.online()?;
        let messages = state.messages(conversation_id);
        Ok(ids
            .iter()
            .filter(|id| messages.iter().any(|m| &m.id == *id))
            .cloned()
            .collect())
    }

    async fn increment_unseen_counters(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
        delta: i64,
    ) -> Result<(), RemoteError> {
        let mut state = self.online()?;
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| RemoteError::NotFound(conversation_id.to_string()))?;
        for participant in conv
            .participants
            .iter_mut()
            .filter(|p| participants.contains(&p.user_id))
        {
            let next = (i64::from(participant.unseen_count) + delta).clamp(0, i64::from(u32::MAX));
            participant.unseen_count = next as u32;
        }
        state.counter_updates.push(CounterUpdate {
            conversation_id: conversation_id.clone(),
            participants: participants.to_vec(),
            delta,
        });
        Ok(())
    }

    async fn set_recent_message(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<(), RemoteError> {
        let mut state = self.online()?;
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| RemoteError::NotFound(conversation_id.to_string()))?;
        conv.recent_message_id = message_id.cloned();
        Ok(())
    }

    async fn add_message(&self, message: &Message) -> Result<(), RemoteError> {
        let mut state = self.online()?;
        let conversation_id = message.conversation_id.clone();
        let stored = state.messages.entry(conversation_id.clone()).or_default();
        let existed = stored.iter().any(|m| m.id == message.id);
        stored.retain(|m| m.id != message.id);
        stored.push(message.clone());
        if !existed {
            if let Some(conv) = state.conversations.get_mut(&conversation_id) {
                conv.message_count += 1;
            }
        }
        let event = if existed {
            ChangeEvent::modified(message.clone())
        } else {
            ChangeEvent::added(message.clone())
        };
        state.notify(&conversation_id, &[event]);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// In-memory media blobs and user profiles.
#[derive(Default)]
pub struct MemoryMetadata {
    media: Mutex<HashMap<String, Bytes>>,
    profiles: Mutex<HashMap<UserId, UserProfile>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_media(&self, path: impl Into<String>, bytes: impl Into<Bytes>) {
        self.media
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.into(), bytes.into());
    }

    pub fn insert_profile(&self, profile: UserProfile) {
        self.profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl MetadataSource for MemoryMetadata {
    async fn fetch_media(&self, path: &str) -> Result<Bytes, RemoteError> {
        self.media
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn fetch_profile(&self, user: &UserId) -> Result<UserProfile, RemoteError> {
        self.profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(user)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(user.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn conv_id() -> ConversationId {
        "conv".into()
    }

    fn message(id: &str, minutes: i64) -> Message {
        Message::text(
            conv_id(),
            "alice".into(),
            id,
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes),
            false,
        )
        .with_id(id)
    }

    fn seeded(n: i64) -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.insert_conversation(Conversation::new(conv_id(), false, ["alice".into(), "bob".into()]));
        remote.seed_messages((0..n).map(|i| message(&format!("m{i}"), i)));
        remote
    }

    #[tokio::test]
    async fn descending_page_is_newest_first_and_exclusive() {
        let remote = seeded(5);
        let page = remote
            .fetch_page(&conv_id(), Some(&"m3".into()), false, Direction::Descending, 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
        assert_eq!(
            remote.conversation(&conv_id()).unwrap().recent_message_id,
            Some("m4".into())
        );
    }

    #[tokio::test]
    async fn existing_ids_enforces_the_in_query_cap() {
        let remote = seeded(1);
        let ids: Vec<MessageId> = (0..11).map(|i| MessageId::new(format!("m{i}"))).collect();
        assert!(matches!(
            remote.existing_ids(&conv_id(), &ids).await,
            Err(RemoteError::Rejected(_))
        ));
        assert_eq!(
            remote.existing_ids(&conv_id(), &ids[..2]).await.unwrap(),
            vec![MessageId::new("m0")]
        );
    }

    #[tokio::test]
    async fn upcoming_listener_reports_snapshot_then_changes() {
        let remote = seeded(3);
        let mut stream = remote.listen_upcoming(&conv_id(), Some(&"m2".into())).unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].change, ChangeType::Added);

        remote.seed_messages([message("m3", 3)]);
        assert!(remote.delete_message(&conv_id(), &"m0".into()));
        // m0 is before the listener's start, so only m3 arrives.
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next[0].message.id.as_str(), "m3");

        drop(stream);
        assert_eq!(remote.active_listeners(), 0);
    }

    #[tokio::test]
    async fn empty_attach_snapshot_is_still_delivered() {
        let remote = seeded(3);
        let mut stream = remote.listen_upcoming(&conv_id(), None).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 3);

        let mut stream = remote.listen_upcoming(&"elsewhere".into(), None).unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_remote_is_unavailable() {
        let remote = seeded(1);
        remote.set_offline(true);
        assert!(matches!(
            remote.fetch_conversation(&conv_id()).await,
            Err(RemoteError::Unavailable(_))
        ));
    }
}
