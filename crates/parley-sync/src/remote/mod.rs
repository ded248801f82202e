//! The remote document store seam.
//!
//! The remote store is the source of truth. The engine reaches it only
//! through [`RemoteStore`]; retries and timeouts are the adapter's business.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use parley_shared::{ConversationId, Direction, MessageId, UserId};
use parley_store::{Conversation, Message};

use crate::error::RemoteError;

pub use memory::MemoryRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// One document change delivered by a listener snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub message: Message,
    pub change: ChangeType,
}

impl ChangeEvent {
    pub fn added(message: Message) -> Self {
        Self {
            message,
            change: ChangeType::Added,
        }
    }

    pub fn modified(message: Message) -> Self {
        Self {
            message,
            change: ChangeType::Modified,
        }
    }

    pub fn removed(message: Message) -> Self {
        Self {
            message,
            change: ChangeType::Removed,
        }
    }
}

/// Listener output: one item per snapshot, each carrying its document changes.
pub type ChangeStream = BoxStream<'static, Result<Vec<ChangeEvent>, RemoteError>>;

/// One page of the "messages not yet seen by `reader`" query used by the
/// paginated seen-status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnseenPageQuery {
    pub reader: UserId,
    /// Only messages at or before this instant.
    pub up_to: DateTime<Utc>,
    /// Resume strictly after this document.
    pub start_after: Option<MessageId>,
    pub limit: usize,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_conversation(&self, id: &ConversationId) -> Result<Conversation, RemoteError>;

    /// Ordered page relative to `anchor`: ascending pages are oldest first,
    /// descending pages newest first. Without an anchor the page starts at
    /// the oldest (ascending) or newest (descending) message.
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        anchor: Option<&MessageId>,
        inclusive: bool,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Message>, RemoteError>;

    async fn fetch_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
    ) -> Result<Message, RemoteError>;

    /// Oldest message not sent by and not seen by `reader`.
    async fn first_unseen_message(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Result<Option<Message>, RemoteError>;

    /// Messages at or after `start_at` (all messages when `None`), live.
    /// The first item is the attach snapshot: the current matches reported
    /// as added, delivered even when empty.
    fn listen_upcoming(
        &self,
        conversation_id: &ConversationId,
        start_at: Option<&MessageId>,
    ) -> Result<ChangeStream, RemoteError>;

    /// A fixed window of `limit` messages starting at `start_at`, live.
    /// The first item is the attach snapshot reporting the window as added.
    fn listen_existing(
        &self,
        conversation_id: &ConversationId,
        start_at: &MessageId,
        ascending: bool,
        limit: usize,
    ) -> Result<ChangeStream, RemoteError>;

    async fn query_unseen_page(
        &self,
        conversation_id: &ConversationId,
        query: &UnseenPageQuery,
    ) -> Result<Vec<MessageId>, RemoteError>;

    /// Atomically mark `ids` as seen: array-union of `seen_by` for groups,
    /// boolean flip when `seen_by` is `None`.
    async fn commit_seen_batch(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
        seen_by: Option<&UserId>,
    ) -> Result<(), RemoteError>;

    /// Which of `ids` still exist. Adapters may cap the number of ids.
    async fn existing_ids(
        &self,
        conversation_id: &ConversationId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, RemoteError>;

    async fn increment_unseen_counters(
        &self,
        conversation_id: &ConversationId,
        participants: &[UserId],
        delta: i64,
    ) -> Result<(), RemoteError>;

    async fn set_recent_message(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<(), RemoteError>;

    async fn add_message(&self, message: &Message) -> Result<(), RemoteError>;
}
