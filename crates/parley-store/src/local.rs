//! The [`LocalStore`] seam consumed by the sync engine.
//!
//! The engine only ever talks to this trait. Every value it returns is an
//! owned snapshot that can cross task boundaries; a write that returned
//! `Ok` is visible to every read issued after it.

use tokio::sync::broadcast;

use parley_shared::{ConversationId, MessageId, UserId};

use crate::changes::StoreChange;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, Message, UserProfile};
use crate::query::MessageQuery;

pub trait LocalStore: Send + Sync {
    fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>>;

    /// Insert or replace.
    fn add_messages(&self, messages: &[Message]) -> Result<()>;

    fn update_message(
        &self,
        id: &MessageId,
        mutation: &mut dyn FnMut(&mut Message),
    ) -> Result<Option<Message>>;

    /// Mutate every match; `mutation` returns whether it changed anything.
    /// Returns the changed messages.
    fn update_messages(
        &self,
        query: &MessageQuery,
        mutation: &mut dyn FnMut(&mut Message) -> bool,
    ) -> Result<Vec<Message>>;

    fn remove_messages(&self, ids: &[MessageId]) -> Result<usize>;

    fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    fn upsert_conversation(&self, conversation: &Conversation) -> Result<()>;

    fn update_conversation(
        &self,
        id: &ConversationId,
        mutation: &mut dyn FnMut(&mut Conversation),
    ) -> Result<Option<Conversation>>;

    fn get_user(&self, id: &UserId) -> Result<Option<UserProfile>>;

    fn upsert_user(&self, user: &UserProfile) -> Result<()>;

    fn observe(&self) -> broadcast::Receiver<StoreChange>;
}

fn not_found_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

impl LocalStore for Database {
    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        not_found_as_none(self.get_message_by_id(id))
    }

    fn query_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        Database::query_messages(self, query)
    }

    fn add_messages(&self, messages: &[Message]) -> Result<()> {
        self.upsert_messages(messages)
    }

    fn update_message(
        &self,
        id: &MessageId,
        mutation: &mut dyn FnMut(&mut Message),
    ) -> Result<Option<Message>> {
        self.modify_message(id, mutation)
    }

    fn update_messages(
        &self,
        query: &MessageQuery,
        mutation: &mut dyn FnMut(&mut Message) -> bool,
    ) -> Result<Vec<Message>> {
        self.modify_messages(query, mutation)
    }

    fn remove_messages(&self, ids: &[MessageId]) -> Result<usize> {
        self.delete_messages(ids)
    }

    fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        not_found_as_none(Database::get_conversation(self, id))
    }

    fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        Database::upsert_conversation(self, conversation)
    }

    fn update_conversation(
        &self,
        id: &ConversationId,
        mutation: &mut dyn FnMut(&mut Conversation),
    ) -> Result<Option<Conversation>> {
        self.modify_conversation(id, mutation)
    }

    fn get_user(&self, id: &UserId) -> Result<Option<UserProfile>> {
        not_found_as_none(Database::get_user(self, id))
    }

    fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        Database::upsert_user(self, user)
    }

    fn observe(&self) -> broadcast::Receiver<StoreChange> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_are_visible_across_tasks() {
        let store: Arc<dyn LocalStore> = Arc::new(Database::open_in_memory().unwrap());
        let conv = Conversation::new("c".into(), false, ["a".into(), "b".into()]);

        let writer = store.clone();
        let written = conv.clone();
        tokio::spawn(async move { writer.upsert_conversation(&written).unwrap() })
            .await
            .unwrap();

        assert_eq!(store.get_conversation(&"c".into()).unwrap(), Some(conv));
        assert_eq!(store.get_message(&"missing".into()).unwrap(), None);
    }

    #[tokio::test]
    async fn observe_reports_deletions() {
        let store = Database::open_in_memory().unwrap();
        let msg = Message::text("c".into(), "a".into(), "hi", chrono::Utc::now(), false);
        store.add_messages(std::slice::from_ref(&msg)).unwrap();

        let mut rx = store.observe();
        store.remove_messages(std::slice::from_ref(&msg.id)).unwrap();
        let change = rx.recv().await.unwrap();
        assert!(matches!(change, StoreChange::Deleted { .. }));
        assert_eq!(change.id(), msg.id.as_str());
    }
}
