//! Auxiliary data fetched for incoming messages: media bytes, the
//! replied-to message and (in groups) the sender's profile.
//!
//! Every failure here is logged and swallowed. A missing thumbnail must
//! never hold back the rest of a batch.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use parley_shared::UserId;
use parley_store::{LocalStore, Message, UserProfile};

use crate::cluster::MessageRow;
use crate::error::RemoteError;
use crate::remote::RemoteStore;

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_media(&self, path: &str) -> Result<Bytes, RemoteError>;

    async fn fetch_profile(&self, user: &UserId) -> Result<UserProfile, RemoteError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub media: Option<Bytes>,
    pub replied_to: Option<Box<Message>>,
    pub sender: Option<UserProfile>,
}

enum ReplyLookup {
    Absent,
    Found(Message),
    /// The target was deleted; the reference should be cleared.
    Dangling,
}

pub struct MetadataFetcher {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    source: Arc<dyn MetadataSource>,
}

impl MetadataFetcher {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        source: Arc<dyn MetadataSource>,
    ) -> Self {
        Self {
            local,
            remote,
            source,
        }
    }

    /// Fetch metadata for every message concurrently. Output order matches input.
    pub async fn fetch_all(&self, messages: Vec<Message>, is_group: bool) -> Vec<MessageRow> {
        join_all(messages.into_iter().map(|m| self.fetch_one(m, is_group))).await
    }

    async fn fetch_one(&self, mut message: Message, is_group: bool) -> MessageRow {
        let (media, reply, sender) = tokio::join!(
            self.media(&message),
            self.reply(&message),
            self.sender(&message, is_group),
        );

        let replied_to = match reply {
            ReplyLookup::Absent => None,
            ReplyLookup::Found(target) => Some(Box::new(target)),
            ReplyLookup::Dangling => {
                message.replied_to_id = None;
                None
            }
        };

        MessageRow::with_metadata(
            message,
            MessageMetadata {
                media,
                replied_to,
                sender,
            },
        )
    }

    async fn media(&self, message: &Message) -> Option<Bytes> {
        if !message.kind.has_media() {
            return None;
        }
        let path = message.media_path.as_deref()?;
        match self.source.fetch_media(path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(message = %message.id, path, error = %e, "Media fetch failed");
                None
            }
        }
    }

    async fn reply(&self, message: &Message) -> ReplyLookup {
        let Some(target) = &message.replied_to_id else {
            return ReplyLookup::Absent;
        };

        match self.local.get_message(target) {
            Ok(Some(found)) => return ReplyLookup::Found(found),
            Ok(None) => {}
            Err(e) => warn!(message = %message.id, error = %e, "Local reply lookup failed"),
        }

        match self.remote.fetch_message(&message.conversation_id, target).await {
            Ok(found) => ReplyLookup::Found(found),
            Err(RemoteError::NotFound(_)) => {
                debug!(message = %message.id, reply = %target, "Replied-to message is gone");
                ReplyLookup::Dangling
            }
            Err(e) => {
                warn!(message = %message.id, error = %e, "Remote reply lookup failed");
                ReplyLookup::Absent
            }
        }
    }

    async fn sender(&self, message: &Message, is_group: bool) -> Option<UserProfile> {
        if !is_group {
            return None;
        }

        match self.local.get_user(&message.sender_id) {
            Ok(Some(profile)) => return Some(profile),
            Ok(None) => {}
            Err(e) => warn!(user = %message.sender_id, error = %e, "Local profile lookup failed"),
        }

        match self.source.fetch_profile(&message.sender_id).await {
            Ok(profile) => {
                if let Err(e) = self.local.upsert_user(&profile) {
                    warn!(user = %profile.id, error = %e, "Failed to cache profile");
                }
                Some(profile)
            }
            Err(e) => {
                warn!(user = %message.sender_id, error = %e, "Profile fetch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryMetadata;
    use crate::remote::MemoryRemote;
    use chrono::{TimeZone, Utc};
    use parley_store::{Conversation, Database, MessageKind};

    struct Fixture {
        db: Arc<Database>,
        remote: Arc<MemoryRemote>,
        source: Arc<MemoryMetadata>,
        fetcher: MetadataFetcher,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        remote.insert_conversation(Conversation::new("g".into(), true, ["a".into(), "b".into()]));
        let source = Arc::new(MemoryMetadata::new());
        let fetcher = MetadataFetcher::new(db.clone(), remote.clone(), source.clone());
        Fixture {
            db,
            remote,
            source,
            fetcher,
        }
    }

    fn message(id: &str) -> Message {
        Message::text(
            "g".into(),
            "b".into(),
            id,
            Utc.with_ymd_and_hms(2024, 2, 2, 2, 2, 2).unwrap(),
            true,
        )
        .with_id(id)
    }

    #[tokio::test]
    async fn dangling_reply_is_cleared() {
        let f = fixture();
        let mut reply = message("r");
        reply.replied_to_id = Some("deleted".into());

        let rows = f.fetcher.fetch_all(vec![reply], true).await;
        assert_eq!(rows[0].message.replied_to_id, None);
        assert!(rows[0].metadata.replied_to.is_none());
    }

    #[tokio::test]
    async fn reply_resolves_from_remote_when_not_local() {
        let f = fixture();
        f.remote.seed_messages([message("target")]);
        let mut reply = message("r");
        reply.replied_to_id = Some("target".into());

        let rows = f.fetcher.fetch_all(vec![reply], true).await;
        assert_eq!(rows[0].metadata.replied_to.as_ref().unwrap().id.as_str(), "target");
        assert_eq!(rows[0].message.replied_to_id, Some("target".into()));
    }

    #[tokio::test]
    async fn group_sender_profile_is_cached_locally() {
        let f = fixture();
        f.source.insert_profile(UserProfile {
            id: "b".into(),
            display_name: "Bea".into(),
            avatar_path: None,
        });

        let rows = f.fetcher.fetch_all(vec![message("m")], true).await;
        assert_eq!(rows[0].metadata.sender.as_ref().unwrap().display_name, "Bea");
        assert!(f.db.get_user(&"b".into()).is_ok());

        let private = f.fetcher.fetch_all(vec![message("p")], false).await;
        assert!(private[0].metadata.sender.is_none());
    }

    #[tokio::test]
    async fn media_failures_do_not_abort_the_batch() {
        let f = fixture();
        f.source.insert_media("img/ok.jpg", &b"jpeg"[..]);

        let mut ok = message("ok");
        ok.kind = MessageKind::Image;
        ok.media_path = Some("img/ok.jpg".into());
        let mut missing = message("missing");
        missing.kind = MessageKind::Audio;
        missing.media_path = Some("audio/gone.m4a".into());

        let rows = f.fetcher.fetch_all(vec![ok, missing], false).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metadata.media.as_deref(), Some(&b"jpeg"[..]));
        assert!(rows[1].metadata.media.is_none());
    }
}
