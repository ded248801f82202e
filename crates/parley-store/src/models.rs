//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so the same values can
//! be handed to the remote adapter and to the presentation layer. Values
//! returned by the store are owned snapshots: nothing here is bound to the
//! connection that produced it.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::{ConversationId, MessageId, ModelError, UserId};

// ---------------------------------------------------------------------------
// Message kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Sticker,
    /// Synthetic conversation event ("group created", "X left", ...).
    Title,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Sticker => "sticker",
            Self::Title => "title",
        }
    }

    /// Whether messages of this kind carry a media reference worth fetching.
    pub fn has_media(self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Sticker)
    }
}

impl FromStr for MessageKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "sticker" => Ok(Self::Sticker),
            "title" => Ok(Self::Title),
            other => Err(ModelError::UnknownMessageKind(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Seen state
// ---------------------------------------------------------------------------

/// Seen bookkeeping for a message.
///
/// Private conversations track a single flag (the only possible reader is
/// the other participant); group conversations track the set of readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenState {
    Private(bool),
    Group(BTreeSet<UserId>),
}

impl SeenState {
    /// The initial (unseen) state for a conversation of the given kind.
    pub fn unseen(is_group: bool) -> Self {
        if is_group {
            Self::Group(BTreeSet::new())
        } else {
            Self::Private(false)
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn is_seen_by(&self, user: &UserId) -> bool {
        match self {
            Self::Private(seen) => *seen,
            Self::Group(readers) => readers.contains(user),
        }
    }

    /// Mark as seen by `user`. Returns `true` if the state changed.
    pub fn mark_seen_by(&mut self, user: &UserId) -> bool {
        match self {
            Self::Private(seen) => !std::mem::replace(seen, true),
            Self::Group(readers) => readers.insert(user.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Ordering key. Not unique: ties are broken by `id`.
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub kind: MessageKind,
    /// Storage path of the image / voice note / sticker, if any.
    pub media_path: Option<String>,
    pub seen: SeenState,
    /// Weak reference; the target may have been deleted.
    pub replied_to_id: Option<MessageId>,
    /// emoji -> users who reacted with it
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub edited: bool,
}

impl Message {
    /// Build a plain text message in the unseen state.
    pub fn text(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
        is_group: bool,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            sender_id,
            timestamp,
            body: body.into(),
            kind: MessageKind::Text,
            media_path: None,
            seen: SeenState::unseen(is_group),
            replied_to_id: None,
            reactions: BTreeMap::new(),
            edited: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = MessageId::new(id);
        self
    }

    pub fn is_seen_by(&self, user: &UserId) -> bool {
        self.seen.is_seen_by(user)
    }

    /// Seen by `user`, or written by them.
    pub fn is_read_by(&self, user: &UserId) -> bool {
        &self.sender_id == user || self.seen.is_seen_by(user)
    }

    /// Calendar day of this message in the conversation's local offset.
    pub fn day_key(&self, offset: &FixedOffset) -> NaiveDate {
        self.timestamp.with_timezone(offset).date_naive()
    }

    /// Names of the user-visible fields that differ between `self` and `other`.
    pub fn changed_fields(&self, other: &Message) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.body != other.body {
            fields.push("body");
        }
        if self.seen != other.seen {
            fields.push("seen");
        }
        if self.reactions != other.reactions {
            fields.push("reactions");
        }
        if self.edited != other.edited {
            fields.push("edited");
        }
        if self.replied_to_id != other.replied_to_id {
            fields.push("replied_to_id");
        }
        if self.media_path != other.media_path {
            fields.push("media_path");
        }
        if self.timestamp != other.timestamp {
            fields.push("timestamp");
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub unseen_count: u32,
    /// Set when the participant left or removed the conversation.
    pub is_deleted: bool,
}

impl Participant {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            unseen_count: 0,
            is_deleted: false,
        }
    }
}

/// A conversation (private chat or group).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub is_group: bool,
    /// Weak reference, eventually consistent with the newest message.
    pub recent_message_id: Option<MessageId>,
    pub message_count: u64,
}

impl Conversation {
    pub fn new(id: ConversationId, is_group: bool, members: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            id,
            name: None,
            participants: members.into_iter().map(Participant::new).collect(),
            is_group,
            recent_message_id: None,
            message_count: 0,
        }
    }

    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user)
    }

    /// A member is a participant who has not left.
    pub fn is_member(&self, user: &UserId) -> bool {
        self.participant(user).is_some_and(|p| !p.is_deleted)
    }

    pub fn unseen_count_for(&self, user: &UserId) -> u32 {
        self.participant(user).map_or(0, |p| p.unseen_count)
    }

    /// Active participants other than `user`.
    pub fn other_members(&self, user: &UserId) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| !p.is_deleted && &p.user_id != user)
            .map(|p| p.user_id.clone())
            .collect()
    }

    pub fn changed_fields(&self, other: &Conversation) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name != other.name {
            fields.push("name");
        }
        if self.participants != other.participants {
            fields.push("participants");
        }
        if self.recent_message_id != other.recent_message_id {
            fields.push("recent_message_id");
        }
        if self.message_count != other.message_count {
            fields.push("message_count");
        }
        if self.is_group != other.is_group {
            fields.push("is_group");
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// Sender profile cached for group conversations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn private_seen_flag_flips_once() {
        let mut seen = SeenState::unseen(false);
        let reader = UserId::new("bob");
        assert!(seen.mark_seen_by(&reader));
        assert!(!seen.mark_seen_by(&reader));
        assert!(seen.is_seen_by(&reader));
    }

    #[test]
    fn group_seen_tracks_each_reader() {
        let mut seen = SeenState::unseen(true);
        assert!(seen.mark_seen_by(&UserId::new("a")));
        assert!(seen.is_seen_by(&UserId::new("a")));
        assert!(!seen.is_seen_by(&UserId::new("b")));
    }

    #[test]
    fn day_key_respects_offset() {
        let msg = Message::text("c".into(), "a".into(), "late", ts(23), false);
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(msg.day_key(&utc), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(msg.day_key(&plus_two), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [MessageKind::Text, MessageKind::Image, MessageKind::Title] {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("video".parse::<MessageKind>().is_err());
    }

    #[test]
    fn membership_ignores_deleted_participants() {
        let mut conv = Conversation::new("c".into(), true, ["a".into(), "b".into()]);
        conv.participant_mut(&"b".into()).unwrap().is_deleted = true;
        assert!(conv.is_member(&"a".into()));
        assert!(!conv.is_member(&"b".into()));
        assert_eq!(conv.other_members(&"a".into()), Vec::<UserId>::new());
    }
}
