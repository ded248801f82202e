//! Choosing the shape of the initial fetch for a conversation.

use parley_shared::UserId;
use parley_store::{Conversation, Cursor, LocalStore, Message, MessageKind, MessageQuery, SortOrder};

use crate::error::{Result, SyncError};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    Ascending { from: Message, inclusive: bool },
    Descending { from: Message, inclusive: bool },
    /// Descending and ascending around the anchor, merged.
    Hybrid { from: Message },
    None,
}

impl FetchStrategy {
    pub fn anchor(&self) -> Option<&Message> {
        match self {
            Self::Ascending { from, .. } | Self::Descending { from, .. } | Self::Hybrid { from } => {
                Some(from)
            }
            Self::None => None,
        }
    }
}

/// What the local store already holds for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalHistory {
    Empty,
    /// Only the message written when the conversation was created.
    PlaceholderOnly,
    Populated,
}

impl LocalHistory {
    pub fn is_first_load(self) -> bool {
        self != Self::Populated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub is_member: bool,
    pub history: LocalHistory,
    /// Oldest remote message neither sent nor seen by the current user.
    pub first_unseen: Option<Message>,
    /// Newest local message sent or seen by the current user.
    pub last_seen: Option<Message>,
    /// The conversation's recent message, re-resolved by id.
    pub recent: Option<Message>,
}

impl LocalState {
    pub async fn gather(
        local: &dyn LocalStore,
        remote: &dyn RemoteStore,
        conversation: &Conversation,
        user: &UserId,
        page_size: usize,
    ) -> Result<Self> {
        let is_member = conversation.is_member(user);
        let recent = resolve_recent(local, remote, conversation).await?;
        let history = local_history(local, conversation, recent.as_ref())?;
        let last_seen = newest_read_by(local, conversation, user, page_size)?;
        let first_unseen = if is_member {
            remote.first_unseen_message(&conversation.id, user).await?
        } else {
            None
        };

        Ok(Self {
            is_member,
            history,
            first_unseen,
            last_seen,
            recent,
        })
    }
}

/// Decide how to fill an empty window. First matching rule wins.
pub fn select_strategy(conversation: &Conversation, state: &LocalState) -> FetchStrategy {
    // A former group member only gets the latest message, read-only.
    if conversation.is_group && !state.is_member {
        return match &state.recent {
            Some(recent) => FetchStrategy::Descending {
                from: recent.clone(),
                inclusive: true,
            },
            None => FetchStrategy::None,
        };
    }

    if let Some(first_unseen) = &state.first_unseen {
        return if state.history.is_first_load() {
            FetchStrategy::Hybrid {
                from: first_unseen.clone(),
            }
        } else {
            FetchStrategy::Ascending {
                from: first_unseen.clone(),
                inclusive: true,
            }
        };
    }

    match state.last_seen.as_ref().or(state.recent.as_ref()) {
        Some(last) => FetchStrategy::Descending {
            from: last.clone(),
            inclusive: true,
        },
        None => FetchStrategy::None,
    }
}

/// Page size for executing a strategy.
pub fn fetch_limit(conversation: &Conversation, state: &LocalState, page_size: usize) -> usize {
    if conversation.is_group && !state.is_member {
        1
    } else {
        page_size
    }
}

async fn resolve_recent(
    local: &dyn LocalStore,
    remote: &dyn RemoteStore,
    conversation: &Conversation,
) -> Result<Option<Message>> {
    let Some(id) = &conversation.recent_message_id else {
        return Ok(None);
    };
    if let Some(message) = local.get_message(id)? {
        return Ok(Some(message));
    }
    match remote.fetch_message(&conversation.id, id).await {
        Ok(message) => Ok(Some(message)),
        Err(e) => match SyncError::from(e) {
            SyncError::NotFound(_) => {
                tracing::debug!(conversation = %conversation.id, recent = %id, "Recent message no longer exists");
                Ok(None)
            }
            other => Err(other),
        },
    }
}

fn local_history(
    local: &dyn LocalStore,
    conversation: &Conversation,
    recent: Option<&Message>,
) -> Result<LocalHistory> {
    let query = MessageQuery::for_conversation(conversation.id.clone()).limit(2);
    let held = local.query_messages(&query)?;
    Ok(match held.as_slice() {
        [] => LocalHistory::Empty,
        [only] if only.kind == MessageKind::Title || recent.is_some_and(|r| r.id == only.id) => {
            LocalHistory::PlaceholderOnly
        }
        _ => LocalHistory::Populated,
    })
}

fn newest_read_by(
    local: &dyn LocalStore,
    conversation: &Conversation,
    user: &UserId,
    page_size: usize,
) -> Result<Option<Message>> {
    let mut cursor: Option<Cursor> = None;
    loop {
        let mut query = MessageQuery::for_conversation(conversation.id.clone())
            .order(SortOrder::Descending)
            .limit(page_size);
        if let Some(c) = cursor.take() {
            query = query.before(c, false);
        }
        let page = local.query_messages(&query)?;
        if let Some(found) = page.iter().find(|m| m.is_read_by(user)) {
            return Ok(Some(found.clone()));
        }
        match page.last() {
            Some(last) if page.len() == page_size => cursor = Some(Cursor::of(last)),
            _ => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use chrono::{Duration, TimeZone, Utc};
    use parley_store::Database;

    fn conversation(is_group: bool) -> Conversation {
        Conversation::new("c".into(), is_group, ["me".into(), "them".into()])
    }

    fn message(id: &str, minute: i64, sender: &str) -> Message {
        Message::text(
            "c".into(),
            sender.into(),
            id,
            Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap() + Duration::minutes(minute),
            false,
        )
        .with_id(id)
    }

    fn state(history: LocalHistory) -> LocalState {
        LocalState {
            is_member: true,
            history,
            first_unseen: None,
            last_seen: None,
            recent: None,
        }
    }

    #[test]
    fn non_member_gets_latest_message_only() {
        let mut conv = conversation(true);
        conv.participant_mut(&"me".into()).unwrap().is_deleted = true;
        let recent = message("r", 5, "them");
        let s = LocalState {
            is_member: false,
            first_unseen: Some(message("u", 1, "them")),
            recent: Some(recent.clone()),
            ..state(LocalHistory::Populated)
        };

        assert_eq!(
            select_strategy(&conv, &s),
            FetchStrategy::Descending {
                from: recent,
                inclusive: true
            }
        );
        assert_eq!(fetch_limit(&conv, &s, 50), 1);
    }

    #[test]
    fn unseen_anchor_is_hybrid_only_on_first_load() {
        let conv = conversation(false);
        let unseen = message("u", 1, "them");
        let mut s = LocalState {
            first_unseen: Some(unseen.clone()),
            ..state(LocalHistory::PlaceholderOnly)
        };
        assert_eq!(
            select_strategy(&conv, &s),
            FetchStrategy::Hybrid {
                from: unseen.clone()
            }
        );

        s.history = LocalHistory::Populated;
        assert_eq!(
            select_strategy(&conv, &s),
            FetchStrategy::Ascending {
                from: unseen,
                inclusive: true
            }
        );
    }

    #[test]
    fn falls_back_to_last_seen_then_recent_then_none() {
        let conv = conversation(false);
        let seen = message("s", 1, "me");
        let recent = message("r", 2, "them");

        let s = LocalState {
            last_seen: Some(seen.clone()),
            recent: Some(recent.clone()),
            ..state(LocalHistory::Populated)
        };
        assert_eq!(select_strategy(&conv, &s).anchor(), Some(&seen));

        let s = LocalState {
            recent: Some(recent.clone()),
            ..state(LocalHistory::Empty)
        };
        assert_eq!(select_strategy(&conv, &s).anchor(), Some(&recent));

        assert_eq!(select_strategy(&conv, &state(LocalHistory::Empty)), FetchStrategy::None);
    }

    #[tokio::test]
    async fn gather_detects_placeholder_and_scans_for_last_seen() {
        let db = Database::open_in_memory().unwrap();
        let remote = MemoryRemote::new();
        let mut conv = conversation(false);
        remote.insert_conversation(conv.clone());

        let mut title = message("created", 0, "them");
        title.kind = MessageKind::Title;
        db.upsert_messages(&[title]).unwrap();
        let s = LocalState::gather(&db, &remote, &conv, &"me".into(), 2).await.unwrap();
        assert_eq!(s.history, LocalHistory::PlaceholderOnly);
        assert_eq!(s.last_seen, None);

        // Mine is older than two pages of unread messages from them.
        let mut unread: Vec<Message> = (1..=5).map(|i| message(&format!("t{i}"), 10 + i, "them")).collect();
        unread.push(message("mine", 5, "me"));
        db.upsert_messages(&unread).unwrap();
        remote.seed_messages(unread);
        conv = remote.conversation(&conv.id).unwrap();

        let s = LocalState::gather(&db, &remote, &conv, &"me".into(), 2).await.unwrap();
        assert_eq!(s.history, LocalHistory::Populated);
        assert_eq!(s.last_seen.unwrap().id.as_str(), "mine");
        assert_eq!(s.recent.unwrap().id.as_str(), "t5");
        assert_eq!(s.first_unseen.unwrap().id.as_str(), "t1");
    }
}
