use serde::Serialize;

use parley_shared::{Direction, MessageId};

use crate::cluster::ClusterDiff;

/// How the presentation layer should animate a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAnimation {
    None,
    Top,
    Bottom,
    Fade,
    Automatic,
}

impl RowAnimation {
    /// Newer messages enter at the bottom of the inverted list, older ones at the top.
    pub fn for_insert(direction: Option<Direction>) -> Self {
        match direction {
            Some(Direction::Ascending) => Self::Bottom,
            Some(Direction::Descending) => Self::Top,
            None => Self::Automatic,
        }
    }
}

/// Events published by a [`ConversationSyncEngine`](crate::ConversationSyncEngine).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Clusters {
        diff: ClusterDiff,
        animation: RowAnimation,
    },
    UnseenCountChanged {
        count: u32,
    },
    RecentMessageChanged {
        message_id: Option<MessageId>,
    },
    /// A background failure the UI may want to surface.
    Error {
        message: String,
    },
}
