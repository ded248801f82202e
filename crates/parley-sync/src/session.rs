//! Explicit session context for one open conversation.
//!
//! Everything the engine needs to know about "who is looking at what" is
//! passed in here instead of being read from process-wide state.

use parley_shared::{ConversationId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// The authenticated user on this device.
    pub current_user: UserId,
    /// The conversation this engine instance synchronizes.
    pub conversation_id: ConversationId,
}

impl SyncSession {
    pub fn new(current_user: UserId, conversation_id: ConversationId) -> Self {
        Self {
            current_user,
            conversation_id,
        }
    }
}
