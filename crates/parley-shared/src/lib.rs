//! # parley-shared
//!
//! Identifier newtypes, tuning constants and model-level errors shared by
//! the store, the sync engine and the simulator.

pub mod constants;
pub mod error;
pub mod types;

pub use error::ModelError;
pub use types::{ConversationId, Direction, MessageId, UserId};
