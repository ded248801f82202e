//! # parley-sync
//!
//! Keeps a windowed, day-clustered view of one conversation consistent
//! between the on-device store and the remote document store.
//!
//! - [`ConversationSyncEngine`]: opens a conversation, applies listener
//!   batches, paginates, propagates seen status and sends messages.
//! - [`RemoteStore`] / [`MetadataSource`]: the remote seams, with in-memory
//!   implementations in [`remote::memory`].
//! - [`MessageClusterer`]: the inverted day-bucketed cluster list.
//! - [`SyncEvent`]: what the presentation layer consumes.

pub mod cluster;
pub mod config;
pub mod debounce;
pub mod deletion;
pub mod engine;
pub mod error;
pub mod events;
pub mod metadata;
pub mod paginator;
pub mod remote;
pub mod seen;
pub mod session;
pub mod strategy;
pub mod unseen;

pub use cluster::{ClusterDiff, IndexPath, MessageCluster, MessageClusterer, MessageItem, MessageRow};
pub use config::SyncConfig;
pub use engine::{ConversationSyncEngine, PaginationOutcome};
pub use error::{RemoteError, Result, SyncError};
pub use events::{RowAnimation, SyncEvent};
pub use metadata::{MessageMetadata, MetadataSource};
pub use remote::{ChangeEvent, ChangeType, RemoteStore};
pub use session::SyncSession;
pub use strategy::{FetchStrategy, LocalHistory};
