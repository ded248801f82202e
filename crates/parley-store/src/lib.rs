//! # parley-store
//!
//! Local on-device storage for the Parley sync engine, backed by SQLite.
//!
//! The crate exposes a [`Database`] handle that wraps a
//! `rusqlite::Connection`, typed CRUD helpers for every domain model, and
//! the [`LocalStore`] trait through which the sync engine reaches it.

pub mod changes;
pub mod conversations;
pub mod database;
pub mod local;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod query;
pub mod users;

mod error;

pub use changes::{EntityKind, StoreChange};
pub use database::Database;
pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use models::*;
pub use query::{Cursor, MessageQuery, RangeBound, SortOrder};
