//! # parley-store
//!
//! Durable storage for Parley, backed by SQLite.
//!
//! The crate exposes the async [`MessageStore`] and [`UserDirectory`]
//! interfaces the server depends on, a synchronous [`Database`] handle with
//! typed helpers, and [`SqliteStore`], which adapts one to the other.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod store;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use store::{MessageStore, SqliteStore, UserDirectory};
