//! # petfeeder-store
//!
//! Persistence for the feeder server, backed by SQLite.
//!
//! Feeding events and gallery rows (one per recorded video) are bucketed by
//! UTC calendar date so the UI can browse them day by day. The crate exposes a
//! synchronous [`Database`] handle with typed helpers, a [`MediaLibrary`] that
//! lays recordings out in dated folders, and [`Store`], a thread-safe
//! combination of both used by the server.

pub mod database;
pub mod events;
pub mod gallery;
pub mod media;
pub mod migrations;
pub mod models;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use media::MediaLibrary;
pub use models::*;
pub use store::Store;
