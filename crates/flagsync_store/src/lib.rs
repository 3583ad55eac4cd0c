//! # flagsync Store
//!
//! Versioned stores for flags and segments.
//!
//! This crate holds the data a client evaluates against. Every item carries
//! a version, and no store ever lets an older version replace a newer one.
//! Deletions are kept as versioned tombstones for the same reason.
//!
//! ## Design Principles
//!
//! - Stores are `Send + Sync` and take `&self`
//! - Changesets are applied atomically with respect to readers
//! - Shared external stores are written with optimistic concurrency
//! - Availability is reported through a status channel, never by panicking
//!
//! ## Available Stores
//!
//! - [`InMemoryDataStore`] - The authoritative local copy
//! - [`PersistentStoreWrapper`] - Adapts a [`PersistentDataStore`] to [`DataStore`]
//! - [`CasDataStore`] - A [`PersistentDataStore`] over any [`CasBackend`]
//! - [`WriteThroughStore`] - Memory plus optional persistence
//!
//! ## Example
//!
//! ```rust
//! use flagsync_store::{
//!     CasDataStore, DataKind, DataStore, DataStoreStatusProvider, ItemDescriptor,
//!     MemoryCasBackend, PersistentStoreWrapper,
//! };
//! use serde_json::json;
//!
//! let store = PersistentStoreWrapper::new(
//!     CasDataStore::new(MemoryCasBackend::new()),
//!     DataStoreStatusProvider::new(),
//! );
//! assert!(store.upsert(DataKind::Features, "f1", ItemDescriptor::new(5, json!({}))).unwrap());
//! assert!(!store.upsert(DataKind::Features, "f1", ItemDescriptor::new(5, json!({}))).unwrap());
//! assert!(store.upsert(DataKind::Features, "f1", ItemDescriptor::new(6, json!({}))).unwrap());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod cas;
mod config;
mod error;
mod item;
mod kind;
mod memory;
mod memory_store;
mod persistent;
mod status;
mod store;
mod write_through;

pub use backend::{CasBackend, Revision};
pub use cas::{CasDataStore, PreCommitHook};
pub use config::{DataStoreMode, RetryConfig};
pub use error::{StoreError, StoreResult};
pub use item::{FullDataSet, ItemDescriptor, KeyedItems, SerializedItemDescriptor, StoreChangeSet};
pub use kind::DataKind;
pub use memory::MemoryCasBackend;
pub use memory_store::InMemoryDataStore;
pub use persistent::{PersistentDataStore, PersistentStoreWrapper, DEFAULT_RECOVERY_POLL_INTERVAL};
pub use status::{DataStoreStatus, DataStoreStatusProvider};
pub use store::DataStore;
pub use write_through::WriteThroughStore;
