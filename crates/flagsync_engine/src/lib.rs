//! # flagsync Engine
//!
//! Streaming synchronization for flagsync.
//!
//! This crate provides:
//! - The data source status model ([`DataSourceStatus`])
//! - [`ChangeSetTranslator`], from wire changesets to store changesets
//! - [`DataSourceUpdates`], the sink that applies changesets and tracks status
//! - The [`EventSource`] transport abstraction and a scripted implementation
//! - [`StreamingSynchronizer`], which drives the protocol per connection
//!
//! ## Architecture
//!
//! ```text
//! EventSource --RawEvent--> ProtocolHandler --ChangeSet--> ChangeSetTranslator
//!                                                               |
//!                                    DataStore <--apply-- DataSourceUpdates
//! ```
//!
//! ## Key Invariants
//!
//! - Only complete payloads reach the store
//! - Each connection starts from a reset protocol handler
//! - Interruptions before the first payload leave the status initializing
//! - After a store outage the next connection asks for a full transfer
//!
//! ## Example
//!
//! ```rust
//! use flagsync_engine::{
//!     DataSourceState, DataSourceUpdates, DataSystemConfig, ScriptedEventSource,
//!     StreamingSynchronizer,
//! };
//! use flagsync_protocol::RawEvent;
//! use flagsync_store::{DataKind, DataStore, MemoryCasBackend};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let config = DataSystemConfig::new();
//! let stack = config.build_stores::<MemoryCasBackend>(None);
//! let updates = Arc::new(DataSourceUpdates::new(stack.store.clone(), stack.status.clone()));
//!
//! let source = ScriptedEventSource::new().with_connection(vec![
//!     RawEvent::new("server-intent", json!({
//!         "payloads": [{"id": "p1", "target": 1, "intentCode": "xfer-full"}]
//!     })),
//!     RawEvent::new("put-object", json!({
//!         "kind": "flag", "key": "f1", "version": 1, "object": {"on": true}
//!     })),
//!     RawEvent::new("payload-transferred", json!({"state": "s1", "version": 1})),
//! ]);
//!
//! let synchronizer = StreamingSynchronizer::new(config, source, Arc::clone(&updates));
//! synchronizer.run();
//!
//! assert_eq!(updates.status().state, DataSourceState::Valid);
//! assert!(stack.store.get(DataKind::Features, "f1").unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod sink;
mod source;
mod status;
mod synchronizer;
mod translator;

pub use config::{DataSystemConfig, StoreStack};
pub use error::{is_http_error_recoverable, SyncError, SyncResult};
pub use flagsync_store::RetryConfig;
pub use sink::{DataSourceUpdates, ItemChange, PayloadSink};
pub use source::{EventSource, ScriptedEventSource, ScriptedItem, SelectorLog};
pub use status::{DataSourceState, DataSourceStatus, ErrorInfo, ErrorKind};
pub use synchronizer::{StreamingSynchronizer, SyncStats};
pub use translator::ChangeSetTranslator;
