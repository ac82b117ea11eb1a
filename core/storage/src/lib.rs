//! Local and remote stores for the groundsync engine.
//!
//! The local store is the device's source of truth: entities, the pending
//! mutation queue, tiles and offline areas. The remote store is the shared
//! server the device synchronizes with.
//!
//! # Design Principles
//! - Atomic local writes: applying a mutation and queueing it commit together
//! - Async operations: all store I/O is async behind traits
//! - Per-item remote decoding: one bad record never fails a batch

pub mod apply;
pub mod http;
pub mod local;
pub mod memory;
pub mod remote;
pub mod schema;
pub mod sqlite;
pub mod watch;

pub use apply::{apply_mutation, EntityLookup, EntityWrite};
pub use http::HttpRemoteStore;
pub use local::LocalStore;
pub use memory::MemoryRemoteStore;
pub use remote::{DeliveryOutcome, RemoteItem, RemoteStore};
pub use schema::{AuditInfoDocument, FeatureDocument, MutationDocument, ObservationDocument};
pub use sqlite::SqliteLocalStore;
pub use watch::{Subscription, WatchRegistry};
