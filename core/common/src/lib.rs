//! Common types shared across the groundsync crates.
//!
//! This crate holds the error taxonomy and the immutable value types of the
//! offline sync engine: entities, queued mutations, field responses, map
//! tiles and offline areas.

pub mod entity;
pub mod error;
pub mod mutation;
pub mod offline_area;
pub mod response;
pub mod tile;
pub mod types;

pub use entity::{Entity, Feature, Observation};
pub use error::{Error, Result};
pub use mutation::{FeatureDelta, Mutation, MutationTarget, MutationType, ObservationDelta};
pub use offline_area::{Bounds, OfflineArea, OfflineAreaState};
pub use response::{Response, ResponseDelta, ResponseMap};
pub use tile::{Tile, TileId, TileState};
pub use types::{generate_id, AuditInfo, EntityState, Point};
