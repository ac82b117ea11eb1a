//! Local store contract.

use async_trait::async_trait;

use groundsync_common::{Entity, Feature, Mutation, Observation, OfflineArea, Result, Tile, TileId};

use crate::watch::Subscription;

/// Durable on-device storage for entities, the pending mutation queue,
/// tiles and offline areas.
///
/// The local store is the single source of truth of the engine. Every
/// mutating operation is transactional: it either commits completely or
/// leaves no trace.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply a mutation to local entity state and append it to the pending
    /// queue, atomically.
    ///
    /// # Postconditions
    /// - The entity write and the queue append are both committed, or neither is
    /// - Returns the mutation as queued, with its assigned id
    ///
    /// # Errors
    /// - `Validation` / `UnsupportedMutationType` for malformed mutations
    /// - `NotFound` when updating or deleting an unknown entity
    /// - `Storage` on any engine failure
    async fn apply_and_enqueue(&self, mutation: Mutation) -> Result<Mutation>;

    /// Pending mutations whose owning feature or target entity is
    /// `entity_id`, in ascending id order.
    async fn get_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>>;

    /// Replace queued mutations with the given versions, matched by id.
    async fn update_mutations(&self, mutations: &[Mutation]) -> Result<()>;

    /// Remove mutations from the pending queue by id.
    ///
    /// Removing an id that is no longer queued is a no-op.
    async fn remove_pending_mutations(&self, mutations: &[Mutation]) -> Result<()>;

    /// Upsert remote entity state without touching the pending queue.
    async fn merge_entity(&self, entity: Entity) -> Result<()>;

    /// A non-deleted feature by id.
    async fn get_feature(&self, project_id: &str, feature_id: &str) -> Result<Option<Feature>>;

    /// Non-deleted features of a project, ordered by id.
    async fn get_features(&self, project_id: &str) -> Result<Vec<Feature>>;

    /// Current features of a project plus a stream of later snapshots.
    async fn features_once_and_stream(&self, project_id: &str)
        -> Result<Subscription<Vec<Feature>>>;

    /// A non-deleted observation by id.
    async fn get_observation(
        &self,
        feature_id: &str,
        observation_id: &str,
    ) -> Result<Option<Observation>>;

    /// Non-deleted observations of a feature for one form, ordered by id.
    async fn get_observations(&self, feature_id: &str, form_id: &str) -> Result<Vec<Observation>>;

    async fn insert_or_update_tile(&self, tile: &Tile) -> Result<()>;

    async fn get_tile(&self, id: &TileId) -> Result<Option<Tile>>;

    /// All tiles, ordered by id.
    async fn get_tiles(&self) -> Result<Vec<Tile>>;

    /// Tiles in state PENDING, IN_PROGRESS or FAILED, ordered by id.
    async fn get_pending_tiles(&self) -> Result<Vec<Tile>>;

    /// All tiles plus a stream of later snapshots.
    async fn tiles_once_and_stream(&self) -> Result<Subscription<Vec<Tile>>>;

    async fn insert_or_update_offline_area(&self, area: &OfflineArea) -> Result<()>;

    /// All offline areas plus a stream of later snapshots.
    async fn offline_areas_once_and_stream(&self) -> Result<Subscription<Vec<OfflineArea>>>;
}
