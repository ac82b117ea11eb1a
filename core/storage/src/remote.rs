//! Remote store contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use groundsync_common::{Feature, Mutation, Observation, Result};

/// Per-item result of a remote load: a decoded entity or the reason it
/// could not be decoded.
pub type RemoteItem<T> = Result<T>;

/// Server verdict on one pushed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// The server applied the mutation; it may leave the pending queue.
    Accepted,
    /// The server refused the mutation; it stays queued.
    Rejected(String),
}

impl DeliveryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted)
    }
}

/// Shared document store the device synchronizes with.
///
/// Load operations fail as a whole only on transport problems. Records that
/// arrive but cannot be decoded are reported item by item so one bad record
/// never hides the rest of a batch.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// All features of a project.
    async fn load_features(&self, project_id: &str) -> Result<Vec<RemoteItem<Feature>>>;

    /// All observations collected on a feature.
    async fn load_observations(&self, feature: &Feature) -> Result<Vec<RemoteItem<Observation>>>;

    /// Push one mutation.
    ///
    /// # Errors
    /// - `Network` when the outcome is unknown (transport failure); the
    ///   caller must treat the mutation as not delivered
    async fn apply_mutation(&self, mutation: &Mutation) -> Result<DeliveryOutcome>;
}
