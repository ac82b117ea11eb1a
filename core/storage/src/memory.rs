//! In-memory remote store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use groundsync_common::{Error, Feature, Mutation, Observation, Result};

use crate::remote::{DeliveryOutcome, RemoteItem, RemoteStore};
use crate::schema::{decode_feature, decode_observation};

#[derive(Default)]
struct State {
    /// Raw feature documents by project id.
    features: BTreeMap<String, Vec<Value>>,
    /// Raw observation documents by feature id.
    observations: BTreeMap<String, Vec<Value>>,
    /// Rejection reasons by entity id.
    rejections: HashMap<String, String>,
    /// Rejection reasons by mutation id.
    rejected_mutations: HashMap<i64, String>,
    /// Number of upcoming calls that fail with a transport error.
    transient_failures: u32,
    latency: Option<Duration>,
    delivered: Vec<Mutation>,
    calls: usize,
}

/// In-memory remote store.
///
/// Holds raw JSON documents so tests can feed malformed records through
/// the same decoding path as a real server. Transport failures, rejections
/// and latency can be injected.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    state: Arc<RwLock<State>>,
}

impl MemoryRemoteStore {
    /// Create a new empty remote store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_feature_document(&self, project_id: impl Into<String>, document: Value) {
        self.write()
            .features
            .entry(project_id.into())
            .or_default()
            .push(document);
    }

    pub fn add_observation_document(&self, feature_id: impl Into<String>, document: Value) {
        self.write()
            .observations
            .entry(feature_id.into())
            .or_default()
            .push(document);
    }

    /// Reject every mutation targeting `entity_id`.
    pub fn reject_entity(&self, entity_id: impl Into<String>, reason: impl Into<String>) {
        self.write()
            .rejections
            .insert(entity_id.into(), reason.into());
    }

    /// Reject the queued mutation with the given id.
    pub fn reject_mutation(&self, mutation_id: i64, reason: impl Into<String>) {
        self.write()
            .rejected_mutations
            .insert(mutation_id, reason.into());
    }

    pub fn clear_rejections(&self) {
        let mut state = self.write();
        state.rejections.clear();
        state.rejected_mutations.clear();
    }

    /// Fail the next `count` calls with a network error.
    pub fn fail_next(&self, count: u32) {
        self.write().transient_failures = count;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.write().latency = Some(latency);
    }

    /// Mutations accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<Mutation> {
        self.read().delivered.clone()
    }

    /// Number of calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.read().calls
    }

    // Counts the call, waits out the latency, then consumes one injected failure.
    async fn enter(&self, operation: &str) -> Result<()> {
        let latency = {
            let mut state = self.write();
            state.calls += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(Error::Network(format!("Injected failure in {}", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_features(&self, project_id: &str) -> Result<Vec<RemoteItem<Feature>>> {
        self.enter("load_features").await?;
        let documents = self
            .read()
            .features
            .get(project_id)
            .cloned()
            .unwrap_or_default();

        Ok(documents
            .into_iter()
            .map(|doc| decode_feature(project_id, doc))
            .collect())
    }

    async fn load_observations(&self, feature: &Feature) -> Result<Vec<RemoteItem<Observation>>> {
        self.enter("load_observations").await?;
        let documents = self
            .read()
            .observations
            .get(feature.id())
            .cloned()
            .unwrap_or_default();

        Ok(documents
            .into_iter()
            .map(|doc| decode_observation(feature, doc))
            .collect())
    }

    async fn apply_mutation(&self, mutation: &Mutation) -> Result<DeliveryOutcome> {
        self.enter("apply_mutation").await?;
        let mut state = self.write();

        let rejection = mutation
            .id
            .and_then(|id| state.rejected_mutations.get(&id))
            .or_else(|| state.rejections.get(mutation.entity_id()));
        if let Some(reason) = rejection {
            debug!("Rejecting mutation {:?}: {}", mutation.id, reason);
            return Ok(DeliveryOutcome::Rejected(reason.clone()));
        }

        state.delivered.push(mutation.clone());
        Ok(DeliveryOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundsync_common::{FeatureDelta, MutationType, Point};
    use serde_json::json;

    fn feature_document(id: &str) -> Value {
        json!({
            "id": id,
            "layerId": "layer id",
            "location": { "latitude": 1.0, "longitude": 2.0 },
            "created": { "userId": "user id", "clientTimeMillis": 1000 }
        })
    }

    fn mutation() -> Mutation {
        Mutation::feature(
            MutationType::Create,
            "project id",
            "layer id",
            "user id",
            FeatureDelta {
                feature_id: "feature id".to_string(),
                new_location: Some(Point::new(1.0, 2.0).unwrap()),
            },
        )
        .with_id(1)
    }

    #[tokio::test]
    async fn test_load_features_reports_items_individually() {
        let remote = MemoryRemoteStore::new();
        remote.add_feature_document("project id", feature_document("a"));
        remote.add_feature_document("project id", json!({ "id": "b" }));

        let items = remote.load_features("project id").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().id(), "a");
        assert!(matches!(&items[1], Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next(1);

        let mutation = mutation();

        let err = remote.apply_mutation(&mutation).await.unwrap_err();
        assert!(err.is_transient());

        let outcome = remote.apply_mutation(&mutation).await.unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(remote.delivered(), vec![mutation]);
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_mutation_is_not_delivered() {
        let remote = MemoryRemoteStore::new();
        remote.reject_entity("feature id", "permission denied");

        let outcome = remote.apply_mutation(&mutation()).await.unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Rejected("permission denied".to_string())
        );
        assert!(remote.delivered().is_empty());
    }
}
