//! Engine context wiring the stores and background workers together.

use std::sync::Arc;
use tracing::{debug, warn};

use groundsync_common::{Error, Feature, Mutation, Observation, Result};
use groundsync_storage::{LocalStore, RemoteStore, Subscription};

use crate::config::SyncConfig;
use crate::delivery::{DeliveryScheduler, DeliverySchedulerHandle};
use crate::reconciler::MergeReconciler;
use crate::tiles::{TileDownloadManager, TileSource};

/// Everything the engine needs, constructed once at startup and passed by
/// reference to whoever needs it.
pub struct SyncContext {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    reconciler: MergeReconciler,
    delivery: DeliveryScheduler,
    config: SyncConfig,
}

impl SyncContext {
    /// Build a context. The returned handle runs the delivery worker and
    /// must be spawned by the caller.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> (Self, DeliverySchedulerHandle) {
        let reconciler = MergeReconciler::new(
            local.clone(),
            remote.clone(),
            config.merge_timeout,
            config.preserve_pending_edits,
        );
        let (delivery, handle) = DeliveryScheduler::new(local.clone(), remote.clone(), &config);

        let context = Self {
            local,
            remote,
            reconciler,
            delivery,
            config,
        };
        (context, handle)
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn delivery(&self) -> &DeliveryScheduler {
        &self.delivery
    }

    pub fn reconciler(&self) -> &MergeReconciler {
        &self.reconciler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply a local edit and schedule its delivery.
    ///
    /// Once this returns `Ok` the edit is durable. A delivery scheduler
    /// that has already stopped only delays delivery; the mutation stays
    /// queued.
    pub async fn apply_and_enqueue(&self, mutation: Mutation) -> Result<Mutation> {
        let queued = self.local.apply_and_enqueue(mutation).await?;
        if let Err(e) = self.delivery.enqueue_delivery(queued.feature_id()) {
            warn!(
                "Mutation {:?} queued but delivery not scheduled: {}",
                queued.id, e
            );
        }
        Ok(queued)
    }

    /// Features of a project, after a best-effort merge from the remote.
    pub async fn get_features(&self, project_id: &str) -> Result<Vec<Feature>> {
        self.reconciler.merge_features(project_id).await;
        self.local.get_features(project_id).await
    }

    pub async fn get_feature(&self, project_id: &str, feature_id: &str) -> Result<Feature> {
        self.local
            .get_feature(project_id, feature_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Feature {}", feature_id)))
    }

    /// Current features plus later snapshots, read from the local store only.
    pub async fn features_once_and_stream(
        &self,
        project_id: &str,
    ) -> Result<Subscription<Vec<Feature>>> {
        self.local.features_once_and_stream(project_id).await
    }

    /// Observations of a feature for one form, after a best-effort merge.
    ///
    /// # Errors
    /// - `NotFound` when the feature is unknown locally
    pub async fn get_observations(
        &self,
        project_id: &str,
        feature_id: &str,
        form_id: &str,
    ) -> Result<Vec<Observation>> {
        let feature = self.get_feature(project_id, feature_id).await?;
        self.reconciler.merge_observations(&feature).await;
        self.local.get_observations(feature_id, form_id).await
    }

    /// One observation, after a best-effort merge of its feature's observations.
    pub async fn get_observation(
        &self,
        project_id: &str,
        feature_id: &str,
        observation_id: &str,
    ) -> Result<Option<Observation>> {
        let feature = self.get_feature(project_id, feature_id).await?;
        self.reconciler.merge_observations(&feature).await;
        self.local.get_observation(feature_id, observation_id).await
    }

    /// Tile manager writing under the configured tile directory.
    pub fn tile_manager(&self, source: Arc<dyn TileSource>) -> TileDownloadManager {
        TileDownloadManager::new(self.local.clone(), source, &self.config)
    }

    pub fn shutdown(&self) {
        debug!("Shutting down sync context");
        self.delivery.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOutcome;
    use crate::retry::RetryConfig;
    use groundsync_common::{
        FeatureDelta, MutationType, ObservationDelta, Point, Response, ResponseDelta,
    };
    use groundsync_storage::{MemoryRemoteStore, SqliteLocalStore};
    use serde_json::json;
    use std::time::Duration;

    fn context(remote: &MemoryRemoteStore) -> (SyncContext, DeliverySchedulerHandle) {
        let config = SyncConfig {
            merge_timeout: Duration::from_millis(200),
            retry: RetryConfig::new(1)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
            ..SyncConfig::default()
        };
        SyncContext::new(
            Arc::new(SqliteLocalStore::in_memory().unwrap()),
            Arc::new(remote.clone()),
            config,
        )
    }

    fn create_feature() -> Mutation {
        Mutation::feature(
            MutationType::Create,
            "project id",
            "layer id",
            "user id",
            FeatureDelta {
                feature_id: "feature id".to_string(),
                new_location: Some(Point::new(51.0, 44.0).unwrap()),
            },
        )
    }

    fn observation(mutation_type: MutationType, deltas: Vec<ResponseDelta>) -> Mutation {
        Mutation::observation(
            mutation_type,
            "project id",
            "layer id",
            "user id",
            ObservationDelta {
                observation_id: "e1".to_string(),
                feature_id: "feature id".to_string(),
                form_id: "form id".to_string(),
                response_deltas: deltas,
            },
        )
    }

    #[tokio::test]
    async fn test_create_then_update_is_readable_and_queued() {
        let remote = MemoryRemoteStore::new();
        let (context, _handle) = context(&remote);

        context.apply_and_enqueue(create_feature()).await.unwrap();
        let create = context
            .apply_and_enqueue(observation(MutationType::Create, vec![]))
            .await
            .unwrap();
        let update = context
            .apply_and_enqueue(observation(
                MutationType::Update,
                vec![ResponseDelta::set("f", Response::Text("v2".to_string()))],
            ))
            .await
            .unwrap();

        let read = context
            .get_observation("project id", "feature id", "e1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            read.responses().get("f"),
            Some(&Response::Text("v2".to_string()))
        );
        assert_eq!(
            context.local().get_pending_mutations("e1").await.unwrap(),
            vec![create, update]
        );
    }

    #[tokio::test]
    async fn test_unknown_feature_is_not_found() {
        let remote = MemoryRemoteStore::new();
        let (context, _handle) = context(&remote);

        let err = context
            .get_observations("project id", "missing", "form id")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reads_survive_remote_outage() {
        let remote = MemoryRemoteStore::new();
        let (context, _handle) = context(&remote);
        context.apply_and_enqueue(create_feature()).await.unwrap();
        remote.fail_next(10);

        let features = context.get_features("project id").await.unwrap();
        assert_eq!(features.len(), 1);
    }

    #[tokio::test]
    async fn test_get_features_merges_remote() {
        let remote = MemoryRemoteStore::new();
        remote.add_feature_document(
            "project id",
            json!({
                "id": "remote feature",
                "layerId": "layer id",
                "location": { "latitude": 1.0, "longitude": 2.0 },
                "created": { "userId": "someone", "clientTimeMillis": 1000 }
            }),
        );
        let (context, _handle) = context(&remote);

        let features = context.get_features("project id").await.unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id(), "remote feature");
        assert!(context
            .local()
            .get_pending_mutations("remote feature")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_edits_are_delivered_in_background() {
        let remote = MemoryRemoteStore::new();
        let (context, handle) = context(&remote);
        let mut reports = context.delivery().subscribe();
        let worker = tokio::spawn(handle.run());

        let queued = context.apply_and_enqueue(create_feature()).await.unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.key, "feature id");
        assert_eq!(report.outcome, JobOutcome::Success);
        assert_eq!(remote.delivered(), vec![queued]);

        context.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_edit_survives_stopped_scheduler() {
        let remote = MemoryRemoteStore::new();
        let (context, handle) = context(&remote);
        drop(handle);

        let queued = context.apply_and_enqueue(create_feature()).await.unwrap();
        assert_eq!(
            context
                .local()
                .get_pending_mutations("feature id")
                .await
                .unwrap(),
            vec![queued]
        );
    }
}
