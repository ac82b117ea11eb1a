//! Merge of remote entity state into the local store.
//!
//! Merges run as a prelude to local reads and are strictly best-effort: a
//! slow or failing remote never blocks or fails the read that follows.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use groundsync_common::{
    Entity, Feature, Mutation, MutationTarget, MutationType, Observation, Result,
};
use groundsync_storage::{LocalStore, RemoteItem, RemoteStore};

/// Counters describing one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Items written to the local store.
    pub merged: usize,
    /// Remote records that failed to decode.
    pub skipped: usize,
    /// Items left alone because a local delete is still pending.
    pub deferred: usize,
    /// Items the local store failed to write.
    pub failed: usize,
    /// The remote load timed out or failed; nothing was merged.
    pub abandoned: bool,
}

impl MergeReport {
    fn abandoned() -> Self {
        Self {
            abandoned: true,
            ..Self::default()
        }
    }
}

/// Folds remote snapshots into the local store without touching the
/// pending mutation queue.
pub struct MergeReconciler {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
    preserve_pending_edits: bool,
}

impl MergeReconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        timeout: Duration,
        preserve_pending_edits: bool,
    ) -> Self {
        Self {
            local,
            remote,
            timeout,
            preserve_pending_edits,
        }
    }

    /// Merge all remote features of a project.
    pub async fn merge_features(&self, project_id: &str) -> MergeReport {
        let scope = format!("features of project {}", project_id);
        match timeout(self.timeout, self.remote.load_features(project_id)).await {
            Ok(Ok(items)) => self.merge_items(&scope, items).await,
            Ok(Err(e)) => {
                warn!("Merge of {} abandoned: {}", scope, e);
                MergeReport::abandoned()
            }
            Err(_) => {
                warn!("Merge of {} timed out after {:?}", scope, self.timeout);
                MergeReport::abandoned()
            }
        }
    }

    /// Merge all remote observations of a feature.
    pub async fn merge_observations(&self, feature: &Feature) -> MergeReport {
        let scope = format!("observations of feature {}", feature.id());
        match timeout(self.timeout, self.remote.load_observations(feature)).await {
            Ok(Ok(items)) => self.merge_items(&scope, items).await,
            Ok(Err(e)) => {
                warn!("Merge of {} abandoned: {}", scope, e);
                MergeReport::abandoned()
            }
            Err(_) => {
                warn!("Merge of {} timed out after {:?}", scope, self.timeout);
                MergeReport::abandoned()
            }
        }
    }

    async fn merge_items<T: Into<Entity>>(
        &self,
        scope: &str,
        items: Vec<RemoteItem<T>>,
    ) -> MergeReport {
        let mut report = MergeReport::default();

        for (index, item) in items.into_iter().enumerate() {
            let entity = match item {
                Ok(value) => value.into(),
                Err(e) => {
                    warn!("Skipping remote record {} of {}: {}", index, scope, e);
                    report.skipped += 1;
                    continue;
                }
            };

            let id = entity.id().to_string();
            match self.merge_entity(entity).await {
                Ok(true) => report.merged += 1,
                Ok(false) => report.deferred += 1,
                Err(e) => {
                    warn!("Failed to merge {} from {}: {}", id, scope, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Merged {}: {} merged, {} skipped, {} deferred, {} failed",
            scope, report.merged, report.skipped, report.deferred, report.failed
        );
        report
    }

    /// Merge one entity. Returns `false` when it was deferred.
    async fn merge_entity(&self, entity: Entity) -> Result<bool> {
        let entity = if self.preserve_pending_edits {
            match self.rebase_pending(entity).await? {
                Some(entity) => entity,
                None => return Ok(false),
            }
        } else {
            entity
        };

        self.local.merge_entity(entity).await?;
        Ok(true)
    }

    /// Replay undelivered local edits on top of the remote state.
    ///
    /// Returns `None` when a local delete is still pending.
    async fn rebase_pending(&self, entity: Entity) -> Result<Option<Entity>> {
        let pending: Vec<Mutation> = self
            .local
            .get_pending_mutations(entity.id())
            .await?
            .into_iter()
            .filter(|m| m.entity_id() == entity.id())
            .collect();

        if pending.is_empty() {
            return Ok(Some(entity));
        }
        if pending
            .iter()
            .any(|m| m.mutation_type == MutationType::Delete)
        {
            debug!("Deferring merge of {}: local delete pending", entity.id());
            return Ok(None);
        }

        debug!(
            "Rebasing {} pending mutations onto remote {}",
            pending.len(),
            entity.id()
        );
        Ok(Some(match entity {
            Entity::Feature(feature) => Entity::Feature(rebase_feature(feature, &pending)),
            Entity::Observation(observation) => {
                Entity::Observation(rebase_observation(observation, &pending))
            }
        }))
    }
}

fn rebase_feature(feature: Feature, pending: &[Mutation]) -> Feature {
    let local_point = pending.iter().rev().find_map(|m| match &m.target {
        MutationTarget::Feature(delta) => delta.new_location,
        MutationTarget::Observation(_) => None,
    });
    match local_point {
        Some(point) => feature.with_point(point),
        None => feature,
    }
}

fn rebase_observation(observation: Observation, pending: &[Mutation]) -> Observation {
    let deltas = pending
        .iter()
        .filter_map(|m| match &m.target {
            MutationTarget::Observation(delta) => Some(&delta.response_deltas),
            MutationTarget::Feature(_) => None,
        })
        .flatten();
    let responses = observation.responses().with_deltas(deltas);
    observation.with_responses(responses)
}
