//! Delivery of pending mutations to the remote store.
//!
//! Delivery is keyed by owning feature id. Requests for a key that is
//! already being delivered coalesce into a single re-run after the current
//! pass, so a burst of edits never produces concurrent passes over the same
//! backlog.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use groundsync_common::{Error, Result};
use groundsync_storage::{DeliveryOutcome, LocalStore, RemoteStore};

use crate::config::SyncConfig;
use crate::job::JobOutcome;
use crate::retry::{RetryConfig, RetryExecutor};

/// Result of one delivery pass over a key's backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryPass {
    /// Mutations accepted and removed from the queue.
    pub delivered: usize,
    /// Id and reason of the mutation the server refused, if any.
    pub rejected: Option<(Option<i64>, String)>,
}

/// Push every pending mutation for `key` in ascending id order.
///
/// Each accepted mutation leaves the queue before the next one is sent.
/// A rejection ends the pass and leaves the rejected mutation and all later
/// ones queued.
///
/// # Errors
/// - Transport errors from the remote store; mutations accepted before the
///   failure have already been removed
/// - `Storage` errors from the local store
pub async fn deliver_pending(
    local: &dyn LocalStore,
    remote: &dyn RemoteStore,
    key: &str,
) -> Result<DeliveryPass> {
    let pending = local.get_pending_mutations(key).await?;
    let mut pass = DeliveryPass::default();

    for mutation in pending {
        match remote.apply_mutation(&mutation).await? {
            DeliveryOutcome::Accepted => {
                local
                    .remove_pending_mutations(std::slice::from_ref(&mutation))
                    .await?;
                pass.delivered += 1;
            }
            DeliveryOutcome::Rejected(reason) => {
                warn!(
                    "Mutation {:?} for {} rejected: {}",
                    mutation.id, key, reason
                );
                pass.rejected = Some((mutation.id, reason));
                break;
            }
        }
    }

    Ok(pass)
}

/// Run a delivery job for `key`, retrying transport failures with backoff.
pub async fn run_delivery(
    local: &dyn LocalStore,
    remote: &dyn RemoteStore,
    retry: &RetryConfig,
    cancel: &CancellationToken,
    key: &str,
) -> JobOutcome {
    let executor = RetryExecutor::new(retry.clone());
    let result = executor
        .execute(cancel, || deliver_pending(local, remote, key))
        .await;

    match result {
        Ok(DeliveryPass {
            delivered,
            rejected: None,
        }) => {
            debug!("Delivered {} mutations for {}", delivered, key);
            JobOutcome::Success
        }
        Ok(DeliveryPass {
            delivered,
            rejected: Some((id, _)),
        }) => {
            warn!(
                "Delivery for {} stopped at mutation {:?} after {} accepted",
                key, id, delivered
            );
            JobOutcome::Failure
        }
        Err(e) => {
            warn!("Delivery for {} failed, mutations stay queued: {}", key, e);
            JobOutcome::Failure
        }
    }
}

/// Outcome of one delivery job, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub key: String,
    pub outcome: JobOutcome,
}

enum DeliveryRequest {
    Deliver(String),
    Shutdown,
}

/// Front end of the delivery worker.
///
/// Cheap to clone; every clone talks to the same worker loop.
#[derive(Clone)]
pub struct DeliveryScheduler {
    request_tx: mpsc::UnboundedSender<DeliveryRequest>,
    reports: broadcast::Sender<DeliveryReport>,
    cancel: CancellationToken,
}

impl DeliveryScheduler {
    /// Create a scheduler and the handle that runs its worker loop.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        config: &SyncConfig,
    ) -> (Self, DeliverySchedulerHandle) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let scheduler = Self {
            request_tx,
            reports: reports.clone(),
            cancel: cancel.clone(),
        };

        let handle = DeliverySchedulerHandle {
            local,
            remote,
            retry: config.retry.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            request_rx,
            reports,
            cancel,
        };

        (scheduler, handle)
    }

    /// Request eventual delivery of every pending mutation for `key`.
    ///
    /// Idempotent while a delivery for `key` is queued or running.
    ///
    /// # Errors
    /// - `Cancelled` if the worker loop has stopped
    pub fn enqueue_delivery(&self, key: &str) -> Result<()> {
        self.request_tx
            .send(DeliveryRequest::Deliver(key.to_string()))
            .map_err(|_| Error::Cancelled("Delivery scheduler not running".to_string()))
    }

    /// Receive a report for every finished delivery job.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    /// Stop the worker loop, cancelling running jobs between attempts.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.request_tx.send(DeliveryRequest::Shutdown);
    }
}

#[derive(Default)]
struct KeyState {
    rerun: bool,
}

/// Handle for the delivery background task.
pub struct DeliverySchedulerHandle {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    request_rx: mpsc::UnboundedReceiver<DeliveryRequest>,
    reports: broadcast::Sender<DeliveryReport>,
    cancel: CancellationToken,
}

impl DeliverySchedulerHandle {
    /// Run the worker loop. Spawn this in a tokio task.
    pub async fn run(mut self) {
        let mut active: HashMap<String, KeyState> = HashMap::new();
        let mut jobs: JoinSet<(String, JobOutcome)> = JoinSet::new();

        info!("Delivery scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(DeliveryRequest::Deliver(key)) => {
                        if let Some(state) = active.get_mut(&key) {
                            debug!("Delivery for {} already running, coalescing", key);
                            state.rerun = true;
                        } else {
                            active.insert(key.clone(), KeyState::default());
                            self.spawn(&mut jobs, key);
                        }
                    }
                    Some(DeliveryRequest::Shutdown) | None => break,
                },

                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    let (key, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!("Delivery task panicked: {}", e);
                            continue;
                        }
                    };

                    let _ = self.reports.send(DeliveryReport {
                        key: key.clone(),
                        outcome,
                    });

                    let rerun = active.get(&key).is_some_and(|state| state.rerun);
                    if rerun && !self.cancel.is_cancelled() {
                        active.insert(key.clone(), KeyState::default());
                        self.spawn(&mut jobs, key);
                    } else {
                        active.remove(&key);
                    }
                }

                _ = self.cancel.cancelled() => break,
            }
        }

        info!("Delivery scheduler shutting down");
        self.cancel.cancel();
        while let Some(joined) = jobs.join_next().await {
            if let Ok((key, outcome)) = joined {
                let _ = self.reports.send(DeliveryReport { key, outcome });
            }
        }
    }

    fn spawn(&self, jobs: &mut JoinSet<(String, JobOutcome)>, key: String) {
        let local = self.local.clone();
        let remote = self.remote.clone();
        let retry = self.retry.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        jobs.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (key, JobOutcome::Failure),
            };
            let outcome =
                run_delivery(local.as_ref(), remote.as_ref(), &retry, &cancel, &key).await;
            (key, outcome)
        });
    }
}
