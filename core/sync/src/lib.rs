//! Groundsync Sync Engine
//!
//! This module provides the background side of the offline-first engine:
//! - Best-effort merge of remote state as a prelude to local reads
//! - Ordered, de-duplicated delivery of pending mutations
//! - Resumable offline tile downloads
//! - Retry strategy with exponential backoff

pub mod config;
pub mod context;
pub mod delivery;
pub mod job;
pub mod reconciler;
pub mod retry;
pub mod tiles;

// Re-export main types
pub use config::SyncConfig;
pub use context::SyncContext;
pub use delivery::{
    deliver_pending, run_delivery, DeliveryPass, DeliveryReport, DeliveryScheduler,
    DeliverySchedulerHandle,
};
pub use job::{run_with_backoff, JobOutcome};
pub use reconciler::{MergeReconciler, MergeReport};
pub use retry::{RetryConfig, RetryExecutor};
pub use tiles::{
    ByteStream, HttpTileSource, MemoryTileSource, TileDownloadManager, TileFetch, TileSource,
    TransferProgress,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _source = MemoryTileSource::new();
        assert!(JobOutcome::Success.is_success());
    }
}
