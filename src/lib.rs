//! Multi-device synchronization and conflict resolution for a task
//! management backend.
//!
//! The crate owns the sync bookkeeping (vector clocks, per-device
//! metadata), conflict detection and resolution strategies, a background
//! job queue with retry/backoff and per-family circuit breakers, and an
//! append-only audit trail. The host application supplies the entity
//! storage through [`EntityStore`] and receives merged field maps back.

pub mod database;
pub mod domains;
pub mod errors;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::domains::queue::worker::{JobProcessor, QueueWorker, QueueWorkerHandle, WorkerConfig};
use crate::domains::queue::{JobQueue, RetryPolicy};
use crate::domains::sync::resolver::{ConflictResolver, ResolverConfig, SeparatorTextMerge};
use crate::domains::sync::service::{ConflictJobProcessor, EntityStore, SyncServiceImpl};
use crate::domains::sync::{
    SqliteAuditTrail, SqliteManualReviewRepository, SqliteSyncMetadataRepository, TextMergeService,
};
use crate::errors::ServiceResult;

pub use crate::domains::sync::service::SyncService;

/// Everything tunable at assembly time.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub resolver: ResolverConfig,
    pub retry: RetryPolicy,
    pub worker: WorkerConfig,
}

/// Fully-wired sync subsystem: service, queue and a running worker.
///
/// Construction is explicit, no globals; drop the engine (after
/// `shutdown`) and everything stops.
pub struct SyncEngine {
    pub service: Arc<SyncServiceImpl>,
    pub queue: Arc<JobQueue>,
    pub worker: QueueWorkerHandle,
    worker_task: tokio::task::JoinHandle<()>,
}

impl SyncEngine {
    /// Wire repositories, resolver, queue and worker onto an existing
    /// pool. The schema must already be applied (see
    /// [`database::init_pool`]).
    ///
    /// `extra_processors` lets the host register handlers for the other
    /// job families (quality reevaluation, LLM analysis).
    pub fn start(
        pool: SqlitePool,
        entity_store: Arc<dyn EntityStore>,
        text_merge: Option<Arc<dyn TextMergeService>>,
        extra_processors: Vec<Arc<dyn JobProcessor>>,
        config: EngineConfig,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(config.retry));
        let resolver = Arc::new(ConflictResolver::new(
            config.resolver,
            text_merge.unwrap_or_else(|| Arc::new(SeparatorTextMerge)),
        ));

        let service = Arc::new(SyncServiceImpl::new(
            Arc::new(SqliteSyncMetadataRepository::new(pool.clone())),
            Arc::new(SqliteManualReviewRepository::new(pool.clone())),
            Arc::new(SqliteAuditTrail::new(pool)),
            entity_store,
            resolver,
            queue.clone(),
        ));

        let mut processors: Vec<Arc<dyn JobProcessor>> =
            vec![Arc::new(ConflictJobProcessor::new(service.clone()))];
        processors.extend(extra_processors);

        let (worker, worker_task) = QueueWorker::spawn(queue.clone(), processors, config.worker);

        Self {
            service,
            queue,
            worker,
            worker_task,
        }
    }

    /// Stop the worker loop and wait for it to finish.
    pub async fn shutdown(self) -> ServiceResult<()> {
        self.worker.shutdown().await?;
        let _ = self.worker_task.await;
        Ok(())
    }
}
