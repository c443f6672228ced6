//! Sync service: the orchestration layer tying metadata, detection,
//! queued resolution, entity commits and auditing together.
//!
//! `ingest_update` is the hot path and never resolves inline; conflicts go
//! to the background queue and the caller gets the job id back. The queue
//! worker drives `resolve_and_commit` through `ConflictJobProcessor`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domains::queue::types::{Job, JobFamily, JobPayload, JobPriority};
use crate::domains::queue::worker::JobProcessor;
use crate::domains::queue::JobQueue;
use crate::domains::sync::audit::{AuditEntry, AuditTrail};
use crate::domains::sync::detector::ConflictDetector;
use crate::domains::sync::repository::{ManualReviewRepository, SyncMetadataRepository};
use crate::domains::sync::resolver::ConflictResolver;
use crate::domains::sync::types::{
    content_checksum, ConflictRecord, ConflictReview, DeviceUpdate, EntityType,
    ResolutionOutcome, ResolutionStrategy, SyncMetadata,
};
use crate::domains::sync::vector_clock::CausalOrdering;
use crate::errors::{
    DbError, DomainError, ServiceError, ServiceResult, ValidationError,
};

/// Write access to the entities being synchronized. The host application
/// owns the todo/subtask tables; this crate only hands it merged field
/// maps to apply.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn apply_merged_fields(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        user_id: Uuid,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> ServiceResult<()>;
}

/// One incoming device update plus its addressing.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    /// Drives conflict-job priority; sooner deadlines resolve first.
    pub due_date: Option<DateTime<Utc>>,
    pub update: DeviceUpdate,
}

/// What `ingest_update` gives back immediately.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub metadata: SyncMetadata,
    /// Set when a conflict was detected and queued for resolution.
    pub conflict_job: Option<Uuid>,
}

#[async_trait]
pub trait SyncService: Send + Sync {
    /// Record a device update, detect conflicts against buffered peer
    /// updates, and queue resolution. Never blocks on resolving.
    async fn ingest_update(&self, request: IngestRequest) -> ServiceResult<IngestOutcome>;

    /// Resolve a detected conflict and commit the outcome: entity write,
    /// metadata upserts for every contributing device, audit entry.
    /// Escalations persist a pending review instead of committing.
    async fn resolve_and_commit(&self, record: &ConflictRecord) -> ServiceResult<ResolutionOutcome>;

    async fn pending_reviews(&self, user_id: Uuid, limit: u32) -> ServiceResult<Vec<ConflictReview>>;

    /// Apply a human decision to an escalated conflict and close it out.
    async fn complete_review(
        &self,
        review_id: Uuid,
        resolved_by: Uuid,
        resolved_fields: BTreeMap<String, serde_json::Value>,
    ) -> ServiceResult<()>;

    async fn audit_history(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: u32,
    ) -> ServiceResult<Vec<AuditEntry>>;
}

pub struct SyncServiceImpl {
    metadata_repo: Arc<dyn SyncMetadataRepository>,
    review_repo: Arc<dyn ManualReviewRepository>,
    audit: Arc<dyn AuditTrail>,
    entity_store: Arc<dyn EntityStore>,
    detector: ConflictDetector,
    resolver: Arc<ConflictResolver>,
    queue: Arc<JobQueue>,
    /// Updates awaiting resolution, per entity. Each device keeps at most
    /// one buffered update; a newer one from the same device replaces it.
    pending_updates: Mutex<HashMap<(EntityType, Uuid), Vec<DeviceUpdate>>>,
    /// Per-entity advisory locks serializing resolve-and-commit so two
    /// workers can never interleave commits for one entity.
    entity_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SyncServiceImpl {
    pub fn new(
        metadata_repo: Arc<dyn SyncMetadataRepository>,
        review_repo: Arc<dyn ManualReviewRepository>,
        audit: Arc<dyn AuditTrail>,
        entity_store: Arc<dyn EntityStore>,
        resolver: Arc<ConflictResolver>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            metadata_repo,
            review_repo,
            audit,
            entity_store,
            detector: ConflictDetector::new(),
            resolver,
            queue,
            pending_updates: Mutex::new(HashMap::new()),
            entity_locks: Mutex::new(HashMap::new()),
        }
    }

    fn validate(request: &IngestRequest) -> Result<(), ValidationError> {
        let update = &request.update;
        if update.device_id.trim().is_empty() {
            return Err(ValidationError::required("device_id"));
        }
        if update.changed_fields.is_empty() {
            return Err(ValidationError::required("changed_fields"));
        }
        // A device submitting an update must have counted its own write.
        if update.vector_clock.get(&update.device_id) == 0 {
            return Err(ValidationError::invalid_value(
                "vector_clock",
                "missing an entry for the submitting device",
            ));
        }
        Ok(())
    }

    async fn lock_for_entity(&self, entity_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.entity_locks.lock().await;
        locks
            .entry(entity_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody but the table holds it, so the
    /// table tracks in-flight entities instead of every entity ever seen.
    async fn release_entity_lock(&self, entity_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.entity_locks.lock().await;
        drop(lock);
        if let Some(stored) = locks.get(&entity_id) {
            if Arc::strong_count(stored) == 1 {
                locks.remove(&entity_id);
            }
        }
    }

    /// Buffer the update and return a snapshot of everything pending for
    /// the entity. Entries the incoming clock causally dominates are
    /// evicted: their writes are already folded into the newer update, so
    /// they can never be half of a concurrent pair again.
    async fn buffer_update(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        update: DeviceUpdate,
    ) -> Vec<DeviceUpdate> {
        let mut pending = self.pending_updates.lock().await;
        let entry = pending.entry((entity_type, entity_id)).or_default();
        entry.retain(|u| {
            u.device_id != update.device_id
                && !matches!(
                    update.vector_clock.compare(&u.vector_clock),
                    CausalOrdering::After | CausalOrdering::Equal
                )
        });
        entry.push(update);
        entry.clone()
    }

    async fn clear_buffer(&self, entity_type: EntityType, entity_id: Uuid) {
        self.pending_updates
            .lock()
            .await
            .remove(&(entity_type, entity_id));
    }

    async fn resolve_and_commit_locked(
        &self,
        record: &ConflictRecord,
    ) -> ServiceResult<ResolutionOutcome> {
        let outcome = self
            .resolver
            .resolve(record)
            .await
            .map_err(ServiceError::Domain)?;

        if outcome.requires_manual_review() {
            self.review_repo
                .create_pending(record)
                .await
                .map_err(ServiceError::Domain)?;
            log::info!(
                "conflict on {} {} escalated to manual review",
                record.entity_type.as_str(),
                record.entity_id
            );
        } else {
            self.commit_outcome(record, &outcome).await?;
        }

        self.clear_buffer(record.entity_type, record.entity_id).await;
        Ok(outcome)
    }

    async fn commit_outcome(
        &self,
        record: &ConflictRecord,
        outcome: &ResolutionOutcome,
    ) -> ServiceResult<()> {
        self.entity_store
            .apply_merged_fields(
                record.entity_type,
                record.entity_id,
                record.user_id,
                &outcome.merged_fields,
            )
            .await?;

        // Every contributing device converges on the resulting clock.
        let checksum = content_checksum(&outcome.merged_fields);
        for device_id in record.conflicting_devices() {
            self.metadata_repo
                .upsert(
                    record.user_id,
                    &device_id,
                    record.entity_type,
                    record.entity_id,
                    &outcome.resulting_clock,
                    &checksum,
                    Some(outcome.strategy),
                )
                .await
                .map_err(ServiceError::Domain)?;
        }

        self.audit
            .record(&AuditEntry::conflict_resolved(record, outcome))
            .await
            .map_err(ServiceError::Domain)?;
        Ok(())
    }
}

#[async_trait]
impl SyncService for SyncServiceImpl {
    async fn ingest_update(&self, request: IngestRequest) -> ServiceResult<IngestOutcome> {
        Self::validate(&request).map_err(DomainError::Validation)?;

        let update = &request.update;
        let checksum = content_checksum(&update.changed_fields);
        let metadata = self
            .metadata_repo
            .upsert(
                request.user_id,
                &update.device_id,
                request.entity_type,
                request.entity_id,
                &update.vector_clock,
                &checksum,
                None,
            )
            .await
            .map_err(ServiceError::Domain)?;

        let buffered = self
            .buffer_update(request.entity_type, request.entity_id, update.clone())
            .await;

        // Stored peer clocks are the cheap concurrency signal; the buffered
        // updates supply the field-level material for classification.
        let peers = self
            .metadata_repo
            .get_peer_clocks(
                request.user_id,
                request.entity_type,
                request.entity_id,
                &update.device_id,
            )
            .await
            .map_err(ServiceError::Domain)?;
        let concurrent_with_peer = peers.iter().any(|(_, peer_clock)| {
            update.vector_clock.compare(peer_clock) == CausalOrdering::Concurrent
        });
        if !concurrent_with_peer {
            return Ok(IngestOutcome {
                metadata,
                conflict_job: None,
            });
        }

        let conflict_job = match self.detector.detect(
            request.entity_id,
            request.entity_type,
            request.user_id,
            &buffered,
        ) {
            Some(record) => {
                let priority = JobPriority::from_due_date(request.due_date, Utc::now());
                let job_id = self
                    .queue
                    .enqueue(JobPayload::ConflictResolution(record), priority)
                    .await;
                Some(job_id)
            }
            None => None,
        };

        Ok(IngestOutcome {
            metadata,
            conflict_job,
        })
    }

    async fn resolve_and_commit(&self, record: &ConflictRecord) -> ServiceResult<ResolutionOutcome> {
        let lock = self.lock_for_entity(record.entity_id).await;
        let guard = lock.lock().await;
        let result = self.resolve_and_commit_locked(record).await;
        drop(guard);
        self.release_entity_lock(record.entity_id, lock).await;
        result
    }

    async fn pending_reviews(&self, user_id: Uuid, limit: u32) -> ServiceResult<Vec<ConflictReview>> {
        self.review_repo
            .list_pending(user_id, limit)
            .await
            .map_err(ServiceError::Domain)
    }

    async fn complete_review(
        &self,
        review_id: Uuid,
        resolved_by: Uuid,
        resolved_fields: BTreeMap<String, serde_json::Value>,
    ) -> ServiceResult<()> {
        let review = self
            .review_repo
            .find_review(review_id)
            .await
            .map_err(ServiceError::Domain)?
            .ok_or_else(|| {
                ServiceError::Domain(DomainError::Database(DbError::NotFound(
                    "conflict_review".to_string(),
                    review_id.to_string(),
                )))
            })?;

        let record = &review.record;
        let lock = self.lock_for_entity(record.entity_id).await;
        let guard = lock.lock().await;

        let outcome = ResolutionOutcome {
            strategy: ResolutionStrategy::ManualReviewRequired,
            merged_fields: resolved_fields,
            winning_device: None,
            confidence: 1.0,
            resulting_clock: record.merged_clock(),
        };
        let result = match self.commit_outcome(record, &outcome).await {
            Ok(()) => self
                .review_repo
                .mark_resolved(review_id, resolved_by)
                .await
                .map_err(ServiceError::Domain),
            Err(e) => Err(e),
        };

        drop(guard);
        self.release_entity_lock(record.entity_id, lock).await;
        result
    }

    async fn audit_history(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: u32,
    ) -> ServiceResult<Vec<AuditEntry>> {
        self.audit
            .list_for_entity(entity_type, entity_id, limit)
            .await
            .map_err(ServiceError::Domain)
    }
}

/// Bridges the queue worker to the sync service for conflict jobs.
pub struct ConflictJobProcessor {
    service: Arc<dyn SyncService>,
}

impl ConflictJobProcessor {
    pub fn new(service: Arc<dyn SyncService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobProcessor for ConflictJobProcessor {
    fn family(&self) -> JobFamily {
        JobFamily::ConflictResolution
    }

    async fn process(&self, job: &Job) -> ServiceResult<()> {
        let JobPayload::ConflictResolution(record) = &job.payload else {
            return Err(ServiceError::Configuration(format!(
                "conflict processor received a {} payload",
                job.family.as_str()
            )));
        };
        self.service.resolve_and_commit(record).await.map(|_| ())
    }
}

/// Recomputes quality scores after an entity changed shape.
#[async_trait]
pub trait QualityReevaluator: Send + Sync {
    async fn reevaluate(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<()>;
}

pub struct QualityJobProcessor {
    reevaluator: Arc<dyn QualityReevaluator>,
}

impl QualityJobProcessor {
    pub fn new(reevaluator: Arc<dyn QualityReevaluator>) -> Self {
        Self { reevaluator }
    }
}

#[async_trait]
impl JobProcessor for QualityJobProcessor {
    fn family(&self) -> JobFamily {
        JobFamily::QualityReevaluation
    }

    async fn process(&self, job: &Job) -> ServiceResult<()> {
        let JobPayload::QualityReevaluation {
            entity_type,
            entity_id,
            user_id,
        } = &job.payload
        else {
            return Err(ServiceError::Configuration(format!(
                "quality processor received a {} payload",
                job.family.as_str()
            )));
        };
        self.reevaluator
            .reevaluate(*entity_type, *entity_id, *user_id)
            .await
    }
}

/// Runs background LLM analyses (summaries, suggestions) over an entity.
#[async_trait]
pub trait LlmAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        user_id: Uuid,
        analysis_kind: &str,
    ) -> ServiceResult<()>;
}

pub struct LlmAnalysisJobProcessor {
    analyzer: Arc<dyn LlmAnalyzer>,
}

impl LlmAnalysisJobProcessor {
    pub fn new(analyzer: Arc<dyn LlmAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl JobProcessor for LlmAnalysisJobProcessor {
    fn family(&self) -> JobFamily {
        JobFamily::LlmAnalysis
    }

    async fn process(&self, job: &Job) -> ServiceResult<()> {
        let JobPayload::LlmAnalysis {
            entity_type,
            entity_id,
            user_id,
            analysis_kind,
        } = &job.payload
        else {
            return Err(ServiceError::Configuration(format!(
                "llm processor received a {} payload",
                job.family.as_str()
            )));
        };
        self.analyzer
            .analyze(*entity_type, *entity_id, *user_id, analysis_kind)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_pool;
    use crate::domains::queue::types::{JobStatus, RetryPolicy};
    use crate::domains::queue::worker::{QueueWorker, WorkerConfig};
    use crate::domains::sync::audit::SqliteAuditTrail;
    use crate::domains::sync::repository::{
        SqliteManualReviewRepository, SqliteSyncMetadataRepository,
    };
    use crate::domains::sync::types::ConflictType;
    use crate::domains::sync::vector_clock::VectorClock;

    #[derive(Default)]
    struct RecordingEntityStore {
        applied: Mutex<Vec<(Uuid, BTreeMap<String, serde_json::Value>)>>,
    }

    #[async_trait]
    impl EntityStore for RecordingEntityStore {
        async fn apply_merged_fields(
            &self,
            _entity_type: EntityType,
            entity_id: Uuid,
            _user_id: Uuid,
            fields: &BTreeMap<String, serde_json::Value>,
        ) -> ServiceResult<()> {
            self.applied.lock().await.push((entity_id, fields.clone()));
            Ok(())
        }
    }

    struct Harness {
        service: Arc<SyncServiceImpl>,
        queue: Arc<JobQueue>,
        store: Arc<RecordingEntityStore>,
    }

    async fn harness() -> Harness {
        let pool = memory_pool().await;
        let queue = Arc::new(JobQueue::new(RetryPolicy::default()));
        let store = Arc::new(RecordingEntityStore::default());
        let service = Arc::new(SyncServiceImpl::new(
            Arc::new(SqliteSyncMetadataRepository::new(pool.clone())),
            Arc::new(SqliteManualReviewRepository::new(pool.clone())),
            Arc::new(SqliteAuditTrail::new(pool)),
            store.clone(),
            Arc::new(ConflictResolver::with_defaults()),
            queue.clone(),
        ));
        Harness {
            service,
            queue,
            store,
        }
    }

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(d, c)| (d.to_string(), *c)).collect()
    }

    fn request(
        user: Uuid,
        entity: Uuid,
        device: &str,
        clock: VectorClock,
        fields: &[(&str, serde_json::Value)],
    ) -> IngestRequest {
        let changed: BTreeMap<String, serde_json::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        IngestRequest {
            user_id: user,
            entity_type: EntityType::Todo,
            entity_id: entity,
            due_date: None,
            update: DeviceUpdate::new(device, changed, clock, Utc::now()),
        }
    }

    #[tokio::test]
    async fn single_device_update_does_not_queue_a_job() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let outcome = h
            .service
            .ingest_update(request(
                user,
                entity,
                "phone",
                clock(&[("phone", 1)]),
                &[("title", serde_json::json!("buy milk"))],
            ))
            .await
            .unwrap();

        assert!(outcome.conflict_job.is_none());
        assert_eq!(outcome.metadata.vector_clock, clock(&[("phone", 1)]));
    }

    #[tokio::test]
    async fn rejects_updates_without_the_device_counter() {
        let h = harness().await;
        let result = h
            .service
            .ingest_update(request(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "phone",
                clock(&[("laptop", 1)]),
                &[("title", serde_json::json!("x"))],
            ))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_queue_exactly_one_job() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let first = h
            .service
            .ingest_update(request(
                user,
                entity,
                "phone",
                clock(&[("phone", 1)]),
                &[("title", serde_json::json!("call mom"))],
            ))
            .await
            .unwrap();
        assert!(first.conflict_job.is_none());

        let second = h
            .service
            .ingest_update(request(
                user,
                entity,
                "laptop",
                clock(&[("laptop", 1)]),
                &[("title", serde_json::json!("call mum"))],
            ))
            .await
            .unwrap();
        let job_id = second.conflict_job.expect("conflict job queued");

        // A third concurrent update to the same entity with the same
        // classification coalesces onto the existing job.
        let third = h
            .service
            .ingest_update(request(
                user,
                entity,
                "tablet",
                clock(&[("tablet", 1)]),
                &[("title", serde_json::json!("phone mom"))],
            ))
            .await
            .unwrap();
        assert_eq!(third.conflict_job, Some(job_id));
    }

    #[tokio::test]
    async fn conflict_free_ingest_does_not_accumulate_buffered_state() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        // A long causally-ordered stream from one device.
        let mut phone_clock = VectorClock::new();
        for i in 0..50 {
            phone_clock = phone_clock.increment("phone");
            let outcome = h
                .service
                .ingest_update(request(
                    user,
                    entity,
                    "phone",
                    phone_clock.clone(),
                    &[("title", serde_json::json!(format!("rev {}", i)))],
                ))
                .await
                .unwrap();
            assert!(outcome.conflict_job.is_none());
        }

        // Another device syncs, then writes on top of everything it saw.
        let laptop_clock = phone_clock.increment("laptop");
        let outcome = h
            .service
            .ingest_update(request(
                user,
                entity,
                "laptop",
                laptop_clock,
                &[("title", serde_json::json!("final"))],
            ))
            .await
            .unwrap();
        assert!(outcome.conflict_job.is_none());

        // Dominated entries were evicted: only the causal frontier remains.
        let pending = h.service.pending_updates.lock().await;
        assert_eq!(pending.len(), 1);
        let buffered = &pending[&(EntityType::Todo, entity)];
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].device_id, "laptop");
        drop(pending);

        assert!(h.service.entity_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resolve_and_commit_writes_entity_metadata_and_audit() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        // Disjoint fields: auto-merge unions both writes.
        h.service
            .ingest_update(request(
                user,
                entity,
                "phone",
                clock(&[("phone", 1)]),
                &[("title", serde_json::json!("new title"))],
            ))
            .await
            .unwrap();
        let outcome = h
            .service
            .ingest_update(request(
                user,
                entity,
                "laptop",
                clock(&[("laptop", 1)]),
                &[("context", serde_json::json!("@office"))],
            ))
            .await
            .unwrap();
        let job_id = outcome.conflict_job.unwrap();

        let job = h.queue.get(job_id).await.unwrap();
        let JobPayload::ConflictResolution(record) = &job.payload else {
            panic!("expected a conflict payload");
        };
        let resolution = h.service.resolve_and_commit(record).await.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::AutoMerge);

        // Resolution releases all transient per-entity state.
        assert!(h.service.pending_updates.lock().await.is_empty());
        assert!(h.service.entity_locks.lock().await.is_empty());

        let applied = h.store.applied.lock().await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1["title"], "new title");
        assert_eq!(applied[0].1["context"], "@office");
        drop(applied);

        let history = h
            .service
            .audit_history(EntityType::Todo, entity, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "conflict_resolved");
    }

    #[tokio::test]
    async fn semantic_conflicts_escalate_and_complete_via_review() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        // One device completes while the other deletes.
        h.service
            .ingest_update(request(
                user,
                entity,
                "phone",
                clock(&[("phone", 1)]),
                &[("status", serde_json::json!("completed"))],
            ))
            .await
            .unwrap();
        let outcome = h
            .service
            .ingest_update(request(
                user,
                entity,
                "laptop",
                clock(&[("laptop", 1)]),
                &[("status", serde_json::json!("deleted"))],
            ))
            .await
            .unwrap();
        let job_id = outcome.conflict_job.unwrap();

        let job = h.queue.get(job_id).await.unwrap();
        let JobPayload::ConflictResolution(record) = &job.payload else {
            panic!("expected a conflict payload");
        };
        assert_eq!(record.conflict_type, ConflictType::ComplexSemanticConflict);

        let resolution = h.service.resolve_and_commit(record).await.unwrap();
        assert!(resolution.requires_manual_review());
        // Nothing committed to the entity store yet.
        assert!(h.store.applied.lock().await.is_empty());

        let reviews = h.service.pending_reviews(user, 10).await.unwrap();
        assert_eq!(reviews.len(), 1);

        // Human picks the final state.
        let mut decided = BTreeMap::new();
        decided.insert("status".to_string(), serde_json::json!("completed"));
        h.service
            .complete_review(reviews[0].id, user, decided)
            .await
            .unwrap();

        assert_eq!(h.store.applied.lock().await.len(), 1);
        assert!(h.service.pending_reviews(user, 10).await.unwrap().is_empty());

        let history = h
            .service
            .audit_history(EntityType::Todo, entity, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let metadata = history[0].metadata.as_ref().unwrap();
        assert_eq!(metadata["resolutionStrategy"], "manual_review_required");
    }

    #[tokio::test]
    async fn worker_drives_conflict_resolution_end_to_end() {
        let h = harness().await;
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let processor: Arc<dyn JobProcessor> =
            Arc::new(ConflictJobProcessor::new(h.service.clone()));
        let (handle, _join) = QueueWorker::spawn(
            h.queue.clone(),
            vec![processor],
            WorkerConfig {
                poll_interval_ms: 60_000,
                ..WorkerConfig::default()
            },
        );

        h.service
            .ingest_update(request(
                user,
                entity,
                "phone",
                clock(&[("phone", 1)]),
                &[("title", serde_json::json!("a"))],
            ))
            .await
            .unwrap();
        let outcome = h
            .service
            .ingest_update(request(
                user,
                entity,
                "laptop",
                clock(&[("laptop", 1)]),
                &[("context", serde_json::json!("@home"))],
            ))
            .await
            .unwrap();
        let job_id = outcome.conflict_job.unwrap();

        assert_eq!(handle.process_now().await.unwrap(), 1);
        assert_eq!(h.queue.get(job_id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(h.store.applied.lock().await.len(), 1);

        handle.shutdown().await.unwrap();
    }
}
