use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, SqlitePool};
use uuid::Uuid;

use crate::domains::sync::types::{
    ConflictRecord, ConflictReview, ConflictReviewRow, EntityType, ResolutionStrategy,
    ReviewStatus, SyncMetadata, SyncMetadataRow,
};
use crate::domains::sync::vector_clock::VectorClock;
use crate::errors::{DbError, DomainError, DomainResult};

/// Persisted per-(user, device, entity) sync state.
///
/// The source of truth for "has this device seen this version".
#[async_trait]
pub trait SyncMetadataRepository: Send + Sync {
    /// Insert-or-update keyed by (user, device, entity type, entity id).
    ///
    /// Never regresses a clock: the stored clock is the merge of old and
    /// new, so a stale client submission degrades to a no-op merge instead
    /// of overwriting newer state.
    async fn upsert(
        &self,
        user_id: Uuid,
        device_id: &str,
        entity_type: EntityType,
        entity_id: Uuid,
        clock: &VectorClock,
        checksum: &str,
        resolution: Option<ResolutionStrategy>,
    ) -> DomainResult<SyncMetadata>;

    /// Last-known state for one device's view of an entity.
    async fn find(
        &self,
        user_id: Uuid,
        device_id: &str,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> DomainResult<Option<SyncMetadata>>;

    /// All other devices' last-known clocks for the entity. The input to
    /// conflict detection.
    async fn get_peer_clocks(
        &self,
        user_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
        excluding_device_id: &str,
    ) -> DomainResult<Vec<(String, VectorClock)>>;
}

/// Escalated conflicts awaiting human resolution.
#[async_trait]
pub trait ManualReviewRepository: Send + Sync {
    /// Persist a conflict as `pending_review`.
    async fn create_pending(&self, record: &ConflictRecord) -> DomainResult<ConflictReview>;

    /// Pending reviews for a user, oldest first.
    async fn list_pending(&self, user_id: Uuid, limit: u32) -> DomainResult<Vec<ConflictReview>>;

    async fn find_review(&self, review_id: Uuid) -> DomainResult<Option<ConflictReview>>;

    /// Mark a review resolved by an external actor.
    async fn mark_resolved(&self, review_id: Uuid, resolved_by: Uuid) -> DomainResult<()>;
}

/// SQLite implementation of the SyncMetadataRepository
pub struct SqliteSyncMetadataRepository {
    pool: SqlitePool,
}

impl SqliteSyncMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncMetadataRepository for SqliteSyncMetadataRepository {
    async fn upsert(
        &self,
        user_id: Uuid,
        device_id: &str,
        entity_type: EntityType,
        entity_id: Uuid,
        clock: &VectorClock,
        checksum: &str,
        resolution: Option<ResolutionStrategy>,
    ) -> DomainResult<SyncMetadata> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let existing: Option<SyncMetadataRow> = query_as(
            "SELECT user_id, device_id, entity_type, entity_id, vector_clock, checksum, \
             conflict_resolution, last_sync \
             FROM sync_metadata \
             WHERE user_id = ? AND device_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(user_id.to_string())
        .bind(device_id)
        .bind(entity_type.as_str())
        .bind(entity_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        // Never-regress invariant: keep the component-wise max. A submitted
        // clock older than the stored one leaves the stored clock unchanged
        // and only refreshes last_sync.
        let (merged_clock, checksum_to_store) = match &existing {
            Some(row) => {
                let stored = VectorClock::parse(&row.vector_clock)?;
                let merged = VectorClock::merge([&stored, clock]);
                if merged == stored && stored != *clock {
                    log::warn!(
                        "stale clock submitted for {} {} by device {}; keeping stored state",
                        entity_type.as_str(),
                        entity_id,
                        device_id
                    );
                    (stored, row.checksum.clone())
                } else {
                    (merged, checksum.to_string())
                }
            }
            None => (clock.clone(), checksum.to_string()),
        };

        let now = Utc::now();
        query(
            "INSERT INTO sync_metadata \
             (user_id, device_id, entity_type, entity_id, vector_clock, checksum, conflict_resolution, last_sync) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, device_id, entity_type, entity_id) DO UPDATE SET \
             vector_clock = excluded.vector_clock, \
             checksum = excluded.checksum, \
             conflict_resolution = COALESCE(excluded.conflict_resolution, sync_metadata.conflict_resolution), \
             last_sync = excluded.last_sync",
        )
        .bind(user_id.to_string())
        .bind(device_id)
        .bind(entity_type.as_str())
        .bind(entity_id.to_string())
        .bind(merged_clock.to_json_string())
        .bind(&checksum_to_store)
        .bind(resolution.map(|r| r.as_str().to_string()))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;

        Ok(SyncMetadata {
            user_id,
            device_id: device_id.to_string(),
            entity_type,
            entity_id,
            vector_clock: merged_clock,
            checksum: checksum_to_store,
            conflict_resolution: resolution.or_else(|| {
                existing
                    .as_ref()
                    .and_then(|row| row.conflict_resolution.as_deref())
                    .and_then(|s| s.parse().ok())
            }),
            last_sync: now,
        })
    }

    async fn find(
        &self,
        user_id: Uuid,
        device_id: &str,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> DomainResult<Option<SyncMetadata>> {
        let row: Option<SyncMetadataRow> = query_as(
            "SELECT user_id, device_id, entity_type, entity_id, vector_clock, checksum, \
             conflict_resolution, last_sync \
             FROM sync_metadata \
             WHERE user_id = ? AND device_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(user_id.to_string())
        .bind(device_id)
        .bind(entity_type.as_str())
        .bind(entity_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(SyncMetadata::try_from).transpose()
    }

    async fn get_peer_clocks(
        &self,
        user_id: Uuid,
        entity_type: EntityType,
        entity_id: Uuid,
        excluding_device_id: &str,
    ) -> DomainResult<Vec<(String, VectorClock)>> {
        let rows: Vec<SyncMetadataRow> = query_as(
            "SELECT user_id, device_id, entity_type, entity_id, vector_clock, checksum, \
             conflict_resolution, last_sync \
             FROM sync_metadata \
             WHERE user_id = ? AND entity_type = ? AND entity_id = ? AND device_id != ? \
             ORDER BY device_id",
        )
        .bind(user_id.to_string())
        .bind(entity_type.as_str())
        .bind(entity_id.to_string())
        .bind(excluding_device_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter()
            .map(|row| {
                let clock = VectorClock::parse(&row.vector_clock)?;
                Ok((row.device_id, clock))
            })
            .collect()
    }
}

/// SQLite implementation of the ManualReviewRepository
pub struct SqliteManualReviewRepository {
    pool: SqlitePool,
}

impl SqliteManualReviewRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ManualReviewRepository for SqliteManualReviewRepository {
    async fn create_pending(&self, record: &ConflictRecord) -> DomainResult<ConflictReview> {
        let review = ConflictReview {
            id: Uuid::new_v4(),
            record: record.clone(),
            status: ReviewStatus::PendingReview,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };

        let updates_json = serde_json::to_string(&record.conflicting_updates)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize updates: {}", e)))?;

        query(
            "INSERT INTO conflict_reviews \
             (id, entity_type, entity_id, user_id, conflict_type, conflicting_updates, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(review.id.to_string())
        .bind(record.entity_type.as_str())
        .bind(record.entity_id.to_string())
        .bind(record.user_id.to_string())
        .bind(record.conflict_type.as_str())
        .bind(updates_json)
        .bind(review.status.as_str())
        .bind(review.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(review)
    }

    async fn list_pending(&self, user_id: Uuid, limit: u32) -> DomainResult<Vec<ConflictReview>> {
        let rows: Vec<ConflictReviewRow> = query_as(
            "SELECT id, entity_type, entity_id, user_id, conflict_type, conflicting_updates, \
             status, created_at, resolved_at, resolved_by \
             FROM conflict_reviews \
             WHERE user_id = ? AND status = 'pending_review' \
             ORDER BY created_at ASC \
             LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(ConflictReview::try_from).collect()
    }

    async fn find_review(&self, review_id: Uuid) -> DomainResult<Option<ConflictReview>> {
        let row: Option<ConflictReviewRow> = query_as(
            "SELECT id, entity_type, entity_id, user_id, conflict_type, conflicting_updates, \
             status, created_at, resolved_at, resolved_by \
             FROM conflict_reviews \
             WHERE id = ?",
        )
        .bind(review_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(ConflictReview::try_from).transpose()
    }

    async fn mark_resolved(&self, review_id: Uuid, resolved_by: Uuid) -> DomainResult<()> {
        let result = query(
            "UPDATE conflict_reviews \
             SET status = 'resolved', resolved_at = ?, resolved_by = ? \
             WHERE id = ? AND status = 'pending_review'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(resolved_by.to_string())
        .bind(review_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::NotFound(
                "conflict_review".to_string(),
                review_id.to_string(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_pool;
    use crate::domains::sync::types::{ConflictType, DeviceUpdate};
    use std::collections::BTreeMap;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries.iter().map(|(d, c)| (d.to_string(), *c)).collect()
    }

    #[tokio::test]
    async fn upsert_creates_then_advances() {
        let pool = memory_pool().await;
        let repo = SqliteSyncMetadataRepository::new(pool);
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let first = repo
            .upsert(user, "d1", EntityType::Todo, entity, &clock(&[("d1", 1)]), "aaa", None)
            .await
            .unwrap();
        assert_eq!(first.vector_clock, clock(&[("d1", 1)]));

        let second = repo
            .upsert(user, "d1", EntityType::Todo, entity, &clock(&[("d1", 2)]), "bbb", None)
            .await
            .unwrap();
        assert_eq!(second.vector_clock, clock(&[("d1", 2)]));
        assert_eq!(second.checksum, "bbb");
    }

    #[tokio::test]
    async fn upsert_never_regresses_a_clock() {
        let pool = memory_pool().await;
        let repo = SqliteSyncMetadataRepository::new(pool);
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        repo.upsert(user, "d1", EntityType::Todo, entity, &clock(&[("d1", 3), ("d2", 1)]), "new", None)
            .await
            .unwrap();

        // A stale client replays an older clock. The stored state must win.
        let after = repo
            .upsert(user, "d1", EntityType::Todo, entity, &clock(&[("d1", 1)]), "stale", None)
            .await
            .unwrap();
        assert_eq!(after.vector_clock, clock(&[("d1", 3), ("d2", 1)]));
        assert_eq!(after.checksum, "new");

        let found = repo
            .find(user, "d1", EntityType::Todo, entity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.vector_clock, clock(&[("d1", 3), ("d2", 1)]));
    }

    #[tokio::test]
    async fn upsert_merges_divergent_clocks() {
        let pool = memory_pool().await;
        let repo = SqliteSyncMetadataRepository::new(pool);
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        repo.upsert(user, "d1", EntityType::Subtask, entity, &clock(&[("d1", 2)]), "a", None)
            .await
            .unwrap();
        let merged = repo
            .upsert(user, "d1", EntityType::Subtask, entity, &clock(&[("d2", 1)]), "b", None)
            .await
            .unwrap();
        assert_eq!(merged.vector_clock, clock(&[("d1", 2), ("d2", 1)]));
    }

    #[tokio::test]
    async fn peer_clocks_exclude_the_requesting_device() {
        let pool = memory_pool().await;
        let repo = SqliteSyncMetadataRepository::new(pool);
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();

        repo.upsert(user, "d1", EntityType::Todo, entity, &clock(&[("d1", 2)]), "a", None)
            .await
            .unwrap();
        repo.upsert(user, "d2", EntityType::Todo, entity, &clock(&[("d1", 1), ("d2", 1)]), "b", None)
            .await
            .unwrap();

        let peers = repo
            .get_peer_clocks(user, EntityType::Todo, entity, "d1")
            .await
            .unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, "d2");
        assert_eq!(peers[0].1, clock(&[("d1", 1), ("d2", 1)]));
    }

    #[tokio::test]
    async fn pending_review_lifecycle() {
        let pool = memory_pool().await;
        let repo = SqliteManualReviewRepository::new(pool);
        let user = Uuid::new_v4();

        let record = ConflictRecord {
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Todo,
            user_id: user,
            conflict_type: ConflictType::ComplexSemanticConflict,
            conflicting_updates: vec![DeviceUpdate::new(
                "d1",
                BTreeMap::new(),
                clock(&[("d1", 1)]),
                Utc::now(),
            )],
        };

        let review = repo.create_pending(&record).await.unwrap();
        assert_eq!(review.status, ReviewStatus::PendingReview);
        assert!(repo.find_review(review.id).await.unwrap().is_some());
        assert!(repo.find_review(Uuid::new_v4()).await.unwrap().is_none());

        let pending = repo.list_pending(user, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.conflict_type, ConflictType::ComplexSemanticConflict);

        repo.mark_resolved(review.id, user).await.unwrap();
        assert!(repo.list_pending(user, 10).await.unwrap().is_empty());

        // Second resolution attempt is a NotFound, not a silent overwrite.
        assert!(repo.mark_resolved(review.id, user).await.is_err());
    }
}
