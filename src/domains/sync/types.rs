use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::sync::vector_clock::VectorClock;
use crate::errors::{DomainError, ValidationError};

/// Entity kinds that participate in multi-device sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Todo,
    Subtask,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Todo => "todo",
            EntityType::Subtask => "subtask",
        }
    }
}

impl FromStr for EntityType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(EntityType::Todo),
            "subtask" => Ok(EntityType::Subtask),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid EntityType string: {}", s)
            )))
        }
    }
}

impl From<EntityType> for String {
    fn from(entity_type: EntityType) -> Self {
        entity_type.as_str().to_string()
    }
}

/// Classification of a detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Generic concurrent edit, no finer classification applied.
    ConcurrentModification,
    /// Concurrent updates touching disjoint field sets.
    NonConflictingFields,
    /// Concurrent updates touching the same field.
    SameFieldModification,
    /// Concurrent reordering of a subtask list.
    SubtaskOrdering,
    /// Concurrent insertion of new subtasks at the same position.
    ConcurrentSubtaskCreation,
    /// Contradictory content changes no automatic strategy can merge.
    ComplexSemanticConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentModification => "concurrent_modification",
            ConflictType::NonConflictingFields => "non_conflicting_fields",
            ConflictType::SameFieldModification => "same_field_modification",
            ConflictType::SubtaskOrdering => "subtask_ordering",
            ConflictType::ConcurrentSubtaskCreation => "concurrent_subtask_creation",
            ConflictType::ComplexSemanticConflict => "complex_semantic_conflict",
        }
    }
}

impl FromStr for ConflictType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrent_modification" => Ok(ConflictType::ConcurrentModification),
            "non_conflicting_fields" => Ok(ConflictType::NonConflictingFields),
            "same_field_modification" => Ok(ConflictType::SameFieldModification),
            "subtask_ordering" => Ok(ConflictType::SubtaskOrdering),
            "concurrent_subtask_creation" => Ok(ConflictType::ConcurrentSubtaskCreation),
            "complex_semantic_conflict" => Ok(ConflictType::ComplexSemanticConflict),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid ConflictType string: {}", s)
            )))
        }
    }
}

impl From<ConflictType> for String {
    fn from(conflict_type: ConflictType) -> Self {
        conflict_type.as_str().to_string()
    }
}

/// The strategy applied to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    AutoMerge,
    LastWriterWins,
    IntelligentMerge,
    PositionalReorder,
    ManualReviewRequired,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::AutoMerge => "auto_merge",
            ResolutionStrategy::LastWriterWins => "last_writer_wins",
            ResolutionStrategy::IntelligentMerge => "intelligent_merge",
            ResolutionStrategy::PositionalReorder => "positional_reorder",
            ResolutionStrategy::ManualReviewRequired => "manual_review_required",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_merge" => Ok(ResolutionStrategy::AutoMerge),
            "last_writer_wins" => Ok(ResolutionStrategy::LastWriterWins),
            "intelligent_merge" => Ok(ResolutionStrategy::IntelligentMerge),
            "positional_reorder" => Ok(ResolutionStrategy::PositionalReorder),
            "manual_review_required" => Ok(ResolutionStrategy::ManualReviewRequired),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid ResolutionStrategy string: {}", s)
            )))
        }
    }
}

impl From<ResolutionStrategy> for String {
    fn from(strategy: ResolutionStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

/// Status of an escalated conflict awaiting a human decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    PendingReview,
    Resolved,
    Dismissed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::PendingReview => "pending_review",
            ReviewStatus::Resolved => "resolved",
            ReviewStatus::Dismissed => "dismissed",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(ReviewStatus::PendingReview),
            "resolved" => Ok(ReviewStatus::Resolved),
            "dismissed" => Ok(ReviewStatus::Dismissed),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid ReviewStatus string: {}", s)
            )))
        }
    }
}

/// One device's pending update to an entity.
///
/// `changed_fields` maps field names to the new values the device wrote;
/// BTreeMap keeps iteration deterministic across resolution retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub changed_fields: BTreeMap<String, serde_json::Value>,
    pub vector_clock: VectorClock,
    pub timestamp: DateTime<Utc>,
}

impl DeviceUpdate {
    pub fn new(
        device_id: &str,
        changed_fields: BTreeMap<String, serde_json::Value>,
        vector_clock: VectorClock,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            changed_fields,
            vector_clock,
            timestamp,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.changed_fields.keys().map(String::as_str)
    }
}

/// A detected conflict: one per entity, carrying every contributing update.
///
/// Transient job payload. Only persisted (as a `conflict_reviews` row) when
/// escalated to manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub user_id: Uuid,
    pub conflict_type: ConflictType,
    pub conflicting_updates: Vec<DeviceUpdate>,
}

impl ConflictRecord {
    /// Devices contributing to the conflict, deduplicated, sorted.
    pub fn conflicting_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .conflicting_updates
            .iter()
            .map(|u| u.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Merged clock across every contributing update.
    pub fn merged_clock(&self) -> VectorClock {
        VectorClock::merge(self.conflicting_updates.iter().map(|u| &u.vector_clock))
    }
}

/// Immutable record of how a conflict was resolved. Feeds the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub strategy: ResolutionStrategy,
    pub merged_fields: BTreeMap<String, serde_json::Value>,
    pub winning_device: Option<String>,
    /// 0.0 - 1.0; gates auto-acceptance of intelligent merges.
    pub confidence: f64,
    pub resulting_clock: VectorClock,
}

impl ResolutionOutcome {
    pub fn requires_manual_review(&self) -> bool {
        matches!(self.strategy, ResolutionStrategy::ManualReviewRequired)
    }
}

/// Per-(user, device, entity) sync bookkeeping row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub user_id: Uuid,
    pub device_id: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub vector_clock: VectorClock,
    pub checksum: String,
    pub conflict_resolution: Option<ResolutionStrategy>,
    pub last_sync: DateTime<Utc>,
}

/// An escalated conflict persisted for human resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReview {
    pub id: Uuid,
    pub record: ConflictRecord,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
}

/// SHA-256 over the canonical JSON of an entity's fields. Stored alongside
/// the clock so metadata consumers can detect content drift cheaply.
pub fn content_checksum(fields: &BTreeMap<String, serde_json::Value>) -> String {
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn parse_uuid(uuid_str: &str, field_name: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(uuid_str).map_err(|_| DomainError::Validation(ValidationError::format(
        field_name, &format!("Invalid UUID format: {}", uuid_str)
    )))
}

fn parse_datetime(dt_str: &str, field_name: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::Validation(ValidationError::format(
            field_name, &format!("Invalid RFC3339 format: {}", dt_str)
        )))
}

fn parse_optional_datetime(dt_str: Option<String>, field_name: &str) -> Result<Option<DateTime<Utc>>, DomainError> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncMetadataRow {
    pub user_id: String,
    pub device_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub vector_clock: String,
    pub checksum: String,
    pub conflict_resolution: Option<String>,
    pub last_sync: String,
}

impl TryFrom<SyncMetadataRow> for SyncMetadata {
    type Error = DomainError;
    fn try_from(row: SyncMetadataRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: parse_uuid(&row.user_id, "sync_metadata.user_id")?,
            device_id: row.device_id,
            entity_type: EntityType::from_str(&row.entity_type)?,
            entity_id: parse_uuid(&row.entity_id, "sync_metadata.entity_id")?,
            vector_clock: VectorClock::parse(&row.vector_clock)?,
            checksum: row.checksum,
            conflict_resolution: row
                .conflict_resolution
                .map(|s| ResolutionStrategy::from_str(&s))
                .transpose()?,
            last_sync: parse_datetime(&row.last_sync, "sync_metadata.last_sync")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ConflictReviewRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub user_id: String,
    pub conflict_type: String,
    pub conflicting_updates: String,
    pub status: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

impl TryFrom<ConflictReviewRow> for ConflictReview {
    type Error = DomainError;
    fn try_from(row: ConflictReviewRow) -> Result<Self, Self::Error> {
        let conflicting_updates: Vec<DeviceUpdate> =
            serde_json::from_str(&row.conflicting_updates).map_err(|e| {
                DomainError::Validation(ValidationError::format(
                    "conflict_reviews.conflicting_updates",
                    &format!("Invalid JSON: {}", e),
                ))
            })?;
        Ok(Self {
            id: parse_uuid(&row.id, "conflict_reviews.id")?,
            record: ConflictRecord {
                entity_id: parse_uuid(&row.entity_id, "conflict_reviews.entity_id")?,
                entity_type: EntityType::from_str(&row.entity_type)?,
                user_id: parse_uuid(&row.user_id, "conflict_reviews.user_id")?,
                conflict_type: ConflictType::from_str(&row.conflict_type)?,
                conflicting_updates,
            },
            status: ReviewStatus::from_str(&row.status)?,
            created_at: parse_datetime(&row.created_at, "conflict_reviews.created_at")?,
            resolved_at: parse_optional_datetime(row.resolved_at, "conflict_reviews.resolved_at")?,
            resolved_by: row
                .resolved_by
                .as_deref()
                .map(|s| parse_uuid(s, "conflict_reviews.resolved_by"))
                .transpose()?,
        })
    }
}
