//! Append-only audit trail for conflict resolutions.
//!
//! Every automatic resolution writes one entry carrying the before/after
//! values and enough metadata to reconstruct why the winner won.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{query, query_as, FromRow, SqlitePool};
use uuid::Uuid;

use crate::domains::sync::types::{ConflictRecord, EntityType, ResolutionOutcome};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};

pub const ACTION_CONFLICT_RESOLVED: &str = "conflict_resolved";

/// One audit entry. `old_values` holds each conflicting device's submitted
/// fields; `new_values` the merged result that was committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: String,
    pub user_id: Uuid,
    /// The winning device for LWW-style outcomes; None for merges where
    /// no single device won.
    pub device_id: Option<String>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build the entry for a completed automatic resolution.
    pub fn conflict_resolved(record: &ConflictRecord, outcome: &ResolutionOutcome) -> Self {
        let old_values = serde_json::json!(record
            .conflicting_updates
            .iter()
            .map(|u| serde_json::json!({
                "deviceId": u.device_id,
                "fields": u.changed_fields,
                "timestamp": u.timestamp.to_rfc3339(),
            }))
            .collect::<Vec<_>>());

        let metadata = serde_json::json!({
            "conflictType": record.conflict_type.as_str(),
            "resolutionStrategy": outcome.strategy.as_str(),
            "conflictingDevices": record.conflicting_devices(),
            "confidence": outcome.confidence,
        });

        Self {
            id: Uuid::new_v4(),
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            action: ACTION_CONFLICT_RESOLVED.to_string(),
            user_id: record.user_id,
            device_id: outcome.winning_device.clone(),
            old_values: Some(old_values),
            new_values: Some(serde_json::json!(outcome.merged_fields)),
            metadata: Some(metadata),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> DomainResult<()>;

    /// Entries for one entity, newest first.
    async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: u32,
    ) -> DomainResult<Vec<AuditEntry>>;
}

#[derive(Debug, Clone, FromRow)]
struct AuditRow {
    id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    user_id: String,
    device_id: Option<String>,
    old_values: Option<String>,
    new_values: Option<String>,
    metadata: Option<String>,
    created_at: String,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = DomainError;
    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let parse_json = |s: Option<String>, field: &str| -> DomainResult<Option<serde_json::Value>> {
            s.map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    DomainError::Validation(ValidationError::format(
                        field,
                        &format!("Invalid JSON: {}", e),
                    ))
                })
            })
            .transpose()
        };

        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|_| DomainError::InvalidUuid(row.id.clone()))?,
            entity_type: EntityType::from_str(&row.entity_type)?,
            entity_id: Uuid::parse_str(&row.entity_id)
                .map_err(|_| DomainError::InvalidUuid(row.entity_id.clone()))?,
            action: row.action,
            user_id: Uuid::parse_str(&row.user_id)
                .map_err(|_| DomainError::InvalidUuid(row.user_id.clone()))?,
            device_id: row.device_id,
            old_values: parse_json(row.old_values, "audit_log.old_values")?,
            new_values: parse_json(row.new_values, "audit_log.new_values")?,
            metadata: parse_json(row.metadata, "audit_log.metadata")?,
            created_at: DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    DomainError::Validation(ValidationError::format(
                        "audit_log.created_at",
                        &format!("Invalid RFC3339 format: {}", row.created_at),
                    ))
                })?,
        })
    }
}

/// SQLite implementation of the AuditTrail
pub struct SqliteAuditTrail {
    pool: SqlitePool,
}

impl SqliteAuditTrail {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditTrail for SqliteAuditTrail {
    async fn record(&self, entry: &AuditEntry) -> DomainResult<()> {
        let to_json = |v: &Option<serde_json::Value>| -> DomainResult<Option<String>> {
            v.as_ref()
                .map(|value| {
                    serde_json::to_string(value).map_err(|e| {
                        DomainError::Internal(format!("Failed to serialize audit values: {}", e))
                    })
                })
                .transpose()
        };

        query(
            "INSERT INTO audit_log \
             (id, entity_type, entity_id, action, user_id, device_id, old_values, new_values, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.entity_type.as_str())
        .bind(entry.entity_id.to_string())
        .bind(&entry.action)
        .bind(entry.user_id.to_string())
        .bind(entry.device_id.as_deref())
        .bind(to_json(&entry.old_values)?)
        .bind(to_json(&entry.new_values)?)
        .bind(to_json(&entry.metadata)?)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: u32,
    ) -> DomainResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = query_as(
            "SELECT id, entity_type, entity_id, action, user_id, device_id, \
             old_values, new_values, metadata, created_at \
             FROM audit_log \
             WHERE entity_type = ? AND entity_id = ? \
             ORDER BY created_at DESC \
             LIMIT ?",
        )
        .bind(entity_type.as_str())
        .bind(entity_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}
