//! Type definitions for the background job queue.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::sync::types::{ConflictRecord, EntityType};
use crate::errors::{DomainError, ValidationError};

/// Job families hosted on the shared queue machinery.
///
/// They share priority/backoff/circuit-breaker semantics but carry
/// independent payloads; breakers are tracked per family so one failing
/// dependency cannot fast-fail the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobFamily {
    ConflictResolution,
    QualityReevaluation,
    LlmAnalysis,
}

impl JobFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobFamily::ConflictResolution => "conflict_resolution",
            JobFamily::QualityReevaluation => "quality_reevaluation",
            JobFamily::LlmAnalysis => "llm_analysis",
        }
    }

    pub fn all() -> [JobFamily; 3] {
        [
            JobFamily::ConflictResolution,
            JobFamily::QualityReevaluation,
            JobFamily::LlmAnalysis,
        ]
    }
}

impl FromStr for JobFamily {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict_resolution" => Ok(JobFamily::ConflictResolution),
            "quality_reevaluation" => Ok(JobFamily::QualityReevaluation),
            "llm_analysis" => Ok(JobFamily::LlmAnalysis),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid JobFamily string: {}", s)
            )))
        }
    }
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Dead,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Dead => "dead",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that still occupy the deduplication key. A failure is not a
    /// status of its own: a failed execution lands back in `Queued` (retry
    /// scheduled) or in `Dead` (attempts exhausted).
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Active)
    }
}

/// Queue priority, highest numeric value claimed first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    Background = 1,
    Low = 3,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl JobPriority {
    /// Derive priority from due-date proximity: the closer the deadline,
    /// the sooner the conflict must settle.
    pub fn from_due_date(due_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match due_date {
            None => JobPriority::Normal,
            Some(due) => {
                let remaining = due - now;
                if remaining <= Duration::hours(24) {
                    JobPriority::Critical
                } else if remaining <= Duration::hours(72) {
                    JobPriority::High
                } else if remaining <= Duration::days(7) {
                    JobPriority::Normal
                } else {
                    JobPriority::Low
                }
            }
        }
    }
}

impl From<JobPriority> for i32 {
    fn from(priority: JobPriority) -> Self {
        priority as i32
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        match value {
            v if v >= 9 => JobPriority::Critical,
            v if v >= 6 => JobPriority::High,
            v if v >= 4 => JobPriority::Normal,
            v if v >= 2 => JobPriority::Low,
            _ => JobPriority::Background,
        }
    }
}

/// Work item payloads, one shape per family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobPayload {
    ConflictResolution(ConflictRecord),
    QualityReevaluation {
        entity_type: EntityType,
        entity_id: Uuid,
        user_id: Uuid,
    },
    LlmAnalysis {
        entity_type: EntityType,
        entity_id: Uuid,
        user_id: Uuid,
        analysis_kind: String,
    },
}

impl JobPayload {
    pub fn family(&self) -> JobFamily {
        match self {
            JobPayload::ConflictResolution(_) => JobFamily::ConflictResolution,
            JobPayload::QualityReevaluation { .. } => JobFamily::QualityReevaluation,
            JobPayload::LlmAnalysis { .. } => JobFamily::LlmAnalysis,
        }
    }

    /// Deduplication key: identical pending work coalesces onto one job.
    pub fn dedup_key(&self) -> String {
        match self {
            JobPayload::ConflictResolution(record) => {
                format!("{}:{}", record.entity_id, record.conflict_type.as_str())
            }
            JobPayload::QualityReevaluation { entity_id, .. } => {
                format!("quality:{}", entity_id)
            }
            JobPayload::LlmAnalysis { entity_id, analysis_kind, .. } => {
                format!("llm:{}:{}", entity_id, analysis_kind)
            }
        }
    }
}

/// A unit of background work and its scheduling state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub family: JobFamily,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest moment the job may be claimed; pushed out by backoff.
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Cancellation seen while the job was active; an active job runs to
    /// completion but is dropped instead of retried when it fails.
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(payload: JobPayload, priority: JobPriority, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            family: payload.family(),
            payload,
            priority,
            status: JobStatus::Queued,
            attempts: 0,
            created_at: now,
            run_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            cancel_requested: false,
        }
    }
}

/// Retry/backoff policy shared by every family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^(attempt-1)`, capped. `attempt` is
    /// 1-based (the attempt that just failed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::milliseconds(delay as i64)
    }
}

/// Counts surfaced to operational tooling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    /// Queued jobs whose run_at is still in the future (backoff window).
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    /// Failure attempts recorded, including breaker fast-fails; terminal
    /// failures are the `dead` count.
    pub failed_attempts: u64,
    pub dead: usize,
    pub cancelled: u64,
    /// Breaker state per job family, e.g. "conflict_resolution" -> "open".
    pub breaker_states: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::milliseconds(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::milliseconds(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::milliseconds(4_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::milliseconds(8_000));
        // Capped from here on.
        assert_eq!(policy.delay_for_attempt(5), Duration::milliseconds(10_000));
        assert_eq!(policy.delay_for_attempt(30), Duration::milliseconds(10_000));
    }

    #[test]
    fn only_queued_and_active_jobs_occupy_the_dedup_key() {
        assert!(JobStatus::Queued.is_pending());
        assert!(JobStatus::Active.is_pending());
        assert!(!JobStatus::Completed.is_pending());
        assert!(!JobStatus::Dead.is_pending());
        assert!(!JobStatus::Cancelled.is_pending());
    }

    #[test]
    fn priority_tracks_due_date_proximity() {
        let now = Utc::now();
        assert_eq!(JobPriority::from_due_date(None, now), JobPriority::Normal);
        assert_eq!(
            JobPriority::from_due_date(Some(now + Duration::hours(2)), now),
            JobPriority::Critical
        );
        assert_eq!(
            JobPriority::from_due_date(Some(now + Duration::hours(48)), now),
            JobPriority::High
        );
        assert_eq!(
            JobPriority::from_due_date(Some(now + Duration::days(5)), now),
            JobPriority::Normal
        );
        assert_eq!(
            JobPriority::from_due_date(Some(now + Duration::days(30)), now),
            JobPriority::Low
        );
    }

    #[test]
    fn conflict_dedup_key_uses_entity_and_classification() {
        use crate::domains::sync::types::{ConflictType, EntityType};

        let entity_id = Uuid::new_v4();
        let record = ConflictRecord {
            entity_id,
            entity_type: EntityType::Todo,
            user_id: Uuid::new_v4(),
            conflict_type: ConflictType::SameFieldModification,
            conflicting_updates: vec![],
        };
        let payload = JobPayload::ConflictResolution(record);
        assert_eq!(
            payload.dedup_key(),
            format!("{}:same_field_modification", entity_id)
        );
        assert_eq!(payload.family(), JobFamily::ConflictResolution);
    }
}
