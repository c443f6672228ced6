//! In-memory job queue with priority, deduplication, delayed retry and
//! cancellation.
//!
//! The explicit state machine (queued -> active -> completed, or back to
//! queued with backoff until the attempts run out and the job goes dead)
//! keeps retry and backoff logic testable without a broker.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domains::queue::types::{
    Job, JobPayload, JobPriority, JobStatus, QueueStats, RetryPolicy,
};

struct QueueInner {
    jobs: HashMap<Uuid, Job>,
    /// Pending dedup key -> owning job. Cleared on completion/death.
    dedup_index: HashMap<String, Uuid>,
    completed: u64,
    failed_attempts: u64,
    cancelled: u64,
}

/// Shared job queue. All mutation goes through the inner mutex; clones of
/// the surrounding `Arc` are handed to workers and services.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    retry_policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                dedup_index: HashMap::new(),
                completed: 0,
                failed_attempts: 0,
                cancelled: 0,
            }),
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Enqueue a work item. If an identical pending job exists (same dedup
    /// key, not yet completed), its id is returned instead of creating a
    /// duplicate.
    pub async fn enqueue(&self, payload: JobPayload, priority: JobPriority) -> Uuid {
        let now = Utc::now();
        self.enqueue_at(payload, priority, now).await
    }

    /// Enqueue with an explicit clock, for deterministic tests.
    pub async fn enqueue_at(
        &self,
        payload: JobPayload,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> Uuid {
        let key = payload.dedup_key();
        let mut inner = self.inner.lock().await;

        if let Some(existing_id) = inner.dedup_index.get(&key).copied() {
            let still_pending = inner
                .jobs
                .get(&existing_id)
                .map(|j| j.status.is_pending())
                .unwrap_or(false);
            if still_pending {
                log::debug!("deduplicated enqueue onto job {} ({})", existing_id, key);
                return existing_id;
            }
        }

        let job = Job::new(payload, priority, now);
        let id = job.id;
        inner.dedup_index.insert(key, id);
        inner.jobs.insert(id, job);
        id
    }

    /// Claim the most urgent runnable job: highest priority first, then
    /// earliest creation. Marks it active.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.run_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id)?;

        let job = inner.jobs.get_mut(&candidate)?;
        job.status = JobStatus::Active;
        job.started_at = Some(now);
        Some(job.clone())
    }

    /// Mark an active job done and release its dedup key.
    pub async fn complete(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
            let key = job.payload.dedup_key();
            inner.dedup_index.remove(&key);
            inner.completed += 1;
        }
    }

    /// Record a failure. When the error consumed a retry attempt and the
    /// budget is exhausted the job goes `dead`; otherwise it re-enters the
    /// queue delayed by exponential backoff (or by `retry_after` when the
    /// caller knows better, e.g. a breaker cool-down).
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: &str,
        consumes_attempt: bool,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<JobStatus> {
        let mut inner = self.inner.lock().await;
        inner.failed_attempts += 1;

        let max_attempts = self.retry_policy.max_attempts;
        let job = inner.jobs.get_mut(&job_id)?;
        job.last_error = Some(error.to_string());

        if consumes_attempt {
            job.attempts += 1;
        }

        // A cancellation seen mid-flight takes effect here: the failed
        // execution is not retried.
        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
            let key = job.payload.dedup_key();
            let status = job.status;
            inner.dedup_index.remove(&key);
            inner.cancelled += 1;
            return Some(status);
        }

        if job.attempts >= max_attempts {
            job.status = JobStatus::Dead;
            job.finished_at = Some(now);
            log::error!(
                "job {} ({}) dead after {} attempts: {}",
                job_id,
                job.family.as_str(),
                job.attempts,
                error
            );
            let key = job.payload.dedup_key();
            let status = job.status;
            inner.dedup_index.remove(&key);
            return Some(status);
        }

        let delay = retry_after
            .unwrap_or_else(|| self.retry_policy.delay_for_attempt(job.attempts.max(1)));
        job.status = JobStatus::Queued;
        job.run_at = now + delay;
        log::warn!(
            "job {} ({}) failed (attempt {}/{}), retrying in {}ms: {}",
            job_id,
            job.family.as_str(),
            job.attempts,
            max_attempts,
            delay.num_milliseconds(),
            error
        );
        Some(JobStatus::Queued)
    }

    /// Cancel a job. Queued jobs are withdrawn immediately. Active jobs
    /// cannot be preempted; the cancellation is remembered and prevents
    /// future retries if the in-flight execution fails. Terminal jobs
    /// cannot be cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return false;
        };
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                let key = job.payload.dedup_key();
                inner.dedup_index.remove(&key);
                inner.cancelled += 1;
                true
            }
            JobStatus::Active => {
                job.cancel_requested = true;
                true
            }
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled => false,
        }
    }

    /// Jobs stuck `active` past the deadline are pushed back to `queued`
    /// (worker crash recovery). Returns how many were reset.
    pub async fn recover_stale_active(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Active {
                let stale = job
                    .started_at
                    .map(|t| now - t > older_than)
                    .unwrap_or(true);
                if stale {
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                    job.run_at = now;
                    reset += 1;
                }
            }
        }
        if reset > 0 {
            log::warn!("reset {} stale active jobs", reset);
        }
        reset
    }

    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    /// Counts for the health endpoint. Breaker states are filled in by the
    /// worker, which owns the breakers.
    pub async fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            completed: inner.completed,
            failed_attempts: inner.failed_attempts,
            cancelled: inner.cancelled,
            ..Default::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Queued if job.run_at > now => stats.delayed += 1,
                JobStatus::Queued => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Dead => stats.dead += 1,
                _ => {}
            }
        }
        stats
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::types::{ConflictRecord, ConflictType, EntityType};

    fn conflict_payload(entity_id: Uuid, conflict_type: ConflictType) -> JobPayload {
        JobPayload::ConflictResolution(ConflictRecord {
            entity_id,
            entity_type: EntityType::Todo,
            user_id: Uuid::new_v4(),
            conflict_type,
            conflicting_updates: vec![],
        })
    }

    #[tokio::test]
    async fn duplicate_pending_enqueue_returns_existing_job() {
        let queue = JobQueue::default();
        let entity = Uuid::new_v4();

        let first = queue
            .enqueue(conflict_payload(entity, ConflictType::SameFieldModification), JobPriority::Normal)
            .await;
        let second = queue
            .enqueue(conflict_payload(entity, ConflictType::SameFieldModification), JobPriority::Normal)
            .await;
        assert_eq!(first, second);

        // A different classification for the same entity is separate work.
        let third = queue
            .enqueue(conflict_payload(entity, ConflictType::SubtaskOrdering), JobPriority::Normal)
            .await;
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn dedup_still_applies_while_job_is_active() {
        let queue = JobQueue::default();
        let entity = Uuid::new_v4();
        let payload = conflict_payload(entity, ConflictType::NonConflictingFields);

        let id = queue.enqueue(payload.clone(), JobPriority::Normal).await;
        let claimed = queue.claim_next(Utc::now()).await.unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Active);

        let again = queue.enqueue(payload.clone(), JobPriority::Normal).await;
        assert_eq!(again, id);

        // After completion the key frees up.
        queue.complete(id).await;
        let fresh = queue.enqueue(payload, JobPriority::Normal).await;
        assert_ne!(fresh, id);
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_age() {
        let queue = JobQueue::default();
        let now = Utc::now();

        let low = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Low, now)
            .await;
        let old_normal = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;
        let new_normal = queue
            .enqueue_at(
                conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification),
                JobPriority::Normal,
                now + Duration::seconds(1),
            )
            .await;
        let critical = queue
            .enqueue_at(
                conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification),
                JobPriority::Critical,
                now + Duration::seconds(2),
            )
            .await;

        let later = now + Duration::seconds(10);
        assert_eq!(queue.claim_next(later).await.unwrap().id, critical);
        assert_eq!(queue.claim_next(later).await.unwrap().id, old_normal);
        assert_eq!(queue.claim_next(later).await.unwrap().id, new_normal);
        assert_eq!(queue.claim_next(later).await.unwrap().id, low);
        assert!(queue.claim_next(later).await.is_none());
    }

    #[tokio::test]
    async fn failure_backs_off_exponentially_then_dies() {
        let queue = JobQueue::new(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        });
        let now = Utc::now();
        let id = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;

        // Attempt 1 fails: requeued 1s out.
        queue.claim_next(now).await.unwrap();
        let status = queue.fail(id, "timeout", true, None, now).await.unwrap();
        assert_eq!(status, JobStatus::Queued);
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.run_at, now + Duration::milliseconds(1_000));
        assert!(queue.claim_next(now).await.is_none());

        // Attempt 2 fails: 2s backoff.
        let t1 = now + Duration::seconds(2);
        queue.claim_next(t1).await.unwrap();
        queue.fail(id, "timeout", true, None, t1).await.unwrap();
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.run_at, t1 + Duration::milliseconds(2_000));

        // Attempt 3 exhausts the budget.
        let t2 = t1 + Duration::seconds(5);
        queue.claim_next(t2).await.unwrap();
        let status = queue.fail(id, "timeout", true, None, t2).await.unwrap();
        assert_eq!(status, JobStatus::Dead);

        let stats = queue.stats(t2).await;
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.failed_attempts, 3);
    }

    #[tokio::test]
    async fn breaker_fast_fail_does_not_consume_attempts() {
        let queue = JobQueue::new(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        });
        let now = Utc::now();
        let id = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;

        queue.claim_next(now).await.unwrap();
        queue
            .fail(id, "circuit open", false, Some(Duration::seconds(30)), now)
            .await
            .unwrap();
        let job = queue.get(id).await.unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.run_at, now + Duration::seconds(30));
    }

    #[tokio::test]
    async fn queued_jobs_cancel_immediately() {
        let queue = JobQueue::default();
        let now = Utc::now();
        let queued = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;

        assert!(queue.cancel(queued).await);
        assert_eq!(queue.get(queued).await.unwrap().status, JobStatus::Cancelled);
        assert!(queue.claim_next(now).await.is_none());

        // A terminal job cannot be cancelled again.
        assert!(!queue.cancel(queued).await);
    }

    #[tokio::test]
    async fn cancelling_an_active_job_prevents_its_retry() {
        let queue = JobQueue::default();
        let now = Utc::now();
        let id = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;

        let active = queue.claim_next(now).await.unwrap();
        assert!(queue.cancel(active.id).await);
        // The in-flight execution keeps running.
        assert_eq!(queue.get(id).await.unwrap().status, JobStatus::Active);

        // When it fails, the remembered cancellation wins over the retry.
        let status = queue.fail(id, "boom", true, None, now).await.unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert!(queue.claim_next(now + Duration::seconds(120)).await.is_none());

        // A success before the failure would have completed normally; the
        // flag only suppresses retries.
        let other = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;
        queue.claim_next(now).await.unwrap();
        assert!(queue.cancel(other).await);
        queue.complete(other).await;
        assert_eq!(queue.get(other).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stale_active_jobs_are_recovered() {
        let queue = JobQueue::default();
        let now = Utc::now();
        queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;
        queue.claim_next(now).await.unwrap();

        let later = now + Duration::minutes(20);
        let reset = queue.recover_stale_active(Duration::minutes(10), later).await;
        assert_eq!(reset, 1);
        assert!(queue.claim_next(later).await.is_some());
    }

    #[tokio::test]
    async fn delayed_jobs_show_in_stats() {
        let queue = JobQueue::default();
        let now = Utc::now();
        let id = queue
            .enqueue_at(conflict_payload(Uuid::new_v4(), ConflictType::SameFieldModification), JobPriority::Normal, now)
            .await;
        queue.claim_next(now).await.unwrap();
        queue.fail(id, "later", true, None, now).await.unwrap();

        let stats = queue.stats(now).await;
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
    }
}
