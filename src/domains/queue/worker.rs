//! Background worker draining the job queue.
//!
//! Message-driven: callers talk to the worker through a command channel and
//! get answers over oneshot channels, while an interval timer drives the
//! polling loop. Claimed jobs run on spawned tasks behind a semaphore sized
//! by `max_concurrent_jobs`, so independent entities resolve in parallel
//! while the service's per-entity locks serialize same-entity commits. One
//! circuit breaker per job family stands between the worker and each
//! processor's downstream dependency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use uuid::Uuid;

use crate::domains::queue::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::domains::queue::queue::JobQueue;
use crate::domains::queue::types::{Job, JobFamily, QueueStats};
use crate::errors::{ServiceError, ServiceResult};

/// Executes jobs of one family. Implementations own their dependencies
/// (resolver, LLM client, ...); the worker owns scheduling and fault
/// tolerance.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn family(&self) -> JobFamily;
    async fn process(&self, job: &Job) -> ServiceResult<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// How often the polling loop looks for runnable jobs.
    pub poll_interval_ms: u64,
    /// Hard deadline for a single job execution.
    pub job_timeout_ms: u64,
    /// Active jobs older than this are assumed orphaned and requeued.
    pub stale_active_ms: u64,
    pub breaker: CircuitBreakerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval_ms: 250,
            job_timeout_ms: 30_000,
            stale_active_ms: 10 * 60 * 1_000,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Commands accepted by the worker loop.
enum WorkerMessage {
    /// Drain every currently runnable job, reply with how many ran.
    ProcessNow {
        response: oneshot::Sender<usize>,
    },
    CancelJob {
        job_id: Uuid,
        response: oneshot::Sender<bool>,
    },
    GetStats {
        response: oneshot::Sender<QueueStats>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle for talking to a running worker.
#[derive(Clone)]
pub struct QueueWorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
}

impl QueueWorkerHandle {
    /// Run every runnable job right now. Returns the number processed.
    pub async fn process_now(&self) -> ServiceResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerMessage::ProcessNow { response: tx }).await?;
        rx.await
            .map_err(|_| ServiceError::ServiceUnavailable("queue worker stopped".to_string()))
    }

    /// Cancel a queued job, or flag an active one so it will not retry.
    pub async fn cancel_job(&self, job_id: Uuid) -> ServiceResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerMessage::CancelJob { job_id, response: tx })
            .await?;
        rx.await
            .map_err(|_| ServiceError::ServiceUnavailable("queue worker stopped".to_string()))
    }

    pub async fn stats(&self) -> ServiceResult<QueueStats> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerMessage::GetStats { response: tx }).await?;
        rx.await
            .map_err(|_| ServiceError::ServiceUnavailable("queue worker stopped".to_string()))
    }

    pub async fn shutdown(&self) -> ServiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerMessage::Shutdown { response: tx }).await?;
        rx.await
            .map_err(|_| ServiceError::ServiceUnavailable("queue worker stopped".to_string()))
    }

    async fn send(&self, message: WorkerMessage) -> ServiceResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ServiceError::ServiceUnavailable("queue worker stopped".to_string()))
    }
}

/// Everything a spawned job task needs, shared behind one Arc.
struct JobRunner {
    queue: Arc<JobQueue>,
    processors: HashMap<JobFamily, Arc<dyn JobProcessor>>,
    breakers: HashMap<JobFamily, Arc<Mutex<CircuitBreaker>>>,
    pool_permits: Arc<Semaphore>,
    config: WorkerConfig,
}

impl JobRunner {
    async fn process_claimed(&self, job: Job) {
        let Some(processor) = self.processors.get(&job.family) else {
            // No processor registered for this family; park the job.
            let now = Utc::now();
            self.queue
                .fail(job.id, "no processor registered", true, None, now)
                .await;
            return;
        };

        // Fast-fail while the breaker is open; the job re-enters the queue
        // after the cool-down without burning a retry attempt.
        if let Some(breaker) = self.breakers.get(&job.family) {
            let permitted = breaker.lock().await.call_permitted(Instant::now());
            if !permitted {
                let error = ServiceError::CircuitOpen {
                    job_family: job.family.as_str().to_string(),
                };
                let cool_down = ChronoDuration::from_std(self.config.breaker.reset_timeout)
                    .unwrap_or_else(|_| ChronoDuration::seconds(30));
                self.queue
                    .fail(
                        job.id,
                        &error.to_string(),
                        error.consumes_retry_attempt(),
                        Some(cool_down),
                        Utc::now(),
                    )
                    .await;
                return;
            }
        }

        let timeout = Duration::from_millis(self.config.job_timeout_ms);
        let result = match tokio::time::timeout(timeout, processor.process(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::JobTimeout {
                timeout_ms: self.config.job_timeout_ms,
            }),
        };

        match result {
            Ok(()) => {
                if let Some(breaker) = self.breakers.get(&job.family) {
                    breaker.lock().await.record_success();
                }
                self.queue.complete(job.id).await;
                log::debug!("job {} ({}) completed", job.id, job.family.as_str());
            }
            Err(error) => {
                if let Some(breaker) = self.breakers.get(&job.family) {
                    breaker.lock().await.record_failure(Instant::now());
                }
                self.queue
                    .fail(
                        job.id,
                        &error.to_string(),
                        error.consumes_retry_attempt(),
                        None,
                        Utc::now(),
                    )
                    .await;
            }
        }
    }

    /// Claim runnable jobs and run them on the bounded pool until the queue
    /// has nothing left. Waits for every spawned job before returning.
    async fn drain(runner: &Arc<JobRunner>) -> usize {
        let mut handles = Vec::new();
        loop {
            // Take a pool slot before claiming so a full pool back-pressures
            // the claim loop instead of marking jobs active early.
            let Ok(permit) = runner.pool_permits.clone().acquire_owned().await else {
                break;
            };
            let Some(job) = runner.queue.claim_next(Utc::now()).await else {
                drop(permit);
                break;
            };
            let task_runner = runner.clone();
            handles.push(tokio::spawn(async move {
                task_runner.process_claimed(job).await;
                drop(permit);
            }));
        }

        let processed = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        processed
    }

    async fn collect_stats(&self) -> QueueStats {
        let mut stats = self.queue.stats(Utc::now()).await;
        for (family, breaker) in &self.breakers {
            let state = breaker.lock().await.state();
            stats
                .breaker_states
                .insert(family.as_str().to_string(), state.as_str().to_string());
        }
        stats
    }
}

pub struct QueueWorker {
    runner: Arc<JobRunner>,
    receiver: mpsc::Receiver<WorkerMessage>,
}

impl QueueWorker {
    /// Build a worker and spawn its loop. The returned handle is the only
    /// way to talk to it.
    pub fn spawn(
        queue: Arc<JobQueue>,
        processors: Vec<Arc<dyn JobProcessor>>,
        config: WorkerConfig,
    ) -> (QueueWorkerHandle, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(64);

        let mut processor_map = HashMap::new();
        let mut breakers = HashMap::new();
        for processor in processors {
            let family = processor.family();
            breakers.insert(
                family,
                Arc::new(Mutex::new(CircuitBreaker::new(config.breaker.clone()))),
            );
            processor_map.insert(family, processor);
        }

        let runner = Arc::new(JobRunner {
            queue,
            processors: processor_map,
            breakers,
            pool_permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
        });

        let worker = QueueWorker { runner, receiver };
        let join = tokio::spawn(worker.run());
        (QueueWorkerHandle { sender }, join)
    }

    async fn run(mut self) {
        log::info!(
            "queue worker started ({} families, pool of {}, poll every {}ms)",
            self.runner.processors.len(),
            self.runner.config.max_concurrent_jobs,
            self.runner.config.poll_interval_ms
        );
        let mut poll =
            tokio::time::interval(Duration::from_millis(self.runner.config.poll_interval_ms));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    match message {
                        Some(WorkerMessage::ProcessNow { response }) => {
                            let processed = JobRunner::drain(&self.runner).await;
                            let _ = response.send(processed);
                        }
                        Some(WorkerMessage::CancelJob { job_id, response }) => {
                            let _ = response.send(self.runner.queue.cancel(job_id).await);
                        }
                        Some(WorkerMessage::GetStats { response }) => {
                            let _ = response.send(self.runner.collect_stats().await);
                        }
                        Some(WorkerMessage::Shutdown { response }) => {
                            log::info!("queue worker shutting down");
                            let _ = response.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = poll.tick() => {
                    self.runner.queue
                        .recover_stale_active(
                            ChronoDuration::milliseconds(self.runner.config.stale_active_ms as i64),
                            Utc::now(),
                        )
                        .await;
                    JobRunner::drain(&self.runner).await;
                }
            }
        }
    }
}
