//! Background job queue: prioritized scheduling, retry with exponential
//! backoff, per-family circuit breakers and a polling worker.

pub mod circuit_breaker;
pub mod queue;
pub mod types;
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use queue::JobQueue;
pub use types::{Job, JobFamily, JobPayload, JobPriority, JobStatus, QueueStats, RetryPolicy};
pub use worker::{JobProcessor, QueueWorker, QueueWorkerHandle, WorkerConfig};
