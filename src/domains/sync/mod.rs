//! Multi-device synchronization: vector clocks, conflict detection and
//! resolution, sync metadata persistence and the audit trail.

pub mod audit;
pub mod detector;
pub mod repository;
pub mod resolver;
pub mod service;
pub mod types;
pub mod vector_clock;

pub use audit::{AuditEntry, AuditTrail, SqliteAuditTrail};
pub use detector::ConflictDetector;
pub use repository::{
    ManualReviewRepository, SqliteManualReviewRepository, SqliteSyncMetadataRepository,
    SyncMetadataRepository,
};
pub use resolver::{
    ConflictResolver, ResolverConfig, SeparatorTextMerge, TextMergeProposal, TextMergeService,
    TextVariant,
};
pub use service::{
    ConflictJobProcessor, EntityStore, IngestOutcome, IngestRequest, LlmAnalysisJobProcessor,
    LlmAnalyzer, QualityJobProcessor, QualityReevaluator, SyncService, SyncServiceImpl,
};
pub use types::{
    content_checksum, ConflictRecord, ConflictReview, ConflictType, DeviceUpdate, EntityType,
    ResolutionOutcome, ResolutionStrategy, ReviewStatus, SyncMetadata,
};
pub use vector_clock::{CausalOrdering, VectorClock};
