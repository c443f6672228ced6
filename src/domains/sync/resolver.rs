//! Conflict resolution strategies.
//!
//! Strategy selection is keyed by the detector's classification, never by
//! caller choice, and `resolve` is a pure function of the conflict record
//! plus configuration so a retried job reproduces the same outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domains::sync::types::{
    ConflictRecord, ConflictType, DeviceUpdate, ResolutionOutcome, ResolutionStrategy,
};
use crate::errors::{DomainResult, SyncError, SyncResult};

/// Fields treated as long-form content, eligible for intelligent merging.
pub const CONTENT_FIELDS: &[&str] = &["description", "notes", "outcome_notes"];

const SUBTASK_ORDER_FIELD: &str = "subtask_order";
const SUBTASK_INSERT_FIELD: &str = "subtask_insertions";
const SUBTASK_DEPENDENCY_FIELD: &str = "subtask_dependencies";

/// Resolution policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Minimum confidence for an intelligent merge to be auto-accepted.
    pub confidence_threshold: f64,
    /// Minimum text length before a same-field edit is worth an
    /// intelligent merge instead of plain last-writer-wins.
    pub min_text_merge_len: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_text_merge_len: 40,
        }
    }
}

/// One device's version of a contested text field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextVariant {
    pub device_id: String,
    pub text: String,
}

/// Proposed combination of conflicting texts, with a confidence score the
/// resolver gates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMergeProposal {
    pub merged: String,
    pub confidence: f64,
}

/// External text-combination dependency (in production an LLM call; the
/// crate ships only the deterministic separator fallback).
#[async_trait]
pub trait TextMergeService: Send + Sync {
    async fn merge_texts(&self, field: &str, variants: &[TextVariant]) -> SyncResult<TextMergeProposal>;
}

/// Deterministic fallback merger: structural concatenation with separators.
///
/// Confidence is high when one variant extends the other, low when the
/// variants share little common prefix.
pub struct SeparatorTextMerge;

#[async_trait]
impl TextMergeService for SeparatorTextMerge {
    async fn merge_texts(&self, _field: &str, variants: &[TextVariant]) -> SyncResult<TextMergeProposal> {
        if variants.is_empty() {
            return Err(SyncError::TextMerge("no variants to merge".to_string()));
        }

        // Containment means one device simply kept typing: accept the
        // longer text outright.
        if variants.len() == 2 {
            let (a, b) = (&variants[0].text, &variants[1].text);
            if a.contains(b.as_str()) || b.contains(a.as_str()) {
                let longer = if a.len() >= b.len() { a } else { b };
                return Ok(TextMergeProposal {
                    merged: longer.clone(),
                    confidence: 0.95,
                });
            }
        }

        let merged = variants
            .iter()
            .map(|v| format!("[{}] {}", v.device_id, v.text))
            .collect::<Vec<_>>()
            .join("\n---\n");

        // Divergent texts concatenate fine but read poorly; keep the score
        // under the default threshold so they escalate.
        Ok(TextMergeProposal {
            merged,
            confidence: 0.5,
        })
    }
}

/// Applies a resolution strategy to a detected conflict.
pub struct ConflictResolver {
    config: ResolverConfig,
    text_merge: Arc<dyn TextMergeService>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig, text_merge: Arc<dyn TextMergeService>) -> Self {
        Self { config, text_merge }
    }

    pub fn with_defaults() -> Self {
        Self::new(ResolverConfig::default(), Arc::new(SeparatorTextMerge))
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Produce the merged state and resulting clock for a conflict.
    ///
    /// No side effects: persistence, metadata upserts and audit writes are
    /// the sync service's job after this returns.
    pub async fn resolve(&self, record: &ConflictRecord) -> DomainResult<ResolutionOutcome> {
        let outcome = match record.conflict_type {
            ConflictType::NonConflictingFields => self.auto_merge(record),
            ConflictType::SameFieldModification | ConflictType::ConcurrentModification => {
                self.merge_contested_fields(record).await?
            }
            ConflictType::SubtaskOrdering | ConflictType::ConcurrentSubtaskCreation => {
                self.reorder_subtasks(record)
            }
            ConflictType::ComplexSemanticConflict => self.escalate(record, 0.0),
        };

        log::info!(
            "resolved {} on {} {} via {} (confidence {:.2})",
            record.conflict_type.as_str(),
            record.entity_type.as_str(),
            record.entity_id,
            outcome.strategy.as_str(),
            outcome.confidence
        );
        Ok(outcome)
    }

    /// Union of all changed fields; valid because the field sets are
    /// disjoint, so the union is order-independent.
    fn auto_merge(&self, record: &ConflictRecord) -> ResolutionOutcome {
        let mut merged_fields = BTreeMap::new();
        for update in &record.conflicting_updates {
            for (field, value) in &update.changed_fields {
                merged_fields.insert(field.clone(), value.clone());
            }
        }
        ResolutionOutcome {
            strategy: ResolutionStrategy::AutoMerge,
            merged_fields,
            winning_device: None,
            confidence: 1.0,
            resulting_clock: record.merged_clock(),
        }
    }

    /// Same-field conflicts: long text goes through the intelligent merge
    /// path with a confidence gate, everything else is last-writer-wins.
    async fn merge_contested_fields(&self, record: &ConflictRecord) -> DomainResult<ResolutionOutcome> {
        let contested = contested_fields(&record.conflicting_updates);

        let mut merged_fields = BTreeMap::new();
        let mut used_intelligent = false;
        let mut min_confidence: f64 = 1.0;
        let mut lww_winner: Option<&DeviceUpdate> = None;

        for update in &record.conflicting_updates {
            for (field, value) in &update.changed_fields {
                if !contested.contains(field.as_str()) {
                    merged_fields.insert(field.clone(), value.clone());
                }
            }
        }

        for field in &contested {
            let writers: Vec<&DeviceUpdate> = record
                .conflicting_updates
                .iter()
                .filter(|u| u.changed_fields.contains_key(*field))
                .collect();

            if self.is_text_merge_candidate(field, &writers) {
                let variants: Vec<TextVariant> = writers
                    .iter()
                    .filter_map(|u| {
                        u.changed_fields
                            .get(*field)
                            .and_then(|v| v.as_str())
                            .map(|text| TextVariant {
                                device_id: u.device_id.clone(),
                                text: text.to_string(),
                            })
                    })
                    .collect();

                let proposal = self
                    .text_merge
                    .merge_texts(field, &variants)
                    .await
                    .map_err(crate::errors::DomainError::Sync)?;

                if proposal.confidence < self.config.confidence_threshold {
                    // Expected business outcome, not a fault.
                    return Ok(self.escalate(record, proposal.confidence));
                }
                min_confidence = min_confidence.min(proposal.confidence);
                merged_fields.insert(field.to_string(), serde_json::json!(proposal.merged));
                used_intelligent = true;
            } else {
                let Some(winner) = last_writer(&writers) else {
                    continue;
                };
                if let Some(value) = winner.changed_fields.get(*field) {
                    merged_fields.insert(field.to_string(), value.clone());
                }
                lww_winner = Some(match lww_winner {
                    Some(current) => last_writer(&[current, winner]).unwrap_or(winner),
                    None => winner,
                });
            }
        }

        let strategy = if used_intelligent {
            ResolutionStrategy::IntelligentMerge
        } else {
            ResolutionStrategy::LastWriterWins
        };

        Ok(ResolutionOutcome {
            strategy,
            merged_fields,
            winning_device: lww_winner.map(|u| u.device_id.clone()),
            confidence: min_confidence,
            resulting_clock: record.merged_clock(),
        })
    }

    fn is_text_merge_candidate(&self, field: &str, writers: &[&DeviceUpdate]) -> bool {
        if !CONTENT_FIELDS.contains(&field) {
            return false;
        }
        writers.iter().any(|u| {
            u.changed_fields
                .get(field)
                .and_then(|v| v.as_str())
                .map(|s| s.len() >= self.config.min_text_merge_len)
                .unwrap_or(false)
        })
    }

    /// Canonical subtask order: declared dependencies first, then stable
    /// original position. Device arrival order never participates.
    fn reorder_subtasks(&self, record: &ConflictRecord) -> ResolutionOutcome {
        let mut proposed_orders: Vec<Vec<String>> = Vec::new();
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut insertions: BTreeSet<(u64, String)> = BTreeSet::new();

        for update in &record.conflicting_updates {
            if let Some(order) = update.changed_fields.get(SUBTASK_ORDER_FIELD) {
                if let Some(ids) = string_array(order) {
                    proposed_orders.push(ids);
                }
            }
            if let Some(deps) = update.changed_fields.get(SUBTASK_DEPENDENCY_FIELD) {
                if let Some(map) = deps.as_object() {
                    for (id, prereqs) in map {
                        let entry = dependencies.entry(id.clone()).or_default();
                        if let Some(list) = string_array(prereqs) {
                            entry.extend(list);
                        }
                    }
                }
            }
            if let Some(inserted) = update.changed_fields.get(SUBTASK_INSERT_FIELD) {
                if let Some(items) = inserted.as_array() {
                    for item in items {
                        let position = item.get("position").and_then(|p| p.as_u64()).unwrap_or(u64::MAX);
                        if let Some(id) = item.get("id").and_then(|i| i.as_str()) {
                            insertions.insert((position, id.to_string()));
                        }
                    }
                }
            }
        }

        let canonical = canonical_order(&proposed_orders, &dependencies, &insertions);

        let mut merged_fields = BTreeMap::new();
        merged_fields.insert(
            SUBTASK_ORDER_FIELD.to_string(),
            serde_json::json!(canonical),
        );
        // Non-structural fields ride along via the union rule.
        for update in &record.conflicting_updates {
            for (field, value) in &update.changed_fields {
                if field != SUBTASK_ORDER_FIELD
                    && field != SUBTASK_INSERT_FIELD
                    && field != SUBTASK_DEPENDENCY_FIELD
                {
                    merged_fields.entry(field.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        ResolutionOutcome {
            strategy: ResolutionStrategy::PositionalReorder,
            merged_fields,
            winning_device: None,
            confidence: 1.0,
            resulting_clock: record.merged_clock(),
        }
    }

    fn escalate(&self, record: &ConflictRecord, confidence: f64) -> ResolutionOutcome {
        ResolutionOutcome {
            strategy: ResolutionStrategy::ManualReviewRequired,
            merged_fields: BTreeMap::new(),
            winning_device: None,
            confidence,
            resulting_clock: record.merged_clock(),
        }
    }
}

/// Fields changed by more than one contributing update.
fn contested_fields(updates: &[DeviceUpdate]) -> BTreeSet<&str> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut contested: BTreeSet<&str> = BTreeSet::new();
    for update in updates {
        for field in update.field_names() {
            if !seen.insert(field) {
                contested.insert(field);
            }
        }
    }
    contested
}

/// Latest wall-clock timestamp wins; timestamp ties go to the
/// lexicographically smallest device id so replays are deterministic.
fn last_writer<'a>(writers: &[&'a DeviceUpdate]) -> Option<&'a DeviceUpdate> {
    writers.iter().copied().max_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| b.device_id.cmp(&a.device_id))
    })
}

fn string_array(value: &serde_json::Value) -> Option<Vec<String>> {
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Kahn's algorithm over the declared dependency edges. The ready set is
/// ordered by (best proposed position, id), which makes the result stable
/// against input order and free of device bias.
fn canonical_order(
    proposed_orders: &[Vec<String>],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    insertions: &BTreeSet<(u64, String)>,
) -> Vec<String> {
    let mut ids: BTreeSet<String> = BTreeSet::new();
    for order in proposed_orders {
        ids.extend(order.iter().cloned());
    }
    for (_, id) in insertions {
        ids.insert(id.clone());
    }
    for (id, prereqs) in dependencies {
        ids.insert(id.clone());
        ids.extend(prereqs.iter().cloned());
    }

    // Best (smallest) position each id was proposed at, across all devices.
    let rank = |id: &str| -> u64 {
        let proposed = proposed_orders
            .iter()
            .filter_map(|order| order.iter().position(|x| x == id))
            .min()
            .map(|p| p as u64);
        let inserted = insertions
            .iter()
            .find(|(_, iid)| iid == id)
            .map(|(pos, _)| *pos);
        proposed.or(inserted).unwrap_or(u64::MAX)
    };

    let mut remaining: BTreeSet<String> = ids.clone();
    let mut result: Vec<String> = Vec::with_capacity(ids.len());

    while !remaining.is_empty() {
        // Ready = all prerequisites already emitted.
        let mut ready: Vec<&String> = remaining
            .iter()
            .filter(|id| {
                dependencies
                    .get(*id)
                    .map(|prereqs| prereqs.iter().all(|p| !remaining.contains(p)))
                    .unwrap_or(true)
            })
            .collect();

        if ready.is_empty() {
            // Dependency cycle: fall back to positional order for the rest.
            ready = remaining.iter().collect();
        }

        ready.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
        let next = ready[0].clone();
        remaining.remove(&next);
        result.push(next);
    }

    result
}
