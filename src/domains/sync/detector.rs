//! Conflict detection: pairwise causal comparison of per-device updates,
//! classification, and per-entity coalescing.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::domains::sync::types::{ConflictRecord, ConflictType, DeviceUpdate, EntityType};
use crate::domains::sync::vector_clock::CausalOrdering;

/// Lifecycle fields where diverging concurrent writes signal contradictory
/// intent (complete vs. delete) that no field-level rule can merge.
const LIFECYCLE_FIELDS: &[&str] = &["completed", "deleted", "status"];

/// Fields describing subtask structure rather than scalar values.
const SUBTASK_ORDER_FIELD: &str = "subtask_order";
const SUBTASK_INSERT_FIELD: &str = "subtask_insertions";

/// Stateless detector; configuration-free so detection is reproducible.
#[derive(Debug, Default, Clone)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Compare every unordered pair of pending updates for one entity and
    /// coalesce all concurrent pairs into at most one ConflictRecord.
    ///
    /// Resolution operates on the full contributing set at once, never
    /// pairwise, so the outcome cannot depend on arrival order.
    pub fn detect(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
        user_id: Uuid,
        updates: &[DeviceUpdate],
    ) -> Option<ConflictRecord> {
        if updates.len() < 2 {
            return None;
        }

        let mut contributing: BTreeSet<usize> = BTreeSet::new();
        let mut classifications: BTreeSet<ConflictType> = BTreeSet::new();

        for i in 0..updates.len() {
            for j in (i + 1)..updates.len() {
                let a = &updates[i];
                let b = &updates[j];
                match a.vector_clock.compare(&b.vector_clock) {
                    CausalOrdering::Concurrent => {
                        contributing.insert(i);
                        contributing.insert(j);
                        classifications.insert(self.classify_pair(a, b));
                    }
                    // Causally ordered or identical pairs are not conflicts.
                    CausalOrdering::Before | CausalOrdering::After | CausalOrdering::Equal => {}
                }
            }
        }

        if contributing.is_empty() {
            return None;
        }

        let conflict_type = Self::dominant_classification(&classifications);
        let conflicting_updates: Vec<DeviceUpdate> = contributing
            .into_iter()
            .map(|idx| updates[idx].clone())
            .collect();

        log::info!(
            "conflict detected on {} {}: {} ({} updates)",
            entity_type.as_str(),
            entity_id,
            conflict_type.as_str(),
            conflicting_updates.len()
        );

        Some(ConflictRecord {
            entity_id,
            entity_type,
            user_id,
            conflict_type,
            conflicting_updates,
        })
    }

    /// Classify one concurrent pair by the fields it touches.
    fn classify_pair(&self, a: &DeviceUpdate, b: &DeviceUpdate) -> ConflictType {
        let fields_a: BTreeSet<&str> = a.field_names().collect();
        let fields_b: BTreeSet<&str> = b.field_names().collect();
        let shared: Vec<&&str> = fields_a.intersection(&fields_b).collect();

        if shared.is_empty() {
            return ConflictType::NonConflictingFields;
        }

        // Structural subtask changes take precedence over scalar rules.
        if shared.iter().any(|f| **f == SUBTASK_ORDER_FIELD) {
            return ConflictType::SubtaskOrdering;
        }
        if shared.iter().any(|f| **f == SUBTASK_INSERT_FIELD) {
            return ConflictType::ConcurrentSubtaskCreation;
        }

        // Diverging lifecycle writes (one device completes while another
        // deletes) contradict each other semantically.
        let semantic = shared.iter().any(|f| {
            LIFECYCLE_FIELDS.contains(*f)
                && a.changed_fields.get(**f) != b.changed_fields.get(**f)
        });
        if semantic {
            return ConflictType::ComplexSemanticConflict;
        }

        ConflictType::SameFieldModification
    }

    /// When different pairs produced different classifications, resolve to
    /// the one whose strategy is safest for the whole set.
    fn dominant_classification(classifications: &BTreeSet<ConflictType>) -> ConflictType {
        // Ordered from most to least demanding.
        const PRECEDENCE: &[ConflictType] = &[
            ConflictType::ComplexSemanticConflict,
            ConflictType::ConcurrentSubtaskCreation,
            ConflictType::SubtaskOrdering,
            ConflictType::SameFieldModification,
            ConflictType::NonConflictingFields,
        ];
        for candidate in PRECEDENCE {
            if classifications.contains(candidate) {
                return *candidate;
            }
        }
        ConflictType::ConcurrentModification
    }
}
