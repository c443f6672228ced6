//! Vector clocks: the causal-ordering primitive for multi-device sync.
//!
//! Clocks are immutable values. Every operation returns a new clock, which
//! keeps merge commutative/associative/idempotent and lets callers hold
//! references without fear of in-place mutation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult, SyncError};

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrdering {
    /// Left clock happened before the right one.
    Before,
    /// Left clock happened after the right one.
    After,
    /// Neither dominates: the updates were made without knowledge of each
    /// other. This is the conflict signal.
    Concurrent,
    /// Identical clocks.
    Equal,
}

impl CausalOrdering {
    /// The relation seen from the other operand's point of view.
    pub fn inverse(&self) -> Self {
        match self {
            CausalOrdering::Before => CausalOrdering::After,
            CausalOrdering::After => CausalOrdering::Before,
            CausalOrdering::Concurrent => CausalOrdering::Concurrent,
            CausalOrdering::Equal => CausalOrdering::Equal,
        }
    }
}

/// Per-device counter map. An empty map is a valid clock and means the
/// entity has never been synchronized.
///
/// BTreeMap keeps the wire format and Debug output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// A never-synced clock (`{}` on the wire).
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device, absent keys read as 0.
    pub fn get(&self, device_id: &str) -> u64 {
        self.counters.get(device_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Devices that have contributed to this clock.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.counters.keys().map(String::as_str)
    }

    /// New clock with the device's counter advanced by one.
    pub fn increment(&self, device_id: &str) -> VectorClock {
        let mut counters = self.counters.clone();
        *counters.entry(device_id.to_string()).or_insert(0) += 1;
        VectorClock { counters }
    }

    /// Component-wise maximum over every clock in `clocks`.
    ///
    /// Commutative, associative and idempotent; `merge(&[])` is the empty
    /// clock.
    pub fn merge<'a, I>(clocks: I) -> VectorClock
    where
        I: IntoIterator<Item = &'a VectorClock>,
    {
        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        for clock in clocks {
            for (device_id, &counter) in &clock.counters {
                let entry = counters.entry(device_id.clone()).or_insert(0);
                *entry = (*entry).max(counter);
            }
        }
        VectorClock { counters }
    }

    /// Component-wise comparison over the union of device keys.
    pub fn compare(&self, other: &VectorClock) -> CausalOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        for (device_id, &counter) in &self.counters {
            let other_counter = other.get(device_id);
            if counter > other_counter {
                self_greater = true;
            } else if counter < other_counter {
                other_greater = true;
            }
        }
        for (device_id, &counter) in &other.counters {
            if !self.counters.contains_key(device_id) && counter > 0 {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => CausalOrdering::After,
            (false, true) => CausalOrdering::Before,
            (true, true) => CausalOrdering::Concurrent,
            // Neither dominates. Only identical maps are Equal; disjoint
            // all-zero key sets still signal concurrent editing.
            (false, false) if self == other => CausalOrdering::Equal,
            (false, false) => CausalOrdering::Concurrent,
        }
    }

    /// Parse the JSON wire format, rejecting malformed clocks before they
    /// can enter the conflict pipeline.
    pub fn parse(raw: &str) -> DomainResult<VectorClock> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| SyncError::MalformedClock(format!("invalid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    /// Validate a decoded JSON value as a vector clock.
    pub fn from_json(value: &serde_json::Value) -> DomainResult<VectorClock> {
        let object = value.as_object().ok_or_else(|| {
            DomainError::Sync(SyncError::MalformedClock(
                "expected a JSON object of device counters".to_string(),
            ))
        })?;

        let mut counters = BTreeMap::new();
        for (device_id, counter) in object {
            if device_id.trim().is_empty() {
                return Err(DomainError::Sync(SyncError::MalformedClock(
                    "empty device-id key".to_string(),
                )));
            }
            let counter = counter.as_u64().ok_or_else(|| {
                DomainError::Sync(SyncError::MalformedClock(format!(
                    "counter for device '{}' must be a non-negative integer, got {}",
                    device_id, counter
                )))
            })?;
            counters.insert(device_id.clone(), counter);
        }
        Ok(VectorClock { counters })
    }

    /// Serialize to the JSON wire format.
    pub fn to_json_string(&self) -> String {
        // A map of String -> u64 cannot fail to serialize.
        serde_json::to_string(&self.counters).unwrap_or_else(|_| "{}".to_string())
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        VectorClock {
            counters: iter.into_iter().collect(),
        }
    }
}
