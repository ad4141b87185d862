//! Allocation and execution plans
//!
//! The plan is computed once when a session initializes and is immutable
//! afterwards. For every value it records where the value lives, whether the
//! frame allocates it, reuses a donor's buffer, or receives it from outside
//! (feeds and weights), and whether it needs a cross-device fence. For every
//! step it records which values die after the step.

pub mod planner;
pub mod value_map;

use std::fmt;
use std::sync::Arc;

use crate::enforce;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::AllocatorInfo;
use crate::provider::ProviderType;
use crate::value::ValueType;

pub use planner::AllocationPlanner;
pub use value_map::ValueNameIdxMap;

/// How a value obtains its memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Supplied from outside the frame (feed or weight)
    PreExisting,
    /// Fresh buffer from the location's allocator
    Allocate,
    /// Alias the buffer of `donor`, whose lifetime ends at the consumer's producer
    Reuse { donor: usize },
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::PreExisting => f.write_str("pre-existing"),
            AllocKind::Allocate => f.write_str("allocate"),
            AllocKind::Reuse { donor } => write!(f, "reuse #{}", donor),
        }
    }
}

/// Plan for one value
#[derive(Debug, Clone, PartialEq)]
pub struct AllocPlanEntry {
    pub value_type: ValueType,
    pub location: AllocatorInfo,
    pub kind: AllocKind,
    pub create_fence: bool,
    pub fence_provider: Option<ProviderType>,
}

impl AllocPlanEntry {
    pub fn new(value_type: ValueType, location: AllocatorInfo, kind: AllocKind) -> Self {
        Self {
            value_type,
            location,
            kind,
            create_fence: false,
            fence_provider: None,
        }
    }

    /// Request a fence created by `provider`
    pub fn with_fence(mut self, provider: ProviderType) -> Self {
        self.create_fence = true;
        self.fence_provider = Some(provider);
        self
    }
}

/// Per-value plan indexed by value id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationPlan {
    entries: Vec<AllocPlanEntry>,
}

impl AllocationPlan {
    pub fn new(entries: Vec<AllocPlanEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `id`; an out-of-range id is a contract violation
    pub fn entry(&self, id: usize) -> &AllocPlanEntry {
        enforce!(
            id < self.entries.len(),
            "value id {} out of range (plan has {} values)",
            id,
            self.entries.len()
        );
        &self.entries[id]
    }

    pub fn entries(&self) -> &[AllocPlanEntry] {
        &self.entries
    }

    /// Check reuse invariants: a donor must be a plain allocation (no
    /// chains), must not be the consumer itself, and must share the
    /// consumer's element type and location.
    pub fn validate(&self) -> ForgeResult<()> {
        for (id, entry) in self.entries.iter().enumerate() {
            let AllocKind::Reuse { donor } = entry.kind else {
                continue;
            };
            if donor == id {
                return Err(ForgeError::InvalidPlan(format!("value #{} reuses itself", id)));
            }
            let Some(donor_entry) = self.entries.get(donor) else {
                return Err(ForgeError::InvalidPlan(format!(
                    "value #{} reuses unknown value #{}",
                    id, donor
                )));
            };
            if donor_entry.kind != AllocKind::Allocate {
                return Err(ForgeError::InvalidPlan(format!(
                    "value #{} reuses #{} which is itself {}; reuse chains are not supported",
                    id, donor, donor_entry.kind
                )));
            }
            if !entry.value_type.is_tensor() || donor_entry.value_type != entry.value_type {
                return Err(ForgeError::InvalidPlan(format!(
                    "value #{} ({}) cannot reuse #{} ({})",
                    id, entry.value_type, donor, donor_entry.value_type
                )));
            }
            if donor_entry.location != entry.location {
                return Err(ForgeError::InvalidPlan(format!(
                    "value #{} at {} cannot reuse #{} at {}",
                    id, entry.location, donor, donor_entry.location
                )));
            }
        }
        Ok(())
    }
}

/// One node execution and the values released after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStep {
    pub node_index: usize,
    pub free_after: Vec<usize>,
}

/// Everything a run needs besides the graph itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub steps: Vec<ExecutionStep>,
    pub allocation_plan: Arc<AllocationPlan>,
}

impl ExecutionPlan {
    /// Human readable listing (used by the CLI `plan` command)
    pub fn describe(&self, values: &ValueNameIdxMap) -> String {
        let mut out = String::new();
        out.push_str("values:\n");
        for (id, entry) in self.allocation_plan.entries().iter().enumerate() {
            out.push_str(&format!(
                "  #{:<3} {:<24} {:<16} {:<20} {}{}\n",
                id,
                values.name(id),
                entry.value_type.to_string(),
                entry.location.to_string(),
                entry.kind,
                if entry.create_fence { " [fence]" } else { "" }
            ));
        }
        out.push_str("steps:\n");
        for (position, step) in self.steps.iter().enumerate() {
            let freed: Vec<&str> = step.free_after.iter().map(|&id| values.name(id)).collect();
            out.push_str(&format!(
                "  {:>3}: node {} frees {:?}\n",
                position, step.node_index, freed
            ));
        }
        out
    }
}
