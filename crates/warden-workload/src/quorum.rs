//! Quorum guard for etcd member removal.
//!
//! The orchestrator must never be the one to drop etcd below quorum.
//! Before any member is removed, the guard works out which control
//! plane nodes would remain and refuses when there are too few.
//!
//! The check is not atomic with the removal that follows; callers
//! serialize membership operations per cluster.

use crate::error::{WorkloadError, WorkloadResult};

/// Minimum number of control plane nodes left after a removal.
pub const DEFAULT_MINIMUM_REMAINING_NODES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumGuard {
    minimum: usize,
}

impl Default for QuorumGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MINIMUM_REMAINING_NODES)
    }
}

impl QuorumGuard {
    pub fn new(minimum: usize) -> Self {
        Self { minimum }
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }

    /// Nodes left once `target` is gone, or an error if that is fewer
    /// than the minimum.
    ///
    /// `target` may be a node name or an etcd member name; any node
    /// whose name it contains is excluded.
    pub fn remaining_nodes(&self, live_nodes: &[String], target: &str) -> WorkloadResult<Vec<String>> {
        let remaining: Vec<String> = live_nodes
            .iter()
            .filter(|n| !target.contains(n.as_str()))
            .cloned()
            .collect();

        if remaining.len() < self.minimum {
            return Err(WorkloadError::BelowMinimumNodes {
                minimum: self.minimum,
                remaining: remaining.len(),
            });
        }
        Ok(remaining)
    }
}
