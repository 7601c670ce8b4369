//! Error types for workload cluster membership operations.

use thiserror::Error;
use warden_etcd::{Aggregate, EtcdError};

/// Result type alias for workload operations.
pub type WorkloadResult<T> = Result<T, WorkloadError>;

/// Errors surfaced to the reconciliation loop.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// Removing the member would leave fewer control plane nodes than
    /// etcd quorum safety allows.
    #[error(
        "cluster would have {remaining} control plane nodes left, fewer than the minimum of {minimum}; removing an etcd member is not supported"
    )]
    BelowMinimumNodes { minimum: usize, remaining: usize },

    #[error("failed to list control plane nodes: {0}")]
    Inventory(#[source] anyhow::Error),

    /// An etcd call failed; `context` names the action.
    #[error("{context}: {source}")]
    Etcd {
        context: String,
        source: EtcdError,
    },

    #[error("leader candidate cannot be nil")]
    MissingLeaderCandidate,

    #[error("leader candidate {machine} has no node reference")]
    CandidateWithoutNode { machine: String },

    #[error("failed to get etcd member from node {node:?}")]
    MemberNotFound { node: String },

    #[error(transparent)]
    Aggregate(Aggregate<WorkloadError>),
}

impl WorkloadError {
    pub(crate) fn etcd(context: impl Into<String>, source: EtcdError) -> Self {
        WorkloadError::Etcd {
            context: context.into(),
            source,
        }
    }

    pub fn is_below_minimum_nodes(&self) -> bool {
        matches!(self, WorkloadError::BelowMinimumNodes { .. })
    }

    /// The underlying etcd error, if this wraps one.
    pub fn etcd_error(&self) -> Option<&EtcdError> {
        match self {
            WorkloadError::Etcd { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            WorkloadError::Etcd { source, .. } => source.is_cancelled(),
            WorkloadError::Aggregate(errors) => errors.iter().any(WorkloadError::is_cancelled),
            _ => false,
        }
    }
}
