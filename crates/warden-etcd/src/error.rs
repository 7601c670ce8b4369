//! Error types for etcd access.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for etcd operations.
pub type EtcdResult<T> = Result<T, EtcdError>;

/// Errors that can occur while dialing or talking to etcd.
#[derive(Debug, Error)]
pub enum EtcdError {
    /// Caller bug, e.g. an empty candidate list.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single etcd endpoint could not be reached.
    #[error("failed to connect to etcd node {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    /// An RPC reached the server and was rejected.
    #[error("{action} on {endpoint} failed: {message}")]
    Rpc {
        endpoint: String,
        action: &'static str,
        message: String,
    },

    #[error("{action} on {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: String,
        action: &'static str,
        timeout: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// Every candidate failed with a connectivity error.
    #[error("{context}: {errors}")]
    Unreachable {
        context: &'static str,
        errors: Aggregate<EtcdError>,
    },

    /// The node answered, but its member list does not contain the
    /// leader it reports.
    #[error("etcd leader is reported as {leader_id:x}, but we couldn't find any matching member")]
    LeaderNotAMember { leader_id: u64 },

    /// Candidates were exhausted and at least one of them reported a
    /// leader that is not a member.
    #[error("could not resolve the etcd leader to a member: {errors}")]
    Inconsistent { errors: Aggregate<EtcdError> },

    /// The leader member does not correspond to any known node.
    #[error("etcd leader is reported as {leader_id:x} with name {name:?}, but we couldn't find a corresponding node in the cluster")]
    LeaderWithoutNode { leader_id: u64, name: String },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("credentials error: {0}")]
    Credentials(String),
}

impl EtcdError {
    /// Whether this failure is about reaching a node rather than about
    /// the node's answer.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            EtcdError::Connect { .. } | EtcdError::Timeout { .. } | EtcdError::Unreachable { .. }
        )
    }

    /// Whether etcd and the node inventory disagree in a way retries
    /// cannot fix.
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            EtcdError::LeaderNotAMember { .. }
                | EtcdError::Inconsistent { .. }
                | EtcdError::LeaderWithoutNode { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            EtcdError::Cancelled => true,
            EtcdError::Unreachable { errors, .. } | EtcdError::Inconsistent { errors } => {
                errors.iter().any(EtcdError::is_cancelled)
            }
            _ => false,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, EtcdError::InvalidArgument(_))
    }

    pub(crate) fn rpc(endpoint: &str, action: &'static str, status: tonic::Status) -> Self {
        EtcdError::Rpc {
            endpoint: endpoint.to_string(),
            action,
            message: status.message().to_string(),
        }
    }
}

/// A flattened list of errors collected across several nodes.
///
/// Renders a single error as itself and several as `[a, b]`.
#[derive(Debug)]
pub struct Aggregate<E>(Vec<E>);

impl<E> Aggregate<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self(errors)
    }

    /// `None` when nothing was collected.
    pub fn from_errors(errors: Vec<E>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<E> {
        self.0
    }
}

impl<E: fmt::Display> fmt::Display for Aggregate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [only] => write!(f, "{only}"),
            many => {
                f.write_str("[")?;
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{err}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Aggregate<E> {}

impl<E> IntoIterator for Aggregate<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
