//! warden-workload — etcd membership management for workload clusters.
//!
//! Keeps etcd membership aligned with the set of live control plane
//! nodes, refuses removals that would leave too few nodes behind, and
//! moves raft leadership off nodes that are about to go away.
//!
//! # Architecture
//!
//! ```text
//! Workload
//!   ├── reconcile_etcd_members(nodes) → remove members with no node
//!   ├── remove_member_for_node(name)
//!   │     └── QuorumGuard → first available remaining node → MemberRemove
//!   ├── forward_etcd_leadership(machine, candidate)
//!   │     └── leader client → MoveLeader to candidate's member
//!   └── etcd_members() → names as etcd reports them
//!         │
//!         ▼
//! NodeInventory (live control plane nodes)
//! ClientGenerator (warden-etcd), absent when etcd is not configured
//! ```

pub mod config;
pub mod error;
pub mod inventory;
pub mod quorum;
pub mod workload;

pub use config::WardenConfig;
pub use error::{WorkloadError, WorkloadResult};
pub use inventory::{Machine, NodeInventory, StaticInventory};
pub use quorum::QuorumGuard;
pub use workload::{ReconcileReport, Workload};
