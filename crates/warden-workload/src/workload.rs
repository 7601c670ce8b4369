//! etcd membership management for one workload cluster.
//!
//! A [`Workload`] pairs the orchestrator's node inventory with an
//! optional etcd client generator. Clusters provisioned without etcd
//! credentials have no generator, and every etcd operation on them is
//! a successful no-op.
//!
//! Every operation fetches a fresh member list before acting on it;
//! nothing read from etcd is kept between calls.

use std::slice;

use tracing::{debug, info, warn};
use warden_etcd::{
    Aggregate, ClientCreator, ClientGenerator, EtcdApi, EtcdClientCreator, member_for_name,
};

use crate::error::{WorkloadError, WorkloadResult};
use crate::inventory::{Machine, NodeInventory, node_of};
use crate::quorum::QuorumGuard;

/// Outcome of [`Workload::reconcile_etcd_members`].
///
/// Members are listed in `removed` when removal was attempted, whether
/// or not it succeeded; failures are collected in `errors`.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub errors: Vec<WorkloadError>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Split into removed names and an aggregate of the failures.
    pub fn into_parts(self) -> (Vec<String>, Option<WorkloadError>) {
        let err = Aggregate::from_errors(self.errors).map(WorkloadError::Aggregate);
        (self.removed, err)
    }

    fn record_removed(&mut self, name: &str) {
        if !self.removed.iter().any(|n| n == name) {
            self.removed.push(name.to_string());
        }
    }
}

/// Handle on a workload cluster's etcd membership.
pub struct Workload<I, C = EtcdClientCreator> {
    inventory: I,
    etcd: Option<ClientGenerator<C>>,
    quorum: QuorumGuard,
}

impl<I, C> Workload<I, C>
where
    I: NodeInventory,
    C: ClientCreator,
{
    pub fn new(inventory: I, etcd: Option<ClientGenerator<C>>) -> Self {
        Self {
            inventory,
            etcd,
            quorum: QuorumGuard::default(),
        }
    }

    pub fn with_quorum_guard(mut self, quorum: QuorumGuard) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    /// Whether etcd can be reached at all for this cluster.
    pub fn has_etcd_access(&self) -> bool {
        self.etcd.is_some()
    }

    /// Remove etcd members that have no corresponding node.
    ///
    /// Each node is asked for the member list independently; a node
    /// that cannot be reached is skipped. Members without a name have
    /// not finished joining and are left alone.
    pub async fn reconcile_etcd_members(&self, node_names: &[String]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let Some(generator) = &self.etcd else {
            return report;
        };

        for node_name in node_names {
            if let Err(cancelled) = self
                .reconcile_etcd_member(generator, node_names, node_name, &mut report)
                .await
            {
                report.errors.push(cancelled);
                break;
            }
        }

        if !report.removed.is_empty() {
            info!(removed = ?report.removed, errors = report.errors.len(), "reconciled etcd members");
        }
        report
    }

    /// Prune stale members as seen from one node. Only returns an
    /// error on cancellation; everything else lands in `report`.
    async fn reconcile_etcd_member(
        &self,
        generator: &ClientGenerator<C>,
        node_names: &[String],
        node_name: &String,
        report: &mut ReconcileReport,
    ) -> WorkloadResult<()> {
        let mut client = match generator
            .for_first_available_node(slice::from_ref(node_name))
            .await
        {
            Ok(client) => client,
            Err(e) if e.is_cancelled() => {
                return Err(WorkloadError::etcd("reconcile etcd members", e));
            }
            Err(e) => {
                debug!(node = %node_name, error = %e, "skipping unreachable etcd node");
                return Ok(());
            }
        };

        let members = match client.members().await {
            Ok(members) => members,
            Err(e) if e.is_cancelled() => {
                return Err(WorkloadError::etcd("reconcile etcd members", e));
            }
            Err(e) => {
                debug!(node = %node_name, error = %e, "skipping etcd node that cannot list members");
                return Ok(());
            }
        };
        client.close();

        for member in &members {
            if !member.is_started() {
                continue;
            }
            if node_names.iter().any(|n| member.is_on_node(n)) {
                continue;
            }

            report.record_removed(&member.name);
            if let Err(e) = self.remove_member_for_node(&member.name).await {
                warn!(member = %member.name, error = %e, "failed to remove stale etcd member");
                if e.is_cancelled() {
                    return Err(e);
                }
                report.errors.push(e);
            }
        }

        Ok(())
    }

    /// Remove the etcd member of the node backing `machine`.
    ///
    /// A missing machine or a machine without a node is a no-op.
    pub async fn remove_etcd_member_for_machine(&self, machine: Option<&Machine>) -> WorkloadResult<()> {
        let Some(node) = node_of(machine) else {
            return Ok(());
        };
        self.remove_member_for_node(node).await
    }

    /// Remove the etcd member hosted on `name`.
    ///
    /// Refuses before touching etcd if too few control plane nodes
    /// would remain. A member that is already gone is a no-op.
    pub async fn remove_member_for_node(&self, name: &str) -> WorkloadResult<()> {
        let nodes = self.control_plane_nodes().await?;
        let remaining = self.quorum.remaining_nodes(&nodes, name)?;

        let Some(generator) = &self.etcd else {
            return Ok(());
        };

        // Never go through the member being removed.
        let mut client = generator
            .for_first_available_node(&remaining)
            .await
            .map_err(|e| WorkloadError::etcd("failed to create etcd client", e))?;

        let members = client
            .members()
            .await
            .map_err(|e| WorkloadError::etcd("failed to list etcd members using etcd client", e))?;

        let Some(member) = member_for_name(&members, name) else {
            debug!(%name, "etcd member already removed");
            return Ok(());
        };

        client.remove_member(member.id).await.map_err(|e| {
            WorkloadError::etcd(format!("failed to remove member {} from etcd", member.name), e)
        })?;

        info!(member = %member.name, id = format_args!("{:x}", member.id), "removed etcd member");
        Ok(())
    }

    /// Move etcd leadership off `machine`'s node, to `leader_candidate`'s
    /// node, if `machine`'s node currently hosts the leader.
    pub async fn forward_etcd_leadership(
        &self,
        machine: Option<&Machine>,
        leader_candidate: Option<&Machine>,
    ) -> WorkloadResult<()> {
        let Some(outgoing) = node_of(machine) else {
            return Ok(());
        };

        let candidate = leader_candidate.ok_or(WorkloadError::MissingLeaderCandidate)?;
        let Some(incoming) = candidate.node_name() else {
            return Err(WorkloadError::CandidateWithoutNode {
                machine: candidate.name.clone(),
            });
        };

        let Some(generator) = &self.etcd else {
            return Ok(());
        };

        let nodes = self.control_plane_nodes().await?;
        let mut client = generator
            .for_leader(&nodes)
            .await
            .map_err(|e| WorkloadError::etcd("failed to create etcd client", e))?;

        let members = client
            .members()
            .await
            .map_err(|e| WorkloadError::etcd("failed to list etcd members using etcd client", e))?;

        let leader_id = client.leader_id();
        let Some(current) = member_for_name(&members, outgoing).filter(|m| m.id == leader_id) else {
            debug!(node = %outgoing, "not the etcd leader, nothing to forward");
            return Ok(());
        };

        let next = member_for_name(&members, incoming).ok_or_else(|| WorkloadError::MemberNotFound {
            node: incoming.to_string(),
        })?;

        client
            .move_leader(next.id)
            .await
            .map_err(|e| WorkloadError::etcd("failed to move leader", e))?;

        info!(from = %current.name, to = %next.name, "moved etcd leadership");
        Ok(())
    }

    /// Member names as etcd reports them.
    ///
    /// Nodes are only used to reach etcd; etcd is the source of truth
    /// for membership, even when it disagrees with the inventory.
    pub async fn etcd_members(&self) -> WorkloadResult<Vec<String>> {
        let Some(generator) = &self.etcd else {
            return Ok(Vec::new());
        };

        let nodes = self.control_plane_nodes().await?;
        let mut client = generator
            .for_leader(&nodes)
            .await
            .map_err(|e| WorkloadError::etcd("failed to create etcd client", e))?;

        let members = client
            .members()
            .await
            .map_err(|e| WorkloadError::etcd("failed to list etcd members using etcd client", e))?;

        Ok(members.into_iter().map(|m| m.name).collect())
    }

    async fn control_plane_nodes(&self) -> WorkloadResult<Vec<String>> {
        self.inventory
            .control_plane_nodes()
            .await
            .map_err(WorkloadError::Inventory)
    }
}
