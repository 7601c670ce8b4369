//! Client generation over a set of control plane nodes.
//!
//! The orchestrator knows node names, not etcd addresses. The
//! [`ClientGenerator`] turns node names into `etcd-<node>` endpoints
//! and connects either to the first node that answers or to the node
//! hosting the raft leader. Candidates are tried one at a time, in
//! the order given.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::{ClientCreator, EtcdApi, EtcdClientCreator};
use crate::dialer::ProxyDialer;
use crate::error::{Aggregate, EtcdError, EtcdResult};
use crate::member::{ETCD_COMPONENT, node_for_member, static_pod_name};

const NO_NODE_REACHABLE: &str = "could not establish a connection to any etcd node";
const LEADER_UNREACHABLE: &str = "could not establish a connection to the etcd leader";

/// Produces etcd clients connected to members on specific nodes.
#[derive(Debug, Clone)]
pub struct ClientGenerator<C = EtcdClientCreator> {
    creator: C,
}

impl ClientGenerator<EtcdClientCreator> {
    /// Generator dialing through `dialer` with the given TLS config.
    pub fn new(
        dialer: Arc<dyn ProxyDialer>,
        tls: Option<Arc<rustls::ClientConfig>>,
        dial_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            creator: EtcdClientCreator::new(dialer, tls, dial_timeout, call_timeout),
        }
    }
}

/// Why asking one node for the leader did not produce a client.
enum Attempt {
    /// The node could not be used; try the next one.
    Skip(EtcdError),
    /// Retrying other nodes cannot help.
    Fatal(EtcdError),
}

impl<C: ClientCreator> ClientGenerator<C> {
    /// Generator using a custom client constructor.
    pub fn with_creator(creator: C) -> Self {
        Self { creator }
    }

    pub fn creator(&self) -> &C {
        &self.creator
    }

    /// Connect to the first node in `node_names` that answers.
    pub async fn for_first_available_node(&self, node_names: &[String]) -> EtcdResult<C::Client> {
        if node_names.is_empty() {
            return Err(EtcdError::InvalidArgument(
                "for_first_available_node can't be called with an empty list of nodes".to_string(),
            ));
        }

        let mut errs = Vec::new();
        for name in node_names {
            let endpoint = static_pod_name(ETCD_COMPONENT, name);
            match self.creator.create(&endpoint).await {
                Ok(client) => return Ok(client),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(node = %name, %endpoint, error = %e, "etcd node unavailable");
                    errs.push(e);
                }
            }
        }

        Err(EtcdError::Unreachable {
            context: NO_NODE_REACHABLE,
            errors: Aggregate::new(errs),
        })
    }

    /// Connect to the node hosting the current raft leader.
    ///
    /// Unreachable nodes are skipped. A leader whose member name
    /// matches none of `node_names` fails immediately.
    pub async fn for_leader(&self, node_names: &[String]) -> EtcdResult<C::Client> {
        if node_names.is_empty() {
            return Err(EtcdError::InvalidArgument(
                "for_leader can't be called with an empty list of nodes".to_string(),
            ));
        }

        let mut errs = Vec::new();
        for node_name in node_names {
            match self.leader_client(node_name, node_names).await {
                Ok(client) => return Ok(client),
                Err(Attempt::Skip(e)) => errs.push(e),
                Err(Attempt::Fatal(e)) => return Err(e),
            }
        }

        if errs.iter().any(EtcdError::is_inconsistency) {
            return Err(EtcdError::Inconsistent {
                errors: Aggregate::new(errs),
            });
        }
        Err(EtcdError::Unreachable {
            context: LEADER_UNREACHABLE,
            errors: Aggregate::new(errs),
        })
    }

    /// Ask `node_name` who the leader is and connect to the node
    /// hosting it.
    async fn leader_client(&self, node_name: &String, node_names: &[String]) -> Result<C::Client, Attempt> {
        let skip_or_cancel = |e: EtcdError| {
            if e.is_cancelled() { Attempt::Fatal(e) } else { Attempt::Skip(e) }
        };

        let mut lookup = self
            .for_first_available_node(slice::from_ref(node_name))
            .await
            .map_err(skip_or_cancel)?;

        let members = match lookup.members().await {
            Ok(members) => members,
            Err(e) => {
                lookup.close();
                return Err(skip_or_cancel(e));
            }
        };
        let leader_id = lookup.leader_id();
        lookup.close();

        let Some(leader) = members.iter().find(|m| m.id == leader_id) else {
            warn!(node = %node_name, leader_id, "etcd leader is not in the member list");
            return Err(Attempt::Skip(EtcdError::LeaderNotAMember { leader_id }));
        };

        let Some(leader_node) = node_for_member(leader, node_names) else {
            return Err(Attempt::Fatal(EtcdError::LeaderWithoutNode {
                leader_id: leader.id,
                name: leader.name.clone(),
            }));
        };

        debug!(via = %node_name, leader = %leader.name, node = %leader_node, "resolved etcd leader");
        self.for_first_available_node(slice::from_ref(leader_node))
            .await
            .map_err(Attempt::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCluster;
    use crate::member::Member;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn three_node_cluster() -> FakeCluster {
        FakeCluster::new()
            .with_member(Member::new(1, "etcd-cp-1"))
            .with_member(Member::new(2, "etcd-cp-2"))
            .with_member(Member::new(3, "etcd-cp-3"))
            .with_leader(2)
    }

    #[tokio::test]
    async fn first_available_empty_list_is_invalid_argument() {
        let cluster = three_node_cluster();
        let generator = ClientGenerator::with_creator(cluster.creator());
        let err = generator.for_first_available_node(&[]).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(cluster.dial_log().len(), 0);
    }

    #[tokio::test]
    async fn leader_empty_list_is_invalid_argument() {
        let cluster = three_node_cluster();
        let generator = ClientGenerator::with_creator(cluster.creator());
        let err = generator.for_leader(&[]).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(cluster.dial_log().len(), 0);
    }

    #[tokio::test]
    async fn first_available_returns_first_reachable_in_order() {
        let cluster = three_node_cluster();
        cluster.set_unreachable("etcd-cp-1");
        let generator = ClientGenerator::with_creator(cluster.creator());

        let client = generator
            .for_first_available_node(&names(&["cp-1", "cp-2", "cp-3"]))
            .await
            .unwrap();
        assert_eq!(client.endpoint(), "etcd-cp-2");
        // cp-3 is reachable too but must not be dialed.
        assert_eq!(cluster.dial_log(), names(&["etcd-cp-1", "etcd-cp-2"]));
    }

    #[tokio::test]
    async fn first_available_aggregates_all_failures() {
        let cluster = three_node_cluster();
        cluster.set_unreachable("etcd-cp-1");
        cluster.set_unreachable("etcd-cp-2");
        let generator = ClientGenerator::with_creator(cluster.creator());

        let err = generator
            .for_first_available_node(&names(&["cp-1", "cp-2"]))
            .await
            .unwrap_err();
        match err {
            EtcdError::Unreachable { context, errors } => {
                assert_eq!(context, NO_NODE_REACHABLE);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leader_skips_unreachable_and_connects_to_leader_node() {
        let cluster = three_node_cluster();
        cluster.set_unreachable("etcd-cp-1");
        let generator = ClientGenerator::with_creator(cluster.creator());

        let client = generator
            .for_leader(&names(&["cp-1", "cp-3", "cp-2"]))
            .await
            .unwrap();
        assert_eq!(client.endpoint(), "etcd-cp-2");
        assert_eq!(client.leader_id(), 2);
        drop(client);
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn leader_without_matching_node_is_fatal() {
        let cluster = three_node_cluster().with_leader(3);
        let generator = ClientGenerator::with_creator(cluster.creator());

        let err = generator
            .for_leader(&names(&["cp-1", "cp-2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EtcdError::LeaderWithoutNode { leader_id: 3, .. }));
        // Only the first candidate was dialed.
        assert_eq!(cluster.dial_log(), names(&["etcd-cp-1"]));
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn leader_not_a_member_everywhere_is_inconsistency() {
        let cluster = three_node_cluster().with_leader(99);
        let generator = ClientGenerator::with_creator(cluster.creator());

        let err = generator
            .for_leader(&names(&["cp-1", "cp-2", "cp-3"]))
            .await
            .unwrap_err();
        assert!(err.is_inconsistency(), "{err}");
        assert!(matches!(err, EtcdError::Inconsistent { ref errors } if errors.len() == 3));
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn leader_all_unreachable_is_connectivity_aggregate() {
        let cluster = three_node_cluster();
        for ep in ["etcd-cp-1", "etcd-cp-2"] {
            cluster.set_unreachable(ep);
        }
        let generator = ClientGenerator::with_creator(cluster.creator());

        let err = generator
            .for_leader(&names(&["cp-1", "cp-2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EtcdError::Unreachable { context: LEADER_UNREACHABLE, .. }));
    }

    #[tokio::test]
    async fn leader_member_list_failure_is_skipped() {
        let cluster = three_node_cluster();
        cluster.fail_member_list("etcd-cp-1");
        let generator = ClientGenerator::with_creator(cluster.creator());

        let client = generator
            .for_leader(&names(&["cp-1", "cp-2", "cp-3"]))
            .await
            .unwrap();
        assert_eq!(client.endpoint(), "etcd-cp-2");
        drop(client);
        assert_eq!(cluster.open_connections(), 0);
    }
}
