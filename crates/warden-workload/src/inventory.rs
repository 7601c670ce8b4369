//! The orchestrator's view of control plane nodes and machines.

use std::sync::{Arc, RwLock};

/// Source of the live control plane node names for a cluster.
///
/// Whatever this returns is treated as ground truth for which nodes
/// should exist.
#[tonic::async_trait]
pub trait NodeInventory: Send + Sync {
    async fn control_plane_nodes(&self) -> anyhow::Result<Vec<String>>;
}

#[tonic::async_trait]
impl<T: NodeInventory + ?Sized> NodeInventory for Arc<T> {
    async fn control_plane_nodes(&self) -> anyhow::Result<Vec<String>> {
        (**self).control_plane_nodes().await
    }
}

/// An in-memory inventory that can be updated while shared.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    nodes: Arc<RwLock<Vec<String>>>,
}

impl StaticInventory {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: Arc::new(RwLock::new(nodes.into_iter().map(Into::into).collect())),
        }
    }

    /// Replace the node list.
    pub fn set<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.nodes.write().expect("inventory lock");
        *guard = nodes.into_iter().map(Into::into).collect();
    }

    /// Drop a node, as if it had been deleted.
    pub fn remove(&self, node: &str) {
        let mut guard = self.nodes.write().expect("inventory lock");
        guard.retain(|n| n != node);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.nodes.read().expect("inventory lock").clone()
    }
}

#[tonic::async_trait]
impl NodeInventory for StaticInventory {
    async fn control_plane_nodes(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

/// An orchestrator machine and, once provisioned, the node it became.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub node_ref: Option<String>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_ref: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node_ref = Some(node.into());
        self
    }

    /// Name of the node backing this machine, if any.
    pub fn node_name(&self) -> Option<&str> {
        self.node_ref.as_deref()
    }
}

/// Node name for an optional machine reference.
pub(crate) fn node_of(machine: Option<&Machine>) -> Option<&str> {
    machine.and_then(Machine::node_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_inventory_reflects_updates() {
        let inventory = StaticInventory::new(["cp-1", "cp-2"]);
        assert_eq!(inventory.control_plane_nodes().await.unwrap(), vec!["cp-1", "cp-2"]);

        inventory.remove("cp-1");
        assert_eq!(inventory.control_plane_nodes().await.unwrap(), vec!["cp-2"]);

        inventory.set(["cp-3"]);
        assert_eq!(inventory.snapshot(), vec!["cp-3"]);
    }

    #[tokio::test]
    async fn shared_inventory_sees_same_nodes() {
        let inventory = Arc::new(StaticInventory::new(["cp-1"]));
        let clone = Arc::clone(&inventory);
        inventory.set(["cp-2"]);
        assert_eq!(clone.control_plane_nodes().await.unwrap(), vec!["cp-2"]);
    }

    #[test]
    fn machine_without_node_has_no_name() {
        let machine = Machine::new("m-1");
        assert!(machine.node_name().is_none());
        assert!(node_of(Some(&machine)).is_none());
        assert!(node_of(None).is_none());

        let machine = machine.with_node("cp-1");
        assert_eq!(node_of(Some(&machine)), Some("cp-1"));
    }
}
