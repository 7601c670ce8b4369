//! etcd members and their correspondence with node names.
//!
//! etcd member names embed the name of the node hosting them
//! (`etcd-<node>`), so matching is done by substring containment.
//! This is ambiguous when one node name is a substring of another
//! (`cp-1` vs `cp-10`); the first match in list order wins.

use crate::proto;

/// Component tag of the etcd static pod.
pub const ETCD_COMPONENT: &str = "etcd";

/// Default etcd client port.
pub const ETCD_PORT: u16 = 2379;

/// A member of the etcd raft group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    /// Empty until the member's process has started and joined.
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

impl Member {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            peer_urls: Vec::new(),
            client_urls: Vec::new(),
            is_learner: false,
        }
    }

    /// Whether the member has started and registered a name.
    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }

    /// Whether this member is hosted on the given node.
    pub fn is_on_node(&self, node_name: &str) -> bool {
        self.name.contains(node_name)
    }
}

impl From<proto::Member> for Member {
    fn from(m: proto::Member) -> Self {
        Self {
            id: m.id,
            name: m.name,
            peer_urls: m.peer_ur_ls,
            client_urls: m.client_ur_ls,
            is_learner: m.is_learner,
        }
    }
}

/// Find the member hosted on `node_name`.
pub fn member_for_name<'a>(members: &'a [Member], node_name: &str) -> Option<&'a Member> {
    members.iter().find(|m| m.is_on_node(node_name))
}

/// Find the node, among `node_names`, that hosts `member`.
pub fn node_for_member<'a>(member: &Member, node_names: &'a [String]) -> Option<&'a String> {
    node_names.iter().find(|n| member.is_on_node(n))
}

/// Logical endpoint of a component's static pod on a node.
pub fn static_pod_name(component: &str, node_name: &str) -> String {
    format!("{component}-{node_name}")
}
