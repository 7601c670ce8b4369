//! In-memory etcd cluster for tests.
//!
//! [`FakeCluster`] holds a member list and a leader, hands out
//! [`FakeClient`]s through [`FakeCreator`], and records every dial and
//! mutating call. Endpoints can be made unreachable and individual
//! calls made to fail. Live clients are counted so tests can assert
//! that every connection was released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::{ClientCreator, EtcdApi};
use crate::error::{EtcdError, EtcdResult};
use crate::member::Member;

#[derive(Debug, Default)]
struct State {
    members: Vec<Member>,
    leader: u64,
    unreachable: HashSet<String>,
    failing_member_list: HashSet<String>,
    failing_remove: HashSet<u64>,
    failing_move: HashSet<u64>,
    dial_log: Vec<String>,
    removed: Vec<u64>,
    moved: Vec<u64>,
}

/// Shared handle to a fake etcd cluster.
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    open: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(self, member: Member) -> Self {
        self.lock().members.push(member);
        self
    }

    pub fn with_leader(self, id: u64) -> Self {
        self.lock().leader = id;
        self
    }

    pub fn creator(&self) -> FakeCreator {
        FakeCreator {
            cluster: self.clone(),
        }
    }

    pub fn set_unreachable(&self, endpoint: &str) {
        self.lock().unreachable.insert(endpoint.to_string());
    }

    pub fn set_reachable(&self, endpoint: &str) {
        self.lock().unreachable.remove(endpoint);
    }

    pub fn fail_member_list(&self, endpoint: &str) {
        self.lock().failing_member_list.insert(endpoint.to_string());
    }

    pub fn fail_remove(&self, id: u64) {
        self.lock().failing_remove.insert(id);
    }

    pub fn fail_move_leader(&self, id: u64) {
        self.lock().failing_move.insert(id);
    }

    pub fn members(&self) -> Vec<Member> {
        self.lock().members.clone()
    }

    pub fn leader(&self) -> u64 {
        self.lock().leader
    }

    /// Endpoints dialed so far, in order.
    pub fn dial_log(&self) -> Vec<String> {
        self.lock().dial_log.clone()
    }

    /// Member IDs passed to successful remove calls.
    pub fn removed(&self) -> Vec<u64> {
        self.lock().removed.clone()
    }

    /// Member IDs passed to successful move-leader calls.
    pub fn moved(&self) -> Vec<u64> {
        self.lock().moved.clone()
    }

    /// Clients created and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster lock")
    }
}

/// [`ClientCreator`] backed by a [`FakeCluster`].
#[derive(Debug, Clone)]
pub struct FakeCreator {
    cluster: FakeCluster,
}

#[tonic::async_trait]
impl ClientCreator for FakeCreator {
    type Client = FakeClient;

    async fn create(&self, endpoint: &str) -> EtcdResult<FakeClient> {
        let leader_id = {
            let mut state = self.cluster.lock();
            state.dial_log.push(endpoint.to_string());
            if state.unreachable.contains(endpoint) {
                return Err(EtcdError::Connect {
                    endpoint: endpoint.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            state.leader
        };

        self.cluster.open.fetch_add(1, Ordering::SeqCst);
        Ok(FakeClient {
            endpoint: endpoint.to_string(),
            leader_id,
            cluster: self.cluster.clone(),
        })
    }
}

/// Client handed out by [`FakeCreator`].
#[derive(Debug)]
pub struct FakeClient {
    endpoint: String,
    leader_id: u64,
    cluster: FakeCluster,
}

#[tonic::async_trait]
impl EtcdApi for FakeClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn leader_id(&self) -> u64 {
        self.leader_id
    }

    async fn members(&mut self) -> EtcdResult<Vec<Member>> {
        let state = self.cluster.lock();
        if state.failing_member_list.contains(&self.endpoint) {
            return Err(EtcdError::Rpc {
                endpoint: self.endpoint.clone(),
                action: "member list",
                message: "etcdserver: request timed out".to_string(),
            });
        }
        Ok(state.members.clone())
    }

    async fn remove_member(&mut self, id: u64) -> EtcdResult<()> {
        let mut state = self.cluster.lock();
        if state.failing_remove.contains(&id) {
            return Err(EtcdError::Rpc {
                endpoint: self.endpoint.clone(),
                action: "member remove",
                message: "etcdserver: unhealthy cluster".to_string(),
            });
        }
        if !state.members.iter().any(|m| m.id == id) {
            return Err(EtcdError::Rpc {
                endpoint: self.endpoint.clone(),
                action: "member remove",
                message: "etcdserver: member not found".to_string(),
            });
        }
        state.members.retain(|m| m.id != id);
        state.removed.push(id);
        Ok(())
    }

    async fn move_leader(&mut self, id: u64) -> EtcdResult<()> {
        let mut state = self.cluster.lock();
        if state.failing_move.contains(&id) {
            return Err(EtcdError::Rpc {
                endpoint: self.endpoint.clone(),
                action: "move leader",
                message: "etcdserver: leadership transfer timed out".to_string(),
            });
        }
        state.leader = id;
        state.moved.push(id);
        Ok(())
    }
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        self.cluster.open.fetch_sub(1, Ordering::SeqCst);
    }
}
