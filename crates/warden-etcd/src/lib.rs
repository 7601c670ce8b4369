//! warden-etcd — reaching etcd on control plane nodes from outside the
//! cluster.
//!
//! Provides a gRPC client for etcd's membership and maintenance APIs,
//! transport through a proxy dialer, TLS material handling, and a
//! client generator that picks a member to talk to.
//!
//! # Architecture
//!
//! ```text
//! ClientGenerator
//!   ├── for_first_available_node(nodes) → first member that answers
//!   └── for_leader(nodes) → member on the node hosting the raft leader
//!         │
//!         ▼
//! ClientCreator (EtcdClientCreator, or a fake in tests)
//!   └── EtcdClient
//!       ├── Status() at connect → leader_id
//!       ├── MemberList / MemberRemove
//!       └── MoveLeader
//!         │
//!         ▼
//! ProxyDialer (cluster DNS, HTTP CONNECT, static table)
//!   └── optional rustls handshake, then HTTP/2
//! ```

pub mod client;
pub mod credentials;
pub mod dialer;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod generator;
pub mod member;
pub mod tls;

/// Generated protobuf types and gRPC stubs for etcd's v3 API subset.
pub mod proto {
    tonic::include_proto!("etcdserverpb");
}

pub use client::{ClientConfiguration, ClientCreator, EtcdApi, EtcdClient, EtcdClientCreator};
pub use credentials::{EtcdCredentials, Provisioned};
pub use dialer::{ConnectProxyDialer, DnsDialer, ProxyDialer, StaticDialer};
pub use error::{Aggregate, EtcdError, EtcdResult};
pub use generator::ClientGenerator;
pub use member::{ETCD_COMPONENT, ETCD_PORT, Member, member_for_name};
pub use tls::TlsMaterial;
