//! etcd client bound to a single member.
//!
//! An [`EtcdClient`] owns one gRPC channel, established through a
//! [`ProxyDialer`], and remembers the leader the member reported when
//! the connection was made. Clients are short-lived: create, use,
//! drop. Dropping the client releases the channel.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, trace};

use crate::dialer::{BoxedStream, ProxyDialer};
use crate::error::{EtcdError, EtcdResult};
use crate::member::{ETCD_PORT, Member};
use crate::proto;
use crate::proto::cluster_client::ClusterClient;
use crate::proto::maintenance_client::MaintenanceClient;

/// Operations the membership logic needs from a connected client.
#[tonic::async_trait]
pub trait EtcdApi: Send {
    /// Logical endpoint this client is connected to.
    fn endpoint(&self) -> &str;

    /// Leader reported by the member at connect time.
    fn leader_id(&self) -> u64;

    /// List members. Goes through raft consensus, so a successful
    /// answer also means the member is healthy.
    async fn members(&mut self) -> EtcdResult<Vec<Member>>;

    async fn remove_member(&mut self, id: u64) -> EtcdResult<()>;

    /// Hand raft leadership to `id`. Must be called on the leader.
    async fn move_leader(&mut self, id: u64) -> EtcdResult<()>;

    /// Release the connection.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// Builds a connected client for a logical endpoint.
#[tonic::async_trait]
pub trait ClientCreator: Send + Sync {
    type Client: EtcdApi;

    async fn create(&self, endpoint: &str) -> EtcdResult<Self::Client>;
}

/// Everything needed to dial one etcd member.
#[derive(Clone)]
pub struct ClientConfiguration {
    pub endpoint: String,
    pub port: u16,
    pub dialer: Arc<dyn ProxyDialer>,
    /// `None` dials plaintext HTTP/2.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Name verified against etcd's serving certificate.
    pub server_name: String,
    pub dial_timeout: Duration,
    pub call_timeout: Duration,
    pub cancel: CancellationToken,
}

/// gRPC client connected to one etcd member.
pub struct EtcdClient {
    endpoint: String,
    leader_id: u64,
    cluster: ClusterClient<Channel>,
    maintenance: MaintenanceClient<Channel>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClient")
            .field("endpoint", &self.endpoint)
            .field("leader_id", &self.leader_id)
            .finish_non_exhaustive()
    }
}

impl EtcdClient {
    /// Dial the member and capture its view of the current leader.
    pub async fn connect(config: ClientConfiguration) -> EtcdResult<Self> {
        let ClientConfiguration {
            endpoint,
            port,
            dialer,
            tls,
            server_name,
            dial_timeout,
            call_timeout,
            cancel,
        } = config;

        let tls = tls.map(TlsConnector::from);
        let dial_endpoint = endpoint.clone();
        let connector = service_fn(move |_: Uri| {
            let dialer = Arc::clone(&dialer);
            let tls = tls.clone();
            let endpoint = dial_endpoint.clone();
            let server_name = server_name.clone();
            async move {
                let stream = dialer.dial(&endpoint, port).await?;
                let stream: BoxedStream = match tls {
                    Some(tls) => {
                        let name = ServerName::try_from(server_name)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                        Box::new(tls.connect(name, stream).await?)
                    }
                    None => stream,
                };
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        });

        let connect_err = |message: String| EtcdError::Connect {
            endpoint: endpoint.clone(),
            message,
        };
        let uri = format!("http://{endpoint}:{port}");
        let channel = bounded(&cancel, dial_timeout, &endpoint, "dial", async {
            Endpoint::from_shared(uri)
                .map_err(|e| connect_err(format!("invalid endpoint: {e}")))?
                .connect_timeout(dial_timeout)
                .timeout(call_timeout)
                .connect_with_connector(connector)
                .await
                .map_err(|e| connect_err(error_chain(&e)))
        })
        .await?;

        let mut client = EtcdClient {
            endpoint,
            leader_id: 0,
            cluster: ClusterClient::new(channel.clone()),
            maintenance: MaintenanceClient::new(channel),
            call_timeout,
            cancel,
        };

        let status = call(
            &client.cancel,
            client.call_timeout,
            &client.endpoint,
            "status",
            client.maintenance.status(proto::StatusRequest {}),
        )
        .await?;
        client.leader_id = status.leader;

        debug!(endpoint = %client.endpoint, leader_id = client.leader_id, "connected to etcd member");
        Ok(client)
    }
}

#[tonic::async_trait]
impl EtcdApi for EtcdClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn leader_id(&self) -> u64 {
        self.leader_id
    }

    async fn members(&mut self) -> EtcdResult<Vec<Member>> {
        let resp = call(
            &self.cancel,
            self.call_timeout,
            &self.endpoint,
            "member list",
            self.cluster
                .member_list(proto::MemberListRequest { linearizable: true }),
        )
        .await?;
        Ok(resp.members.into_iter().map(Member::from).collect())
    }

    async fn remove_member(&mut self, id: u64) -> EtcdResult<()> {
        call(
            &self.cancel,
            self.call_timeout,
            &self.endpoint,
            "member remove",
            self.cluster.member_remove(proto::MemberRemoveRequest { id }),
        )
        .await?;
        Ok(())
    }

    async fn move_leader(&mut self, id: u64) -> EtcdResult<()> {
        call(
            &self.cancel,
            self.call_timeout,
            &self.endpoint,
            "move leader",
            self.maintenance
                .move_leader(proto::MoveLeaderRequest { target_id: id }),
        )
        .await?;
        Ok(())
    }
}

impl Drop for EtcdClient {
    fn drop(&mut self) {
        trace!(endpoint = %self.endpoint, "released etcd client");
    }
}

/// Creates [`EtcdClient`]s through a proxy dialer.
#[derive(Clone)]
pub struct EtcdClientCreator {
    dialer: Arc<dyn ProxyDialer>,
    tls: Option<Arc<rustls::ClientConfig>>,
    server_name: String,
    port: u16,
    dial_timeout: Duration,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl fmt::Debug for EtcdClientCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClientCreator")
            .field("tls", &self.tls.is_some())
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("dial_timeout", &self.dial_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl EtcdClientCreator {
    pub fn new(
        dialer: Arc<dyn ProxyDialer>,
        tls: Option<Arc<rustls::ClientConfig>>,
        dial_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            tls,
            server_name: "localhost".to_string(),
            port: ETCD_PORT,
            dial_timeout,
            call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Abort in-flight dials and calls when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn configuration(&self, endpoint: &str) -> ClientConfiguration {
        ClientConfiguration {
            endpoint: endpoint.to_string(),
            port: self.port,
            dialer: Arc::clone(&self.dialer),
            tls: self.tls.clone(),
            server_name: self.server_name.clone(),
            dial_timeout: self.dial_timeout,
            call_timeout: self.call_timeout,
            cancel: self.cancel.clone(),
        }
    }
}

#[tonic::async_trait]
impl ClientCreator for EtcdClientCreator {
    type Client = EtcdClient;

    async fn create(&self, endpoint: &str) -> EtcdResult<EtcdClient> {
        EtcdClient::connect(self.configuration(endpoint)).await
    }
}

/// Race `fut` against cancellation and a deadline.
pub(crate) async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    endpoint: &str,
    action: &'static str,
    fut: F,
) -> EtcdResult<T>
where
    F: Future<Output = EtcdResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EtcdError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(result) => result,
            Err(_) => Err(EtcdError::Timeout {
                endpoint: endpoint.to_string(),
                action,
                timeout,
            }),
        },
    }
}

async fn call<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    endpoint: &str,
    action: &'static str,
    fut: F,
) -> EtcdResult<T>
where
    F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
{
    bounded(cancel, timeout, endpoint, action, async {
        fut.await
            .map(tonic::Response::into_inner)
            .map_err(|status| EtcdError::rpc(endpoint, action, status))
    })
    .await
}

/// Render an error with its sources, since tonic's transport error
/// hides the interesting part in the chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::StaticDialer;

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let out = bounded(&cancel, Duration::from_secs(1), "etcd-a", "noop", async {
            Ok::<_, EtcdError>(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let cancel = CancellationToken::new();
        let err = bounded(&cancel, Duration::from_millis(50), "etcd-a", "member list", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, EtcdError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, EtcdError::Timeout { action: "member list", .. }));
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bounded(&cancel, Duration::from_secs(60), "etcd-a", "status", async {
            std::future::pending::<EtcdResult<()>>().await
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn connect_to_unknown_endpoint_fails_with_connect_error() {
        let creator = EtcdClientCreator::new(
            Arc::new(StaticDialer::new()),
            None,
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let err = creator.create("etcd-nowhere").await.unwrap_err();
        match err {
            EtcdError::Connect { endpoint, .. } => assert_eq!(endpoint, "etcd-nowhere"),
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[test]
    fn error_chain_includes_sources() {
        let inner = io::Error::other("refused");
        let outer = io::Error::other(inner);
        assert!(error_chain(&outer).contains("refused"));
    }
}
