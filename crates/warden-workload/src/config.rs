//! warden.toml configuration parser.
//!
//! ```toml
//! [cluster]
//! control_plane_nodes = ["cp-1", "cp-2", "cp-3"]
//! minimum_remaining_nodes = 1
//!
//! [etcd]
//! dial_timeout = "10s"
//! call_timeout = "15s"
//!
//! [etcd.credentials]
//! mode = "managed"
//! dir = "/var/lib/warden/etcd"
//!
//! [proxy]
//! kind = "dns"
//! domain = "kube-system.svc.cluster.local"
//! ```
//!
//! Without an `[etcd]` table the workload has no etcd access and every
//! etcd operation is a no-op.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use warden_etcd::{
    ClientGenerator, ConnectProxyDialer, DnsDialer, ETCD_PORT, EtcdClientCreator, EtcdCredentials,
    ProxyDialer, StaticDialer,
};

use crate::inventory::StaticInventory;
use crate::quorum::{DEFAULT_MINIMUM_REMAINING_NODES, QuorumGuard};
use crate::workload::Workload;

pub const DEFAULT_DIAL_TIMEOUT: &str = "10s";
pub const DEFAULT_CALL_TIMEOUT: &str = "15s";
pub const DEFAULT_SERVER_NAME: &str = "localhost";
pub const DEFAULT_DNS_DOMAIN: &str = "kube-system.svc.cluster.local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    pub cluster: ClusterConfig,
    pub etcd: Option<EtcdConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub control_plane_nodes: Vec<String>,
    #[serde(default = "default_minimum_remaining_nodes")]
    pub minimum_remaining_nodes: usize,
}

fn default_minimum_remaining_nodes() -> usize {
    DEFAULT_MINIMUM_REMAINING_NODES
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub port: Option<u16>,
    pub dial_timeout: Option<String>,
    pub call_timeout: Option<String>,
    pub server_name: Option<String>,
    /// Absent means plaintext.
    pub credentials: Option<CredentialsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CredentialsConfig {
    Managed {
        dir: PathBuf,
    },
    External {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProxyConfig {
    Dns {
        domain: String,
    },
    Connect {
        address: String,
    },
    Static {
        endpoints: HashMap<String, SocketAddr>,
    },
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig::Dns {
            domain: DEFAULT_DNS_DOMAIN.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn dialer(&self) -> Arc<dyn ProxyDialer> {
        match self {
            ProxyConfig::Dns { domain } => Arc::new(DnsDialer::new(domain.clone())),
            ProxyConfig::Connect { address } => Arc::new(ConnectProxyDialer::new(address.clone())),
            ProxyConfig::Static { endpoints } => Arc::new(
                endpoints
                    .iter()
                    .map(|(endpoint, addr)| (endpoint.clone(), *addr))
                    .collect::<StaticDialer>(),
            ),
        }
    }
}

impl CredentialsConfig {
    pub fn credentials(&self) -> EtcdCredentials {
        match self {
            CredentialsConfig::Managed { dir } => EtcdCredentials::managed(dir),
            CredentialsConfig::External {
                ca_file,
                cert_file,
                key_file,
            } => EtcdCredentials::external(ca_file, cert_file, key_file),
        }
    }
}

impl EtcdConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(ETCD_PORT)
    }

    pub fn dial_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("dial_timeout", self.dial_timeout.as_deref(), DEFAULT_DIAL_TIMEOUT)
    }

    pub fn call_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("call_timeout", self.call_timeout.as_deref(), DEFAULT_CALL_TIMEOUT)
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(DEFAULT_SERVER_NAME)
    }

    /// Build a generator dialing through `dialer`.
    ///
    /// Managed credentials must already exist; they are only minted by
    /// an explicit provisioning step.
    pub fn client_generator(
        &self,
        dialer: Arc<dyn ProxyDialer>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ClientGenerator> {
        let tls = match &self.credentials {
            None => None,
            Some(source) => {
                let material = source
                    .credentials()
                    .lookup()?
                    .context("etcd credentials not found; generate them first")?;
                Some(material.client_config()?)
            }
        };

        let creator = EtcdClientCreator::new(dialer, tls, self.dial_timeout()?, self.call_timeout()?)
            .with_port(self.port())
            .with_server_name(self.server_name())
            .with_cancellation(cancel);
        Ok(ClientGenerator::with_creator(creator))
    }
}

impl WardenConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: WardenConfig = toml::from_str(content)?;
        if config.cluster.minimum_remaining_nodes == 0 {
            bail!("cluster.minimum_remaining_nodes must be at least 1");
        }
        if let Some(etcd) = &config.etcd {
            etcd.dial_timeout()?;
            etcd.call_timeout()?;
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn quorum_guard(&self) -> QuorumGuard {
        QuorumGuard::new(self.cluster.minimum_remaining_nodes)
    }

    pub fn inventory(&self) -> StaticInventory {
        StaticInventory::new(self.cluster.control_plane_nodes.iter().cloned())
    }

    pub fn credentials(&self) -> Option<EtcdCredentials> {
        self.etcd
            .as_ref()
            .and_then(|e| e.credentials.as_ref())
            .map(CredentialsConfig::credentials)
    }

    /// Assemble a workload over the static inventory.
    pub fn workload(&self, cancel: CancellationToken) -> anyhow::Result<Workload<StaticInventory>> {
        let generator = match &self.etcd {
            Some(etcd) => Some(etcd.client_generator(self.proxy.dialer(), cancel)?),
            None => None,
        };
        Ok(Workload::new(self.inventory(), generator).with_quorum_guard(self.quorum_guard()))
    }
}

fn duration_field(field: &str, value: Option<&str>, default: &str) -> anyhow::Result<Duration> {
    let raw = value.unwrap_or(default);
    match parse_duration(raw) {
        Some(d) if !d.is_zero() => Ok(d),
        Some(_) => bail!("{field} must be greater than zero"),
        None => bail!("invalid {field} {raw:?}: expected e.g. \"500ms\", \"5s\", \"2m\""),
    }
}

/// Parse "500ms", "5s", "2m", or plain seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = ["cp-1", "cp-2"]
"#,
        )
        .unwrap();
        assert_eq!(config.cluster.control_plane_nodes, vec!["cp-1", "cp-2"]);
        assert_eq!(config.cluster.minimum_remaining_nodes, 1);
        assert!(config.etcd.is_none());
        assert_eq!(config.proxy, ProxyConfig::default());
        assert!(config.credentials().is_none());
    }

    #[test]
    fn parse_full() {
        let config = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = ["cp-1"]
minimum_remaining_nodes = 2

[etcd]
port = 12379
dial_timeout = "500ms"
call_timeout = "2m"
server_name = "etcd.local"

[etcd.credentials]
mode = "external"
ca_file = "/pki/ca.crt"
cert_file = "/pki/client.crt"
key_file = "/pki/client.key"

[proxy]
kind = "static"
endpoints = { "etcd-cp-1" = "127.0.0.1:2379" }
"#,
        )
        .unwrap();

        assert_eq!(config.quorum_guard().minimum(), 2);
        let etcd = config.etcd.as_ref().unwrap();
        assert_eq!(etcd.port(), 12379);
        assert_eq!(etcd.dial_timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(etcd.call_timeout().unwrap(), Duration::from_secs(120));
        assert_eq!(etcd.server_name(), "etcd.local");
        assert!(config.credentials().unwrap().is_external());
        assert!(matches!(config.proxy, ProxyConfig::Static { ref endpoints } if endpoints.len() == 1));
    }

    #[test]
    fn etcd_defaults() {
        let etcd = EtcdConfig::default();
        assert_eq!(etcd.port(), ETCD_PORT);
        assert_eq!(etcd.dial_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(etcd.call_timeout().unwrap(), Duration::from_secs(15));
        assert_eq!(etcd.server_name(), "localhost");
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let err = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = []

[etcd]
dial_timeout = "soon"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dial_timeout"));

        let etcd = EtcdConfig {
            call_timeout: Some("0s".to_string()),
            ..Default::default()
        };
        assert!(etcd.call_timeout().is_err());
    }

    #[test]
    fn unknown_proxy_kind_is_rejected() {
        let result = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = []

[proxy]
kind = "carrier-pigeon"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }

    #[test]
    fn parse_duration_overflow_is_none() {
        assert_eq!(parse_duration("999999999999999999m"), None);
        assert_eq!(parse_duration("18446744073709551615m"), None);
    }

    #[test]
    fn overflowing_timeout_is_rejected() {
        let err = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = []

[etcd]
dial_timeout = "999999999999999999m"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dial_timeout"));
    }

    #[test]
    fn zero_minimum_remaining_nodes_is_rejected() {
        let err = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = ["cp-1"]
minimum_remaining_nodes = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("minimum_remaining_nodes"));
    }

    #[test]
    fn workload_without_etcd_has_no_access() {
        let config = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = ["cp-1"]
"#,
        )
        .unwrap();
        let workload = config.workload(CancellationToken::new()).unwrap();
        assert!(!workload.has_etcd_access());
    }

    #[test]
    fn missing_managed_credentials_fail_generator() {
        let dir = tempfile::tempdir().unwrap();
        let etcd = EtcdConfig {
            credentials: Some(CredentialsConfig::Managed {
                dir: dir.path().join("etcd"),
            }),
            ..Default::default()
        };
        let err = etcd
            .client_generator(ProxyConfig::default().dialer(), CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn generated_credentials_enable_generator() {
        let dir = tempfile::tempdir().unwrap();
        let source = CredentialsConfig::Managed {
            dir: dir.path().to_path_buf(),
        };
        let provisioned = source.credentials().generate_if_missing().unwrap();
        source.credentials().persist(provisioned.material()).unwrap();

        let etcd = EtcdConfig {
            credentials: Some(source),
            ..Default::default()
        };
        assert!(
            etcd.client_generator(ProxyConfig::default().dialer(), CancellationToken::new())
                .is_ok()
        );
    }

    #[test]
    fn toml_round_trip_keeps_tags() {
        let config = WardenConfig::parse(
            r#"
[cluster]
control_plane_nodes = ["cp-1"]

[proxy]
kind = "connect"
address = "127.0.0.1:8001"
"#,
        )
        .unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("kind = \"connect\""));
    }
}
