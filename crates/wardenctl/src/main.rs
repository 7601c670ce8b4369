//! wardenctl — etcd membership operations for a workload cluster.
//!
//! # Usage
//!
//! ```text
//! wardenctl --config warden.toml members
//! wardenctl --config warden.toml reconcile
//! wardenctl --config warden.toml remove-member cp-3
//! wardenctl --config warden.toml forward-leadership cp-2 cp-3
//! wardenctl --config warden.toml generate-credentials
//! ```
//!
//! Ctrl-C cancels the operation in flight.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_workload::{Machine, WardenConfig};

#[derive(Parser)]
#[command(name = "wardenctl", about = "Warden etcd membership control")]
struct Cli {
    /// Path to warden.toml.
    #[arg(long, short, default_value = "warden.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List etcd members as etcd reports them.
    Members,

    /// Remove etcd members that have no control plane node.
    Reconcile {
        /// Live node names. Defaults to the configured control plane nodes.
        nodes: Vec<String>,
    },

    /// Remove the etcd member hosted on a node.
    RemoveMember {
        node: String,
    },

    /// Move etcd leadership off a node, if it holds it.
    ForwardLeadership {
        /// Node that may currently host the leader.
        outgoing: String,
        /// Node to hand leadership to.
        candidate: String,
    },

    /// Create managed client credentials if none exist yet.
    GenerateCredentials,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = WardenConfig::from_file(&cli.config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Members => members(&config, cancel, cli.json).await,
        Command::Reconcile { nodes } => reconcile(&config, cancel, nodes, cli.json).await,
        Command::RemoveMember { node } => {
            let workload = config.workload(cancel)?;
            workload.remove_member_for_node(&node).await?;
            println!("etcd member for {node} removed");
            Ok(())
        }
        Command::ForwardLeadership {
            outgoing,
            candidate,
        } => {
            let workload = config.workload(cancel)?;
            let outgoing = Machine::new(outgoing.clone()).with_node(outgoing);
            let candidate = Machine::new(candidate.clone()).with_node(candidate);
            workload
                .forward_etcd_leadership(Some(&outgoing), Some(&candidate))
                .await?;
            Ok(())
        }
        Command::GenerateCredentials => generate_credentials(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wardenctl=debug,warden=debug".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn members(config: &WardenConfig, cancel: CancellationToken, json: bool) -> anyhow::Result<()> {
    let workload = config.workload(cancel)?;
    if !workload.has_etcd_access() {
        warn!("no [etcd] section configured; etcd is not reachable");
    }

    let names = workload.etcd_members().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for name in &names {
            println!("{name}");
        }
    }
    Ok(())
}

async fn reconcile(
    config: &WardenConfig,
    cancel: CancellationToken,
    nodes: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let workload = config.workload(cancel)?;
    let nodes = if nodes.is_empty() {
        config.cluster.control_plane_nodes.clone()
    } else {
        nodes
    };

    let (removed, err) = workload.reconcile_etcd_members(&nodes).await.into_parts();
    if json {
        println!(
            "{}",
            serde_json::json!({
                "removed": removed,
                "error": err.as_ref().map(ToString::to_string),
            })
        );
    } else {
        for name in &removed {
            println!("{name}");
        }
    }

    match err {
        Some(err) => Err(err).context("reconciliation finished with errors"),
        None => Ok(()),
    }
}

fn generate_credentials(config: &WardenConfig) -> anyhow::Result<()> {
    let Some(credentials) = config.credentials() else {
        bail!("no [etcd.credentials] configured");
    };

    let provisioned = credentials.generate_if_missing()?;
    if provisioned.is_generated() {
        credentials.persist(provisioned.material())?;
        info!("generated etcd client credentials");
        println!("generated");
    } else {
        println!("credentials already present");
    }
    Ok(())
}
