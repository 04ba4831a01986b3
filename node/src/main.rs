//! Demo binary wiring `kvm-engine::Runtime` to a minimal admin CLI
//! (`SPEC_FULL.md` §6). Runs entirely against `MockHypervisor` — this
//! crate ships no real KVM/Firecracker backend (§1) — so it exists to
//! demonstrate and integration-test the wiring, not to serve traffic.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use kvm_engine::Runtime;
use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};

#[derive(Parser, Debug)]
#[command(name = "kvm-node", about = "Demo admin surface for the tenant compute runtime")]
struct Cli {
    /// Path to a TOML startup config (listen address, tenant manifest path).
    #[arg(long, env = "KVM_NODE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a tenant manifest and start every tenant against the mock hypervisor.
    Tenants {
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Invalidate (retire) tenant programs whose name matches a pattern.
    Invalidate {
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        manifest: PathBuf,
    },
    /// Print the resolved startup config and the address the host proxy
    /// would bind; this binary never runs its own accept loop (§1: the
    /// host HTTP cache/proxy is out of scope).
    Listen {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[derive(Debug, Deserialize, Default)]
struct NodeConfig {
    #[serde(default)]
    listen: Option<SocketAddr>,
    #[serde(default)]
    tenants_manifest: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<NodeConfig> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", p.display()))
        }
        None => Ok(NodeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let _config = load_config(cli.config.as_ref())?;
    let runtime = Runtime::new(Arc::new(MockHypervisor::new()));

    match cli.command {
        Command::Tenants { manifest } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("reading tenant manifest {}", manifest.display()))?;
            runtime.library(&text)?;

            let mut names = Vec::new();
            runtime.registry().foreach(|t| names.push(t.name().to_string()));
            for name in &names {
                runtime.start(name, Arc::new(MockGuestImage::new())).await?;
            }
            println!("{}", runtime.to_string());
        }
        Command::Invalidate { pattern, manifest } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("reading tenant manifest {}", manifest.display()))?;
            runtime.library(&text)?;
            let count = runtime.invalidate_programs(&pattern)?;
            println!("invalidated {count} tenant program(s) matching {pattern:?}");
        }
        Command::Listen { addr } => {
            tracing::info!(%addr, "demo listener is a placeholder; the host reverse proxy owns the real accept loop");
            println!("would listen on {addr} (embedding host owns the real accept loop)");
        }
    }

    Ok(())
}
