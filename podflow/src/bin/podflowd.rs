//! podflowd - runs flows defined in JSON files until interrupted.
//!
//! Each file holds a create request (`{"params": {"pods": [...]}, ...}`).
//! Replicas run as in-process tasks; on ctrl-c every flow is torn down.

use anyhow::{Context, Result};
use clap::Parser;
use podflow::config::ControlPlaneConfig;
use podflow::control::{ControlSurface, CreateFlowRequest};
use podflow::observability::{init_tracing, LogFormat};
use podflow::reduce::RequestRouter;
use podflow::registry::FlowRegistry;
use podflow::runtime::InProcessSupervisor;
use podflow::testing::{echo_executor, input_docs};
use podflow::topology::TopologyBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "podflowd")]
#[command(about = "Run pod pipelines under the podflow control plane", long_about = None)]
struct Args {
    /// Flow definition files (JSON create requests)
    #[arg(required = true)]
    flows: Vec<PathBuf>,

    /// Control-plane configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Route this many documents through each flow's topology before creating it
    #[arg(long, default_value = "0")]
    smoke_docs: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let config = load_config(args.config.as_deref())?;
    let registry = FlowRegistry::new(Arc::new(InProcessSupervisor::new()), config);
    let surface = ControlSurface::new(registry.clone());

    let outcome = serve(&args, &surface).await;
    if let Err(ref e) = outcome {
        warn!(error = %e, "Stopping after error");
    }

    let deleted = registry.shutdown().await.context("tearing down flows")?;
    info!(deleted, "All flows terminated");
    outcome
}

async fn serve(args: &Args, surface: &ControlSurface) -> Result<()> {
    for path in &args.flows {
        let request = load_request(path)?;
        if args.smoke_docs > 0 {
            smoke_check(&request, args.smoke_docs)
                .with_context(|| format!("smoke check of {}", path.display()))?;
        }
        let created = surface
            .create(request)
            .await
            .with_context(|| format!("creating flow from {}", path.display()))?;
        info!(flow_id = %created.id, path = %path.display(), "Flow created");
    }

    info!(flows = surface.list().size, "Serving; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ControlPlaneConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ControlPlaneConfig::from_json_str(&raw)?
        }
        None => ControlPlaneConfig::new(),
    };
    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_request(path: &Path) -> Result<CreateFlowRequest> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn smoke_check(request: &CreateFlowRequest, docs: usize) -> Result<()> {
    let topology = TopologyBuilder::from_declarations(request.params.pods.clone()).build()?;
    let outcome = RequestRouter::new(&topology).route(input_docs(docs), echo_executor)?;
    info!(
        pods = outcome.outputs.len(),
        documents = outcome.response.len(),
        "Smoke request routed"
    );
    Ok(())
}
