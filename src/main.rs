use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use flowmesh::{
    config::Config,
    domain::{ServiceKey, TlsMode},
    observability::{init_tracing, log_config_info},
    registry::InMemoryRegistry,
    xds::{ResourceKind, XdsClient, XdsGenerator},
    APP_NAME, VERSION,
};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Sidecar,
    Gateway,
}

/// Generate the xDS snapshot one proxy would receive.
#[derive(Parser, Debug)]
#[command(name = "flowmesh", version, about)]
struct Args {
    /// Registry seed file (YAML)
    #[arg(long, short = 'r')]
    registry: PathBuf,

    /// Proxy role
    #[arg(long, value_enum, default_value_t = Role::Sidecar)]
    role: Role,

    /// Namespace the proxy runs in
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Service the sidecar is attached to
    #[arg(long)]
    service: Option<String>,

    /// Node id; generated as `<namespace>/<uuid>~127.0.0.1` when omitted
    #[arg(long)]
    node_id: Option<String>,

    /// TLS mode requested by the proxy (none, permissive, strict)
    #[arg(long)]
    tls_mode: Option<TlsMode>,

    /// Print resource names as JSON instead of logging them
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config.observability)?;

    info!(app_name = APP_NAME, version = VERSION, "Starting flowmesh snapshot generation");
    log_config_info(&config);

    let registry = InMemoryRegistry::from_yaml_file(&args.registry)
        .with_context(|| format!("loading registry seed {}", args.registry.display()))?;
    let registry = Arc::new(registry);

    let node_id = args
        .node_id
        .clone()
        .unwrap_or_else(|| format!("{}/{}~127.0.0.1", args.namespace, uuid::Uuid::new_v4()));

    let mut client = match (args.role, &args.service) {
        (Role::Gateway, _) => XdsClient::gateway(&node_id, &args.namespace),
        (Role::Sidecar, Some(service)) => {
            XdsClient::sidecar(&node_id, ServiceKey::new(&args.namespace, service))
        }
        (Role::Sidecar, None) => bail!("--service is required for sidecar proxies"),
    };
    if let Some(mode) = args.tls_mode {
        client = client.with_requested_tls_mode(mode);
    }

    let generator = XdsGenerator::new(config.xds.clone(), registry);
    generator.register(client);
    generator.push(&node_id).await.with_context(|| format!("generating snapshot for {}", node_id))?;

    let snapshot =
        generator.cache().snapshot(&node_id).context("no snapshot was published")?;
    let report: BTreeMap<String, Vec<&str>> = ResourceKind::ALL
        .into_iter()
        .map(|kind| (kind.to_string(), snapshot.names(kind)))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (kind, names) in &report {
            info!(%kind, count = names.len(), resources = ?names, "Generated resources");
        }
    }

    info!(node_id = %node_id, version = generator.cache().version(&node_id), "Snapshot ready");
    Ok(())
}
