//! Multishare Reconciler
//!
//! Runs the reconciliation loop against the Kubernetes API server and the
//! Filestore REST API, or against in-memory collaborators in standalone mode.

use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multishare_reconciler::adapters::filestore::DEFAULT_ENDPOINT;
use multishare_reconciler::adapters::{
    FilestoreConfig, FilestoreInventory, KubeRecordStore, KubeStorageClassCatalog,
    MemoryCatalog, MemoryInventory, MemoryRecordStore, ReflectorCache,
};
use multishare_reconciler::config::{
    DEFAULT_INTERVAL_SECS, DEFAULT_MAX_INSTANCE_BYTES, DEFAULT_MAX_SHARES_PER_INSTANCE,
    DEFAULT_MIN_INSTANCE_BYTES,
};
use multishare_reconciler::domain::naming::DEFAULT_INSTANCE_PREFIX;
use multishare_reconciler::{
    server, Collaborators, Error, InstanceInfo, MultishareReconciler, ReconcilerConfig,
    ReconcilerMetrics, Result, ShareInfo,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multishare Reconciler - packs file shares onto shared Filestore instances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; replaces the reconciler flags below
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Cloud project hosting the instances
    #[arg(long, env = "PROJECT", default_value = "")]
    project: String,

    /// Name of this cluster
    #[arg(long, env = "CLUSTER_NAME", default_value = "")]
    cluster_name: String,

    /// Location (zone or region) of this cluster
    #[arg(long, env = "CLUSTER_LOCATION", default_value = "")]
    cluster_location: String,

    /// The cluster is regional
    #[arg(long, env = "REGIONAL")]
    regional: bool,

    /// Seconds between passes
    #[arg(long, env = "RECONCILE_INTERVAL", default_value_t = DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,

    /// Maximum shares placed on one instance
    #[arg(long, env = "MAX_SHARES_PER_INSTANCE", default_value_t = DEFAULT_MAX_SHARES_PER_INSTANCE)]
    max_shares_per_instance: usize,

    /// Minimum instance capacity in bytes
    #[arg(long, env = "MIN_INSTANCE_BYTES", default_value_t = DEFAULT_MIN_INSTANCE_BYTES)]
    min_instance_bytes: u64,

    /// Maximum instance capacity in bytes
    #[arg(long, env = "MAX_INSTANCE_BYTES", default_value_t = DEFAULT_MAX_INSTANCE_BYTES)]
    max_instance_bytes: u64,

    /// Name prefix for new instances
    #[arg(long, env = "INSTANCE_PREFIX", default_value = DEFAULT_INSTANCE_PREFIX)]
    instance_prefix: String,

    /// Label selector (k=v,...) restricting reconciled records
    #[arg(long, env = "RECORD_SELECTOR", default_value = "")]
    record_selector: String,

    /// Status server bind address
    #[arg(long, env = "STATUS_ADDR", default_value = "0.0.0.0:8080")]
    status_addr: String,

    /// Filestore API endpoint
    #[arg(long, env = "FILESTORE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    filestore_endpoint: String,

    /// Static bearer token for the Filestore API
    #[arg(long, env = "FILESTORE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against in-memory collaborators (no Kubernetes, no cloud)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Print the custom resource definitions as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn reconciler_config(&self) -> Result<ReconcilerConfig> {
        if let Some(path) = &self.config {
            return ReconcilerConfig::from_yaml_file(path);
        }
        let config = ReconcilerConfig {
            project: self.project.clone(),
            cluster_name: self.cluster_name.clone(),
            cluster_location: self.cluster_location.clone(),
            regional: self.regional,
            interval_secs: self.interval_secs,
            max_shares_per_instance: self.max_shares_per_instance,
            min_instance_bytes: self.min_instance_bytes,
            max_instance_bytes: self.max_instance_bytes,
            instance_prefix: self.instance_prefix.clone(),
            record_selector: self.record_selector.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", serde_yaml::to_string(&ShareInfo::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&InstanceInfo::crd())?);
        return Ok(());
    }

    init_logging(&args);

    let config = args.reconciler_config()?;
    let status_addr: SocketAddr = args
        .status_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid status address: {}", e)))?;

    info!("Starting Multishare Reconciler");
    info!("  Version: {}", multishare_reconciler::VERSION);
    info!("  Project: {}", config.project);
    info!("  Cluster: {} ({})", config.cluster_name, config.cluster_location);
    info!("  Regional: {}", config.regional);
    info!("  Status server: {}", status_addr);
    info!("  Standalone mode: {}", args.standalone);

    let shutdown = CancellationToken::new();
    let ports = if args.standalone {
        standalone_collaborators()
    } else {
        cluster_collaborators(&args, &config, shutdown.clone()).await?
    };

    let metrics = Arc::new(ReconcilerMetrics::new()?);
    let reconciler = Arc::new(MultishareReconciler::new(config, ports, metrics));

    let server_handle = tokio::spawn(server::serve(
        status_addr,
        reconciler.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = reconciler.run(shutdown.clone()).await;
    shutdown.cancel();

    match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
        Ok(Ok(Err(e))) => error!("Status server error: {}", e),
        Ok(Err(e)) => error!("Status server task failed: {}", e),
        Err(_) => warn!("Status server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    result?;
    info!("Reconciler shutdown complete");
    Ok(())
}

// =============================================================================
// Collaborators
// =============================================================================

async fn cluster_collaborators(
    args: &Args,
    config: &ReconcilerConfig,
    shutdown: CancellationToken,
) -> Result<Collaborators> {
    let client = kube::Client::try_default().await?;
    let selector = config.selector()?;

    let inventory = FilestoreInventory::new(FilestoreConfig {
        endpoint: args.filestore_endpoint.clone(),
        access_token: args.access_token.clone(),
        ..Default::default()
    })?;

    Ok(Collaborators {
        share_store: Arc::new(KubeRecordStore::<ShareInfo>::new(client.clone())),
        instance_store: Arc::new(KubeRecordStore::<InstanceInfo>::new(client.clone())),
        share_cache: Arc::new(ReflectorCache::<ShareInfo>::spawn(
            client.clone(),
            &selector,
            shutdown.clone(),
        )),
        instance_cache: Arc::new(ReflectorCache::<InstanceInfo>::spawn(
            client.clone(),
            &selector,
            shutdown,
        )),
        classes: Arc::new(KubeStorageClassCatalog::new(client)),
        inventory: Arc::new(inventory),
    })
}

fn standalone_collaborators() -> Collaborators {
    let shares = Arc::new(MemoryRecordStore::<ShareInfo>::new());
    let instances = Arc::new(MemoryRecordStore::<InstanceInfo>::new());
    Collaborators {
        share_store: shares.clone(),
        instance_store: instances.clone(),
        share_cache: shares,
        instance_cache: instances,
        classes: Arc::new(MemoryCatalog::new()),
        inventory: Arc::new(MemoryInventory::new()),
    }
}

// =============================================================================
// Signals
// =============================================================================

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "reqwest=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
