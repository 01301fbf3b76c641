//! Registry cache extension operator

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use registry_cache_common::crd::{Extension, Shoot};
use registry_cache_common::osc::{CriConfig, KeyedSet};
use registry_cache_common::telemetry::init_logging;
use registry_cache_common::{REGISTRY_CACHE_EXTENSION_TYPE, REGISTRY_SPEGEL_EXTENSION_TYPE};
use registry_cache_controller::actuator::DEFAULT_REGISTRY_IMAGE;
use registry_cache_controller::{
    error_policy, reconcile, Actuator, ActuatorConfig, CacheActuator, ClusterClient, Context,
    KubeClusterClient, MeshActuator,
};
use registry_cache_webhook::admission::{mesh_shoot_errors, registry_cache_shoot_errors};
use registry_cache_webhook::mesh::DEFAULT_MESH_IMAGE;
use registry_cache_webhook::{
    ExtensionReader, KubeExtensionReader, MeshEnsurer, MeshEnsurerConfig, PullThroughEnsurer,
};

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Gardener extension provisioning pull-through registry caches for shoots
#[derive(Parser, Debug)]
#[command(name = "registry-cache-operator", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
struct Config {
    /// Image run by every registry cache
    #[arg(long, env = "REGISTRY_IMAGE", default_value = DEFAULT_REGISTRY_IMAGE, global = true)]
    registry_image: String,

    /// Image carrying the mirror mesh daemon binary
    #[arg(long, env = "MESH_IMAGE", default_value = DEFAULT_MESH_IMAGE, global = true)]
    mesh_image: String,

    /// Concurrent reconciles per controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 5, global = true)]
    max_concurrent_reconciles: u16,

    /// Seconds to wait for every cache Service to appear
    #[arg(long, env = "SERVICE_WAIT_TIMEOUT_SECS", default_value_t = 60, global = true)]
    service_wait_timeout_secs: u64,

    /// Seconds to wait for the cache bundle to be deleted
    #[arg(long, env = "DELETE_TIMEOUT_SECS", default_value_t = 120, global = true)]
    delete_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Pin the address every mirror mesh daemon advertises to its peers;
    /// by default each node resolves its own outbound address
    #[arg(long, env = "NODE_IP", global = true)]
    node_ip: Option<IpAddr>,
}

impl Config {
    fn actuator_config(&self) -> ActuatorConfig {
        ActuatorConfig {
            registry_image: self.registry_image.clone(),
            service_wait_timeout: Duration::from_secs(self.service_wait_timeout_secs),
            delete_timeout: Duration::from_secs(self.delete_timeout_secs),
            ..Default::default()
        }
    }

    fn mesh_ensurer_config(&self) -> MeshEnsurerConfig {
        MeshEnsurerConfig {
            node_ip: self.node_ip,
            image: self.mesh_image.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the extension controllers (default mode)
    Controller,

    /// Print the node configuration an extension contributes for a cluster
    NodeConfig {
        /// Cluster (control plane namespace) name
        #[arg(long)]
        cluster: String,

        /// Extension whose node configuration to render
        #[arg(long, value_enum, default_value_t = ExtensionKind::RegistryCache)]
        extension: ExtensionKind,
    },

    /// Validate a shoot manifest's extension configuration
    ValidateShoot {
        /// Path to a shoot manifest (YAML or JSON)
        path: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ExtensionKind {
    RegistryCache,
    RegistrySpegel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.config.log_json).context("failed to initialize logging")?;

    match cli.command {
        Some(Commands::Controller) | None => run_controllers(&cli.config).await,
        Some(Commands::NodeConfig { cluster, extension }) => {
            render_node_config(&cli.config, &cluster, extension).await
        }
        Some(Commands::ValidateShoot { path }) => validate_shoot(&path),
    }
}

/// Run one controller per extension type until a shutdown signal arrives
async fn run_controllers(config: &Config) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let cluster_client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));

    let cache: Arc<dyn Actuator> = Arc::new(CacheActuator::new(
        cluster_client.clone(),
        config.actuator_config(),
    ));
    let mesh: Arc<dyn Actuator> = Arc::new(MeshActuator::new(cluster_client.clone()));

    let cache_ctx = Arc::new(Context::new(
        cluster_client.clone(),
        cache,
        REGISTRY_CACHE_EXTENSION_TYPE,
    ));
    let mesh_ctx = Arc::new(Context::new(
        cluster_client,
        mesh,
        REGISTRY_SPEGEL_EXTENSION_TYPE,
    ));

    tracing::info!(
        registry_image = %config.registry_image,
        concurrency = config.max_concurrent_reconciles,
        "starting registry cache extension controllers"
    );

    let controller_config = ControllerConfig::default().concurrency(config.max_concurrent_reconciles);
    let extensions: Api<Extension> = Api::all(client);

    let cache_ctrl = Controller::new(
        extensions.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(controller_config.clone())
    .shutdown_on_signal()
    .run(reconcile, error_policy, cache_ctx)
    .for_each(log_reconcile_result(REGISTRY_CACHE_EXTENSION_TYPE));

    let mesh_ctrl = Controller::new(
        extensions,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(controller_config)
    .shutdown_on_signal()
    .run(reconcile, error_policy, mesh_ctx)
    .for_each(log_reconcile_result(REGISTRY_SPEGEL_EXTENSION_TYPE));

    tokio::join!(cache_ctrl, mesh_ctrl);
    tracing::info!("controllers stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

/// Run an extension's ensurers against empty node configuration and print it
async fn render_node_config(
    config: &Config,
    cluster: &str,
    extension: ExtensionKind,
) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let reader: Arc<dyn ExtensionReader> = Arc::new(KubeExtensionReader::new(client));

    let mut files = KeyedSet::new();
    let mut units = KeyedSet::new();
    let mut cri = CriConfig::default();

    match extension {
        ExtensionKind::RegistryCache => {
            PullThroughEnsurer::new(reader)
                .ensure_additional_files(cluster, &mut files)
                .await?;
        }
        ExtensionKind::RegistrySpegel => {
            let ensurer = MeshEnsurer::new(reader, config.mesh_ensurer_config());
            ensurer.ensure_additional_files(cluster, &mut files).await?;
            ensurer.ensure_additional_units(cluster, &mut units).await?;
            ensurer.ensure_cri_config(cluster, &mut cri).await?;
        }
    }

    let rendered = serde_json::json!({
        "files": files,
        "units": units,
        "cri": cri,
    });
    print!(
        "{}",
        serde_yaml::to_string(&rendered).context("failed to render node configuration")?
    );
    Ok(())
}

/// Validate a shoot manifest, printing every problem
fn validate_shoot(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let shoot: Shoot = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse shoot manifest {}", path.display()))?;

    let errors: Vec<_> = registry_cache_shoot_errors(&shoot)
        .into_iter()
        .chain(mesh_shoot_errors(&shoot))
        .collect();
    if errors.is_empty() {
        println!("shoot {} is valid", shoot.key());
        return Ok(());
    }
    for error in &errors {
        eprintln!("{}", error);
    }
    anyhow::bail!("shoot {} has {} validation error(s)", shoot.key(), errors.len())
}
