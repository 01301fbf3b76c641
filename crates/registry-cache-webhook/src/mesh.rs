//! Mirror mesh node configuration
//!
//! Installs the node-local mesh daemon: its binary (pulled from an image),
//! a metrics scraper feeding the node-exporter textfile collector, the two
//! systemd units running them, a default containerd mirror pointing at the
//! daemon and a CRI patch putting the daemon first for every configured
//! registry.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use registry_cache_common::crd::{MeshPorts, MirrorMeshConfig};
use registry_cache_common::osc::{
    ContainerdConfig, CriConfig, FileContent, FileContentImageRef, FileContentInline, KeyedSet,
    NodeFile, NodeUnit, PluginConfig, RegistryCapability, RegistryHost, UnitCommand,
};
use registry_cache_common::{Error, CONTAINERD_CERTS_DIR, REGISTRY_SPEGEL_EXTENSION_TYPE};

use crate::reader::{require_cluster, require_extension, ExtensionReader};

/// Default image carrying the mesh daemon binary
pub const DEFAULT_MESH_IMAGE: &str = "ghcr.io/spegel-org/spegel:v0.0.28";

/// Directory node binaries are installed into
pub const BINARIES_DIR: &str = "/opt/bin";

/// Path of the daemon binary inside the image
pub const BINARY_PATH_IN_IMAGE: &str = "/app/spegel";

/// Daemon unit name
pub const DAEMON_UNIT: &str = "spegel.service";

/// Metrics scraper unit name
pub const METRICS_UNIT: &str = "spegel-metrics.service";

const CONTAINERD_UNIT: &str = "containerd.service";
const KUBELET_UNIT: &str = "kubelet.service";
const NODE_AGENT_KUBECONFIG: &str = "/var/lib/gardener-node-agent/credentials/kubeconfig";
const TEXTFILE_COLLECTOR_OUTPUT: &str = "/var/lib/node-exporter/textfile-collector/spegel.prom";
const CRI_PLUGIN_PATH: [&str; 2] = ["io.containerd.grpc.v1.cri", "containerd"];
const NODE_IP_ENV_FILE: &str = "/run/spegel/node-ip.env";

/// Node-side settings of the mesh ensurer
#[derive(Clone, Debug)]
pub struct MeshEnsurerConfig {
    /// Address every daemon advertises to its peers. When unset, each node
    /// resolves its own outbound address before the daemon starts.
    pub node_ip: Option<IpAddr>,
    /// Image carrying the daemon binary
    pub image: String,
}

fn daemon_path() -> String {
    format!("{}/spegel", BINARIES_DIR)
}

fn metrics_script_path() -> String {
    format!("{}/spegel_metrics.sh", BINARIES_DIR)
}

fn node_ip_script_path() -> String {
    format!("{}/spegel_node_ip.sh", BINARIES_DIR)
}

/// URL of the node-local mirror
pub fn local_mirror_url(ports: &MeshPorts) -> String {
    format!("http://localhost:{}", ports.registry)
}

/// Command line of the mesh daemon
pub fn cli_flags(ports: &MeshPorts) -> Vec<String> {
    vec![
        "registry".to_string(),
        "--log-level=DEBUG".to_string(),
        "--mirror-resolve-retries=3".to_string(),
        "--mirror-resolve-timeout=20ms".to_string(),
        format!("--registry-addr=:{}", ports.registry),
        format!("--router-addr=:{}", ports.router),
        format!("--metrics-addr=:{}", ports.metrics),
        "--registries".to_string(),
        "--containerd-sock=/run/containerd/containerd.sock".to_string(),
        "--containerd-namespace=k8s.io".to_string(),
        format!("--containerd-registry-config-path={}", CONTAINERD_CERTS_DIR),
        "--bootstrap-kind=kubernetes".to_string(),
        format!("--kubeconfig-path={}", NODE_AGENT_KUBECONFIG),
        "--leader-election-namespace=kube-system".to_string(),
        "--resolve-latest-tag=true".to_string(),
        format!("--local-addr=$(NODE_IP):{}", ports.registry),
        "--containerd-content-path=/var/lib/containerd/io.containerd.content.v1.content"
            .to_string(),
    ]
}

/// Files installing the daemon, its scraper and the default mirror, plus the
/// node address resolver unless the address is pinned
pub fn mesh_files(ports: &MeshPorts, config: &MeshEnsurerConfig) -> Vec<NodeFile> {
    let default_hosts = format!(
        "# managed by the registry-cache extension\n[host.\"{}\"]\n  capabilities = [\"pull\", \"resolve\"]",
        local_mirror_url(ports)
    );
    let scraper = format!(
        r#"#!/bin/bash
set -o nounset
set -o pipefail

function scrape_spegel_metrics {{
  while true; do
    curl --request GET -sL \
         --url 'http://localhost:{port}/metrics' \
         --output "$output_file.tmp"
    mv "$output_file.tmp" "$output_file"
    sleep $SLEEP_SECONDS
  done
}}

output_file="{output}"
SLEEP_SECONDS=5
echo "Start scraping spegel metrics"
scrape_spegel_metrics"#,
        port = ports.metrics,
        output = TEXTFILE_COLLECTOR_OUTPUT,
    );

    let mut files = vec![
        NodeFile {
            path: format!("{}/_default/hosts.toml", CONTAINERD_CERTS_DIR),
            permissions: Some(0o644),
            content: FileContent::Inline(FileContentInline::base64(default_hosts)),
        },
        NodeFile {
            path: daemon_path(),
            permissions: Some(0o755),
            content: FileContent::ImageRef(FileContentImageRef {
                image: config.image.clone(),
                file_path_in_image: BINARY_PATH_IN_IMAGE.to_string(),
            }),
        },
        NodeFile {
            path: metrics_script_path(),
            permissions: Some(0o755),
            content: FileContent::Inline(FileContentInline::base64(scraper)),
        },
    ];
    if config.node_ip.is_none() {
        files.push(NodeFile {
            path: node_ip_script_path(),
            permissions: Some(0o755),
            content: FileContent::Inline(FileContentInline::base64(node_ip_script())),
        });
    }
    files
}

/// Writes the node's outbound address (the source of its route to the
/// internet) as `NODE_IP` into the daemon's environment file
fn node_ip_script() -> String {
    format!(
        r#"#!/bin/bash
set -o errexit
set -o nounset
set -o pipefail

env_file="{env_file}"
node_ip="$(ip -o route get 8.8.8.8 | sed -n 's/.* src \([^ ]*\).*/\1/p')"
if [[ -z "$node_ip" ]]; then
  echo "Could not determine the node address" >&2
  exit 1
fi
mkdir -p "$(dirname "$env_file")"
echo "NODE_IP=$node_ip" > "$env_file""#,
        env_file = NODE_IP_ENV_FILE,
    )
}

/// Units running the daemon and its metrics scraper
///
/// The environment file is written by `ExecStartPre` and read by systemd
/// only when `ExecStart` runs.
pub fn mesh_units(ports: &MeshPorts, node_ip: Option<IpAddr>) -> Vec<NodeUnit> {
    let mut daemon_files = vec![daemon_path()];
    let environment = match node_ip {
        Some(ip) => format!("Environment=\"NODE_IP={}\"", ip),
        None => {
            daemon_files.push(node_ip_script_path());
            format!(
                "ExecStartPre={}\nEnvironmentFile={}",
                node_ip_script_path(),
                NODE_IP_ENV_FILE
            )
        }
    };
    let daemon = format!(
        "[Unit]
Description=spegel daemon
Documentation=https://github.com/spegel-org/spegel
After={containerd}
Requires={containerd}
Before={kubelet}
[Install]
WantedBy=multi-user.target
[Service]
Restart=always
RestartSec=5
MemoryHigh=80M
MemoryMax=100M
{environment}
ExecStart={binary} \\
    {flags}
",
        containerd = CONTAINERD_UNIT,
        kubelet = KUBELET_UNIT,
        environment = environment,
        binary = daemon_path(),
        flags = cli_flags(ports).join(" \\\n    "),
    );
    let metrics = format!(
        "[Unit]
Description=spegel metrics daemon
Documentation=https://github.com/spegel-org/spegel
After={daemon}
BindsTo={daemon}
[Install]
WantedBy=multi-user.target
[Service]
Restart=always
RestartSec=5
ExecStart={script}",
        daemon = DAEMON_UNIT,
        script = metrics_script_path(),
    );

    vec![
        NodeUnit {
            name: DAEMON_UNIT.to_string(),
            command: Some(UnitCommand::Start),
            enable: Some(true),
            content: Some(daemon),
            file_paths: daemon_files,
        },
        NodeUnit {
            name: METRICS_UNIT.to_string(),
            command: Some(UnitCommand::Start),
            enable: Some(true),
            content: Some(metrics),
            file_paths: vec![metrics_script_path()],
        },
    ]
}

/// Put the node-local mirror first for every registry and keep unpacked
/// layers so the daemon can serve them
///
/// A registry whose first host already is the local mirror is left alone,
/// so repeated calls prepend at most once.
pub fn patch_cri_config(cri: &mut CriConfig, ports: &MeshPorts) {
    let containerd = cri.containerd.get_or_insert_with(ContainerdConfig::default);

    let path: Vec<String> = CRI_PLUGIN_PATH.iter().map(|s| s.to_string()).collect();
    let existing = containerd
        .plugins
        .get(&path)
        .and_then(|p| p.values.clone())
        .and_then(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        });
    let mut values = existing.unwrap_or_default();
    values.insert(
        "discard_unpacked_layers".to_string(),
        serde_json::Value::Bool(false),
    );
    containerd.plugins.upsert(PluginConfig {
        path,
        values: Some(serde_json::Value::Object(values)),
    });

    let local = local_mirror_url(ports);
    for registry in &mut containerd.registries {
        let first_is_local = registry.hosts.first().is_some_and(|h| h.url == local);
        if !first_is_local {
            registry.hosts.insert(
                0,
                RegistryHost {
                    url: local.clone(),
                    capabilities: vec![RegistryCapability::Pull, RegistryCapability::Resolve],
                },
            );
        }
    }
}

/// Ensurer installing the mirror mesh on every node
pub struct MeshEnsurer {
    reader: Arc<dyn ExtensionReader>,
    config: MeshEnsurerConfig,
}

impl MeshEnsurer {
    /// Create a new ensurer
    pub fn new(reader: Arc<dyn ExtensionReader>, config: MeshEnsurerConfig) -> Self {
        Self { reader, config }
    }

    /// Resolve the mesh ports, or `None` when the shoot must not be mutated
    async fn ports(&self, cluster_name: &str) -> Result<Option<MeshPorts>, Error> {
        let cluster = require_cluster(self.reader.as_ref(), cluster_name).await?;
        let shoot = &cluster.spec.shoot;
        if shoot.is_deleting() || shoot.is_hibernated() {
            info!(shoot = %shoot.key(), "shoot is being deleted or hibernated, skipping mesh configuration");
            return Ok(None);
        }

        let extension = require_extension(
            self.reader.as_ref(),
            cluster_name,
            REGISTRY_SPEGEL_EXTENSION_TYPE,
        )
        .await?;
        let config = extension
            .provider_config::<MirrorMeshConfig>()?
            .ok_or_else(|| {
                Error::validation_for(
                    extension.key(),
                    "extension does not have a .spec.providerConfig specified",
                )
            })?;
        Ok(Some(config.resolve()?))
    }

    /// Merge the mesh files into `files`
    pub async fn ensure_additional_files(
        &self,
        cluster_name: &str,
        files: &mut KeyedSet<NodeFile>,
    ) -> Result<(), Error> {
        let Some(ports) = self.ports(cluster_name).await? else {
            return Ok(());
        };
        files.extend(mesh_files(&ports, &self.config));
        debug!(cluster = %cluster_name, "ensured mesh files");
        Ok(())
    }

    /// Merge the mesh units into `units`
    pub async fn ensure_additional_units(
        &self,
        cluster_name: &str,
        units: &mut KeyedSet<NodeUnit>,
    ) -> Result<(), Error> {
        let Some(ports) = self.ports(cluster_name).await? else {
            return Ok(());
        };
        units.extend(mesh_units(&ports, self.config.node_ip));
        debug!(cluster = %cluster_name, "ensured mesh units");
        Ok(())
    }

    /// Patch the CRI configuration for the mesh
    pub async fn ensure_cri_config(
        &self,
        cluster_name: &str,
        cri: &mut CriConfig,
    ) -> Result<(), Error> {
        let Some(ports) = self.ports(cluster_name).await? else {
            return Ok(());
        };
        patch_cri_config(cri, &ports);
        debug!(cluster = %cluster_name, "ensured mesh CRI configuration");
        Ok(())
    }
}
