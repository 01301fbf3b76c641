//! Mirror mesh (spegel) provider configuration

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Default port serving the OCI registry on each node
pub const DEFAULT_REGISTRY_PORT: u16 = 5000;
/// Default port of the P2P router on each node
pub const DEFAULT_ROUTER_PORT: u16 = 5001;
/// Default metrics port on each node
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Mesh daemon configuration as written by users
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMeshConfig {
    /// Port serving the OCI registry on each node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_port: Option<u16>,
    /// Port of the P2P router on each node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_port: Option<u16>,
    /// Metrics port on each node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

/// Fully resolved mesh ports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshPorts {
    /// Port serving the OCI registry on each node
    pub registry: u16,
    /// Port of the P2P router on each node
    pub router: u16,
    /// Metrics port on each node
    pub metrics: u16,
}

impl MirrorMeshConfig {
    /// Fill unset ports with their defaults
    pub fn apply_defaults(&mut self) {
        self.registry_port.get_or_insert(DEFAULT_REGISTRY_PORT);
        self.router_port.get_or_insert(DEFAULT_ROUTER_PORT);
        self.metrics_port.get_or_insert(DEFAULT_METRICS_PORT);
    }

    /// Require all three ports, reporting every missing one
    pub fn validate(&self) -> Result<MeshPorts, Error> {
        let missing: Vec<&str> = [
            ("registryPort", self.registry_port),
            ("routerPort", self.router_port),
            ("metricsPort", self.metrics_port),
        ]
        .iter()
        .filter(|(_, port)| port.is_none())
        .map(|(name, _)| *name)
        .collect();

        match (self.registry_port, self.router_port, self.metrics_port) {
            (Some(registry), Some(router), Some(metrics)) => Ok(MeshPorts {
                registry,
                router,
                metrics,
            }),
            _ => Err(Error::validation_for_field(
                crate::REGISTRY_SPEGEL_EXTENSION_TYPE,
                format!("providerConfig.{}", missing.first().copied().unwrap_or_default()),
                format!("ports must be provided: {}", missing.join(", ")),
            )),
        }
    }

    /// Default then validate
    pub fn resolve(mut self) -> Result<MeshPorts, Error> {
        self.apply_defaults();
        self.validate()
    }
}
