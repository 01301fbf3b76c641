//! Mirror mesh actuator
//!
//! The mesh itself runs on the nodes and is installed through node file
//! mutation, so the control plane only owns its monitoring configuration.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use registry_cache_common::crd::{Extension, MirrorMeshConfig};
use registry_cache_common::Error;

use crate::actuator::Actuator;
use crate::client::ClusterClient;
use crate::monitoring::{build_mesh_monitoring, MESH_MONITORING_CONFIG_MAP};

/// Actuator of the `registry-spegel` extension
pub struct MeshActuator {
    client: Arc<dyn ClusterClient>,
}

impl MeshActuator {
    /// Create a new mesh actuator
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    fn namespace(extension: &Extension) -> Result<String, Error> {
        extension.namespace().ok_or_else(|| {
            Error::validation_for(extension.name_any(), "Extension must be namespaced")
        })
    }
}

#[async_trait]
impl Actuator for MeshActuator {
    async fn reconcile(&self, extension: &Extension) -> Result<(), Error> {
        let namespace = Self::namespace(extension)?;

        let cluster = self.client.get_cluster(&namespace).await?.ok_or_else(|| {
            Error::internal_with_context("reconcile", format!("cluster {} not found", namespace))
        })?;
        if cluster.spec.shoot.is_hibernated() {
            debug!(extension = %extension.key(), "shoot is hibernated, skipping mesh reconcile");
            return Ok(());
        }

        if extension.provider_config::<MirrorMeshConfig>()?.is_none() {
            return Err(Error::validation_for(
                extension.key(),
                "providerConfig is required for the registry-spegel extension",
            ));
        }

        self.client
            .apply_config_map(&build_mesh_monitoring(&namespace)?)
            .await?;
        info!(extension = %extension.key(), "deployed mirror mesh monitoring");
        Ok(())
    }

    async fn delete(&self, extension: &Extension) -> Result<(), Error> {
        let namespace = Self::namespace(extension)?;
        self.client
            .delete_config_map(&namespace, MESH_MONITORING_CONFIG_MAP)
            .await?;
        info!(extension = %extension.key(), "removed mirror mesh monitoring");
        Ok(())
    }

    async fn restore(&self, extension: &Extension) -> Result<(), Error> {
        self.reconcile(extension).await
    }

    async fn migrate(&self, extension: &Extension) -> Result<(), Error> {
        self.delete(extension).await
    }
}
