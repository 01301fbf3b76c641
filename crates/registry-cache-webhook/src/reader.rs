//! Read access for the ensurers
//!
//! Ensurers only ever read the Cluster and the Extension of the shoot whose
//! node configuration they mutate.

use async_trait::async_trait;
use kube::api::Api;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use registry_cache_common::crd::{Cluster, Extension};
use registry_cache_common::Error;

/// Trait abstracting the reads the ensurers need
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExtensionReader: Send + Sync {
    /// Get the Cluster object named after a control plane namespace
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error>;

    /// Get an Extension by namespace and name
    async fn get_extension(&self, namespace: &str, name: &str)
        -> Result<Option<Extension>, Error>;
}

/// Real implementation of ExtensionReader using kube-rs
pub struct KubeExtensionReader {
    client: Client,
}

impl KubeExtensionReader {
    /// Create a new reader wrapping the given seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExtensionReader for KubeExtensionReader {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_extension(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Extension>, Error> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Load the Cluster, treating absence as an error
pub(crate) async fn require_cluster(
    reader: &dyn ExtensionReader,
    name: &str,
) -> Result<Cluster, Error> {
    reader.get_cluster(name).await?.ok_or_else(|| {
        Error::internal_with_context("ensurer", format!("cluster {} not found", name))
    })
}

/// Load an Extension, treating absence as an error
pub(crate) async fn require_extension(
    reader: &dyn ExtensionReader,
    namespace: &str,
    name: &str,
) -> Result<Extension, Error> {
    reader.get_extension(namespace, name).await?.ok_or_else(|| {
        Error::consistency(
            "extension",
            format!("extension {}/{} not found", namespace, name),
        )
    })
}
