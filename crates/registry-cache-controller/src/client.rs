//! Cluster access for the actuators
//!
//! [`ClusterClient`] is the seam between the actuators and the API servers.
//! Control plane objects (Extension, Cluster, secrets, ManagedResources,
//! ConfigMaps) live in the seed; cache Services live in the shoot and are read
//! through a client built from the shoot kubeconfig secret.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use registry_cache_common::crd::{Cluster, Extension, ExtensionStatus, OPERATION_ANNOTATION};
use registry_cache_common::kube_utils::client_from_kubeconfig_yaml;
use registry_cache_common::{Error, REGISTRY_CACHE_NAMESPACE, UPSTREAM_LABEL};

use crate::bundle::{ManagedResourceBundle, MANAGED_RESOURCE_KIND};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "registry-cache-extension";

/// Secret in the control plane namespace holding the shoot kubeconfig
pub const SHOOT_ACCESS_SECRET: &str = "gardener";

/// Key of the kubeconfig in [`SHOOT_ACCESS_SECRET`]
pub const SHOOT_ACCESS_KUBECONFIG_KEY: &str = "kubeconfig";

/// Trait abstracting cluster operations for the extension actuators
///
/// This trait allows mocking the Kubernetes clients in tests while using
/// the real clients in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get the Cluster object of a control plane namespace
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Apply a bundle's secret and ManagedResource
    async fn apply_managed_resource(&self, bundle: &ManagedResourceBundle) -> Result<(), Error>;

    /// Request deletion of a ManagedResource and its secret
    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Whether a ManagedResource still exists
    async fn managed_resource_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// List cache Services in the shoot of the given control plane namespace
    ///
    /// Only Services carrying the upstream label are returned.
    async fn list_cache_services(&self, namespace: &str) -> Result<Vec<Service>, Error>;

    /// Create or update a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Delete a ConfigMap, ignoring absence
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch an Extension's status; unset fields are left untouched
    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to an Extension
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from an Extension
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove the operation annotation from an Extension
    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real implementation of ClusterClient using kube-rs
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given seed client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn managed_resource_api(&self, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("resources.gardener.cloud", "v1alpha1", MANAGED_RESOURCE_KIND);
        let ar = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    async fn shoot_client(&self, namespace: &str) -> Result<Client, Error> {
        let secret = self
            .get_secret(namespace, SHOOT_ACCESS_SECRET)
            .await?
            .ok_or_else(|| {
                Error::internal_with_context(
                    "shoot_client",
                    format!("secret {}/{} not found", namespace, SHOOT_ACCESS_SECRET),
                )
            })?;
        let kubeconfig = secret
            .data
            .as_ref()
            .and_then(|d| d.get(SHOOT_ACCESS_KUBECONFIG_KEY))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "shoot_client",
                    format!(
                        "secret {}/{} has no {} key",
                        namespace, SHOOT_ACCESS_SECRET, SHOOT_ACCESS_KUBECONFIG_KEY
                    ),
                )
            })?;
        let kubeconfig = String::from_utf8(kubeconfig.0.clone()).map_err(|e| {
            Error::internal_with_context("shoot_client", format!("kubeconfig is not UTF-8: {}", e))
        })?;
        client_from_kubeconfig_yaml(&kubeconfig).await
    }

    async fn patch_extension(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_managed_resource(&self, bundle: &ManagedResourceBundle) -> Result<(), Error> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let secret = bundle.to_secret()?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &bundle.namespace);
        secrets
            .patch(&bundle.secret_name(), &params, &Patch::Apply(&secret))
            .await?;

        let mr: DynamicObject = serde_json::from_value(bundle.to_managed_resource())?;
        self.managed_resource_api(&bundle.namespace)
            .patch(&bundle.name, &params, &Patch::Apply(&mr))
            .await?;

        debug!(
            namespace = %bundle.namespace,
            managed_resource = %bundle.name,
            objects = bundle.objects().len(),
            "applied ManagedResource"
        );
        Ok(())
    }

    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .managed_resource_api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets
            .delete(&format!("managedresource-{}", name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn managed_resource_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .managed_resource_api(namespace)
            .get_opt(name)
            .await?
            .is_some())
    }

    async fn list_cache_services(&self, namespace: &str) -> Result<Vec<Service>, Error> {
        let shoot = self.shoot_client(namespace).await?;
        let api: Api<Service> = Api::namespaced(shoot, REGISTRY_CACHE_NAMESPACE);
        let list = api.list(&ListParams::default().labels(UPSTREAM_LABEL)).await?;
        Ok(list.items)
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.metadata.namespace.as_deref().ok_or_else(|| {
            Error::internal_with_context("apply_config_map", "ConfigMap has no namespace")
        })?;
        let name = config_map.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("apply_config_map", "ConfigMap has no name")
        })?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(config_map),
        )
        .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        let extension = api.get(name).await?;
        let mut finalizers = extension.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        self.patch_extension(
            namespace,
            name,
            serde_json::json!({ "metadata": { "finalizers": finalizers } }),
        )
        .await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<Extension> = Api::namespaced(self.client.clone(), namespace);
        let Some(extension) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = extension
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        self.patch_extension(
            namespace,
            name,
            serde_json::json!({ "metadata": { "finalizers": finalizers } }),
        )
        .await
    }

    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.patch_extension(
            namespace,
            name,
            serde_json::json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: null } } }),
        )
        .await
    }
}
