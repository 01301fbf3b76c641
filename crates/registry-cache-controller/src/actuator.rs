//! Pull-through cache fleet actuator
//!
//! Reconcile turns the Extension's `providerConfig` into one cache per
//! upstream, bundled into a single ManagedResource, waits for the shoot
//! Services to appear and publishes their endpoints as `providerStatus`.
//! Delete removes the bundle and waits (bounded) until it is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use registry_cache_common::credentials::{lookup_referenced_secret, UpstreamCredentials};
use registry_cache_common::crd::{DesiredCache, Extension, ExtensionStatus, RegistryConfig, Shoot};
use registry_cache_common::kube_utils::{poll_until, wait_until_deleted};
use registry_cache_common::validation::validate_registry_config;
use registry_cache_common::{Error, MANAGED_RESOURCE_NAME};

use crate::bundle::ManagedResourceBundle;
use crate::client::ClusterClient;
use crate::monitoring::{build_cache_monitoring, CACHE_MONITORING_CONFIG_MAP};
use crate::registry::{build_cache_objects, build_namespace};
use crate::status::collect_provisioned_caches;

/// Default registry image run by every cache
pub const DEFAULT_REGISTRY_IMAGE: &str = "europe-docker.pkg.dev/gardener-project/releases/3rd/registry:3.0.0";

/// Lifecycle operations of an extension type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Create or update everything the extension needs
    async fn reconcile(&self, extension: &Extension) -> Result<(), Error>;

    /// Remove everything the extension created
    async fn delete(&self, extension: &Extension) -> Result<(), Error>;

    /// Re-create state after a control plane migration
    async fn restore(&self, extension: &Extension) -> Result<(), Error>;

    /// Release state ahead of a control plane migration
    async fn migrate(&self, extension: &Extension) -> Result<(), Error>;
}

/// Tunables of the cache actuator
#[derive(Clone, Debug)]
pub struct ActuatorConfig {
    /// Registry image run by every cache
    pub registry_image: String,
    /// How long to wait for every cache Service to exist
    pub service_wait_timeout: Duration,
    /// Interval between Service list attempts
    pub service_poll_interval: Duration,
    /// How long to wait for the bundle to disappear on delete
    pub delete_timeout: Duration,
    /// Interval between deletion checks
    pub delete_poll_interval: Duration,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            registry_image: DEFAULT_REGISTRY_IMAGE.to_string(),
            service_wait_timeout: Duration::from_secs(60),
            service_poll_interval: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(120),
            delete_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Actuator of the `registry-cache` extension
pub struct CacheActuator {
    client: Arc<dyn ClusterClient>,
    config: ActuatorConfig,
}

impl CacheActuator {
    /// Create a new cache actuator
    pub fn new(client: Arc<dyn ClusterClient>, config: ActuatorConfig) -> Self {
        Self { client, config }
    }

    async fn get_shoot(&self, namespace: &str) -> Result<Shoot, Error> {
        self.client
            .get_cluster(namespace)
            .await?
            .map(|c| c.spec.shoot)
            .ok_or_else(|| {
                Error::internal_with_context("reconcile", format!("cluster {} not found", namespace))
            })
    }

    /// Resolve credentials for every cache, failing on the first problem
    async fn resolve_credentials(
        &self,
        namespace: &str,
        shoot: &Shoot,
        caches: &[DesiredCache],
    ) -> Result<Vec<Option<UpstreamCredentials>>, Error> {
        let mut resolved = Vec::with_capacity(caches.len());
        for cache in caches {
            let Some(reference) = cache.secret_reference_name.as_deref() else {
                resolved.push(None);
                continue;
            };

            let secret_name = lookup_referenced_secret(shoot, reference)?;
            let secret = self
                .client
                .get_secret(namespace, &secret_name)
                .await?
                .ok_or_else(|| {
                    Error::credential(
                        format!("{}/{}", namespace, secret_name),
                        format!("secret for upstream {} not found", cache.upstream),
                    )
                })?;
            debug!(upstream = %cache.upstream, secret = %secret_name, "resolved upstream credentials");
            resolved.push(Some(UpstreamCredentials::from_secret(&secret)?));
        }
        Ok(resolved)
    }

    fn build_bundle(
        &self,
        namespace: &str,
        caches: &[DesiredCache],
        credentials: &[Option<UpstreamCredentials>],
    ) -> Result<ManagedResourceBundle, Error> {
        let mut bundle = ManagedResourceBundle::new(MANAGED_RESOURCE_NAME, namespace);
        bundle.add(&build_namespace())?;
        for (cache, creds) in caches.iter().zip(credentials) {
            let objects = build_cache_objects(cache, creds.as_ref(), &self.config.registry_image);
            bundle.add(&objects.service)?;
            bundle.add(&objects.stateful_set)?;
        }
        Ok(bundle)
    }

    /// Wait (bounded) until the shoot has one Service per cache
    async fn wait_for_services(&self, namespace: &str, expected: usize) {
        let client = self.client.clone();
        let result = poll_until(
            self.config.service_wait_timeout,
            self.config.service_poll_interval,
            format!("expected {} cache services in shoot of {}", expected, namespace),
            || {
                let client = client.clone();
                let namespace = namespace.to_string();
                async move { Ok(client.list_cache_services(&namespace).await?.len() == expected) }
            },
        )
        .await;
        if let Err(e) = result {
            warn!(namespace = %namespace, error = %e, "cache services did not converge in time");
        }
    }
}

fn extension_namespace(extension: &Extension) -> Result<String, Error> {
    extension.namespace().ok_or_else(|| {
        Error::validation_for(extension.name_any(), "Extension must be namespaced")
    })
}

#[async_trait]
impl Actuator for CacheActuator {
    async fn reconcile(&self, extension: &Extension) -> Result<(), Error> {
        let namespace = extension_namespace(extension)?;
        let Some(config) = extension.provider_config::<RegistryConfig>()? else {
            debug!(extension = %extension.key(), "no providerConfig, nothing to reconcile");
            return Ok(());
        };
        validate_registry_config(&config)?;

        let caches = config.desired_caches();
        let shoot = self.get_shoot(&namespace).await?;
        let credentials = self.resolve_credentials(&namespace, &shoot, &caches).await?;

        let bundle = self.build_bundle(&namespace, &caches, &credentials)?;
        self.client.apply_managed_resource(&bundle).await?;
        info!(
            extension = %extension.key(),
            caches = caches.len(),
            "applied registry cache bundle"
        );

        self.wait_for_services(&namespace, caches.len()).await;
        let services = self.client.list_cache_services(&namespace).await?;
        let status = collect_provisioned_caches(&caches, &services)?;

        self.client
            .patch_extension_status(
                &namespace,
                &extension.name_any(),
                &ExtensionStatus {
                    provider_status: Some(status.to_provider_status()?),
                    ..Default::default()
                },
            )
            .await?;

        let monitoring = build_cache_monitoring(&namespace, &caches)?;
        self.client.apply_config_map(&monitoring).await?;

        info!(
            extension = %extension.key(),
            caches = status.caches.len(),
            "published registry cache status"
        );
        Ok(())
    }

    async fn delete(&self, extension: &Extension) -> Result<(), Error> {
        let namespace = extension_namespace(extension)?;
        info!(extension = %extension.key(), "deleting registry cache bundle");

        self.client
            .delete_managed_resource(&namespace, MANAGED_RESOURCE_NAME)
            .await?;

        let client = self.client.clone();
        wait_until_deleted(
            format!("ManagedResource {}/{}", namespace, MANAGED_RESOURCE_NAME),
            self.config.delete_timeout,
            self.config.delete_poll_interval,
            || {
                let client = client.clone();
                let namespace = namespace.clone();
                async move {
                    client
                        .managed_resource_exists(&namespace, MANAGED_RESOURCE_NAME)
                        .await
                }
            },
        )
        .await?;

        self.client
            .delete_config_map(&namespace, CACHE_MONITORING_CONFIG_MAP)
            .await
    }

    async fn restore(&self, extension: &Extension) -> Result<(), Error> {
        self.reconcile(extension).await
    }

    async fn migrate(&self, extension: &Extension) -> Result<(), Error> {
        debug!(extension = %extension.key(), "migrate is a no-op for registry caches");
        Ok(())
    }
}
