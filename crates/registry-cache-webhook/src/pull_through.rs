//! Pull-through mirror configuration
//!
//! Points containerd at the provisioned caches: one `hosts.toml` per upstream
//! under [`CONTAINERD_CERTS_DIR`], built only from the Extension's published
//! status.

use std::sync::Arc;

use tracing::{debug, info};

use registry_cache_common::crd::{ProvisionedCache, RegistryStatus};
use registry_cache_common::osc::{FileContent, FileContentInline, KeyedSet, NodeFile};
use registry_cache_common::upstream::upstream_url;
use registry_cache_common::{Error, CONTAINERD_CERTS_DIR, REGISTRY_CACHE_EXTENSION_TYPE};

use crate::reader::{require_cluster, require_extension, ExtensionReader};

/// Permissions of every mirror file
pub const MIRROR_FILE_PERMISSIONS: u32 = 0o644;

/// Path of the mirror file for an upstream
pub fn mirror_file_path(upstream: &str) -> String {
    format!("{}/{}/hosts.toml", CONTAINERD_CERTS_DIR, upstream)
}

/// containerd hosts configuration sending pulls of `upstream` to `endpoint`
pub fn hosts_toml(upstream: &str, endpoint: &str) -> String {
    format!(
        "server = \"{}\"\n\n[host.\"http://{}\"]\n  capabilities = [\"pull\", \"resolve\"]\n",
        upstream_url(upstream),
        endpoint
    )
}

/// Mirror file for one provisioned cache
pub fn mirror_file(cache: &ProvisionedCache) -> NodeFile {
    NodeFile {
        path: mirror_file_path(&cache.upstream),
        permissions: Some(MIRROR_FILE_PERMISSIONS),
        content: FileContent::Inline(FileContentInline::plain(hosts_toml(
            &cache.upstream,
            &cache.endpoint,
        ))),
    }
}

/// Ensurer writing one mirror file per provisioned cache
pub struct PullThroughEnsurer {
    reader: Arc<dyn ExtensionReader>,
}

impl PullThroughEnsurer {
    /// Create a new ensurer
    pub fn new(reader: Arc<dyn ExtensionReader>) -> Self {
        Self { reader }
    }

    /// Merge the mirror files of `cluster_name`'s caches into `files`
    ///
    /// Files are keyed by path, so calling this again with its own output
    /// leaves the set unchanged. Deleting and hibernated shoots are skipped:
    /// their published status may be missing or stale.
    pub async fn ensure_additional_files(
        &self,
        cluster_name: &str,
        files: &mut KeyedSet<NodeFile>,
    ) -> Result<(), Error> {
        let cluster = require_cluster(self.reader.as_ref(), cluster_name).await?;
        let shoot = &cluster.spec.shoot;
        if shoot.is_deleting() {
            info!(shoot = %shoot.key(), "shoot is being deleted, skipping mirror configuration");
            return Ok(());
        }
        if shoot.is_hibernated() {
            info!(shoot = %shoot.key(), "shoot is hibernated, skipping mirror configuration");
            return Ok(());
        }

        let extension = require_extension(
            self.reader.as_ref(),
            cluster_name,
            REGISTRY_CACHE_EXTENSION_TYPE,
        )
        .await?;
        if !extension.last_operation_succeeded() {
            return Err(Error::consistency(
                "extension",
                format!(
                    "extension {} has not yet succeeded",
                    extension.key()
                ),
            ));
        }
        let status = extension
            .provider_status::<RegistryStatus>()?
            .ok_or_else(|| {
                Error::consistency(
                    "extension",
                    format!(
                        "extension {} does not have a .status.providerStatus specified",
                        extension.key()
                    ),
                )
            })?;

        for cache in &status.caches {
            let file = mirror_file(cache);
            debug!(upstream = %cache.upstream, path = %file.path, "ensuring mirror file");
            files.upsert(file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MockExtensionReader;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use registry_cache_common::crd::{
        Cluster, ClusterSpec, Extension, ExtensionSpec, ExtensionStatus, Hibernation,
        LastOperation, LastOperationState, LastOperationType, Shoot,
    };

    const CLUSTER: &str = "shoot--dev--a";

    fn cache(upstream: &str, endpoint: &str) -> ProvisionedCache {
        ProvisionedCache {
            upstream: upstream.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    fn cluster(shoot: Shoot) -> Cluster {
        Cluster::new(CLUSTER, ClusterSpec { shoot })
    }

    fn extension(state: LastOperationState, caches: Vec<ProvisionedCache>) -> Extension {
        Extension {
            metadata: ObjectMeta {
                name: Some(REGISTRY_CACHE_EXTENSION_TYPE.to_string()),
                namespace: Some(CLUSTER.to_string()),
                ..Default::default()
            },
            spec: ExtensionSpec {
                type_: REGISTRY_CACHE_EXTENSION_TYPE.to_string(),
                provider_config: None,
            },
            status: Some(ExtensionStatus {
                last_operation: Some(LastOperation::new(LastOperationType::Reconcile, state, "")),
                provider_status: Some(
                    RegistryStatus { caches }.to_provider_status().unwrap(),
                ),
                observed_generation: None,
            }),
        }
    }

    fn reader(cluster: Cluster, extension: Extension) -> Arc<MockExtensionReader> {
        let mut mock = MockExtensionReader::new();
        mock.expect_get_cluster()
            .returning(move |_| Ok(Some(cluster.clone())));
        mock.expect_get_extension()
            .returning(move |_, _| Ok(Some(extension.clone())));
        Arc::new(mock)
    }

    #[test]
    fn docker_hub_mirror_file() {
        let file = mirror_file(&cache("docker.io", "10.0.0.5:5000"));
        assert_eq!(file.path, "/etc/containerd/certs.d/docker.io/hosts.toml");
        assert_eq!(file.permissions, Some(0o644));
        let FileContent::Inline(inline) = file.content else {
            panic!("expected inline content");
        };
        assert_eq!(
            inline.data,
            "server = \"https://registry-1.docker.io\"\n\n[host.\"http://10.0.0.5:5000\"]\n  capabilities = [\"pull\", \"resolve\"]\n"
        );
    }

    #[test]
    fn other_upstreams_pass_through() {
        assert!(hosts_toml("quay.io", "10.0.0.6:5000").starts_with("server = \"https://quay.io\""));
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let ensurer = PullThroughEnsurer::new(reader(
            cluster(Shoot::default()),
            extension(
                LastOperationState::Succeeded,
                vec![cache("docker.io", "10.0.0.5:5000"), cache("quay.io", "10.0.0.6:5000")],
            ),
        ));

        let mut files = KeyedSet::new();
        files.upsert(NodeFile {
            path: "/etc/unrelated".to_string(),
            permissions: None,
            content: FileContent::Inline(FileContentInline::plain("x")),
        });

        ensurer.ensure_additional_files(CLUSTER, &mut files).await.unwrap();
        let once = files.clone();
        ensurer.ensure_additional_files(CLUSTER, &mut files).await.unwrap();

        assert_eq!(files, once);
        assert_eq!(files.len(), 3);
        assert!(files.get("/etc/containerd/certs.d/quay.io/hosts.toml").is_some());
    }

    #[tokio::test]
    async fn stale_file_for_same_upstream_is_replaced() {
        let ensurer = PullThroughEnsurer::new(reader(
            cluster(Shoot::default()),
            extension(
                LastOperationState::Succeeded,
                vec![cache("docker.io", "10.0.0.9:5000")],
            ),
        ));
        let mut files: KeyedSet<NodeFile> =
            std::iter::once(mirror_file(&cache("docker.io", "10.0.0.5:5000"))).collect();

        ensurer.ensure_additional_files(CLUSTER, &mut files).await.unwrap();

        assert_eq!(files.len(), 1);
        let FileContent::Inline(inline) = &files.iter().next().unwrap().content else {
            panic!("expected inline content");
        };
        assert!(inline.data.contains("10.0.0.9:5000"));
    }

    #[tokio::test]
    async fn unfinished_extension_is_an_error() {
        let ensurer = PullThroughEnsurer::new(reader(
            cluster(Shoot::default()),
            extension(LastOperationState::Processing, vec![]),
        ));
        let mut files = KeyedSet::new();
        let err = ensurer
            .ensure_additional_files(CLUSTER, &mut files)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not yet succeeded"));
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn hibernated_and_deleting_shoots_are_skipped() {
        let mut hibernated = Shoot::default();
        hibernated.spec.hibernation = Some(Hibernation {
            enabled: Some(true),
        });
        let mut deleting = Shoot::default();
        deleting.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        for shoot in [hibernated, deleting] {
            let mut mock = MockExtensionReader::new();
            let c = cluster(shoot);
            mock.expect_get_cluster()
                .returning(move |_| Ok(Some(c.clone())));
            mock.expect_get_extension().never();

            let ensurer = PullThroughEnsurer::new(Arc::new(mock));
            let mut files = KeyedSet::new();
            ensurer.ensure_additional_files(CLUSTER, &mut files).await.unwrap();
            assert!(files.is_empty());
        }
    }
}
