//! End-to-end lifecycle of the registry cache extension against an in-memory
//! control plane: reconcile two caches, render their mirror files, delete.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;

use registry_cache_common::crd::{
    Cluster, ClusterSpec, Extension, ExtensionSpec, ExtensionStatus, LastOperationState,
    LastOperationType, RegistryStatus, Shoot, OPERATION_ANNOTATION,
};
use registry_cache_common::osc::{FileContent, KeyedSet, NodeFile};
use registry_cache_common::{Error, REGISTRY_CACHE_EXTENSION_TYPE};
use registry_cache_controller::bundle::ManagedResourceBundle;
use registry_cache_controller::controller::{reconcile, Context};
use registry_cache_controller::monitoring::CACHE_MONITORING_CONFIG_MAP;
use registry_cache_controller::{ActuatorConfig, CacheActuator, ClusterClient};
use registry_cache_webhook::{ExtensionReader, PullThroughEnsurer};

const NAMESPACE: &str = "shoot--dev--a";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    clusters: HashMap<String, Cluster>,
    extensions: HashMap<Key, Extension>,
    secrets: HashMap<Key, Secret>,
    bundles: HashMap<Key, ManagedResourceBundle>,
    services: Vec<Service>,
    config_maps: HashMap<Key, ConfigMap>,
    next_ip: u8,
}

/// Seed and shoot in one map; applying a bundle realizes its Services with
/// cluster IPs handed out from 10.0.0.5 upwards.
#[derive(Default)]
struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().expect("mutex should not be poisoned");
        f(&mut state)
    }

    fn extension(&self, namespace: &str, name: &str) -> Extension {
        self.with(|s| s.extensions[&key(namespace, name)].clone())
    }
}

#[async_trait]
impl ClusterClient for InMemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.with(|s| s.clusters.get(name).cloned()))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.with(|s| s.secrets.get(&key(namespace, name)).cloned()))
    }

    async fn apply_managed_resource(&self, bundle: &ManagedResourceBundle) -> Result<(), Error> {
        let services: Vec<Service> = bundle
            .objects()
            .iter()
            .filter(|o| o["kind"] == "Service")
            .map(|o| serde_json::from_value(o.clone()))
            .collect::<Result<_, _>>()?;

        self.with(|s| {
            for mut svc in services {
                let existing = s
                    .services
                    .iter()
                    .position(|e| e.metadata.name == svc.metadata.name);
                let ip = match existing {
                    Some(i) => s.services[i]
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.cluster_ip.clone()),
                    None => {
                        let ip = format!("10.0.0.{}", 5 + s.next_ip);
                        s.next_ip += 1;
                        Some(ip)
                    }
                };
                if let Some(spec) = svc.spec.as_mut() {
                    spec.cluster_ip = ip;
                }
                match existing {
                    Some(i) => s.services[i] = svc,
                    None => s.services.push(svc),
                }
            }
            s.bundles
                .insert(key(&bundle.namespace, &bundle.name), bundle.clone());
        });
        Ok(())
    }

    async fn delete_managed_resource(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.bundles.remove(&key(namespace, name));
            s.services.clear();
        });
        Ok(())
    }

    async fn managed_resource_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.with(|s| s.bundles.contains_key(&key(namespace, name))))
    }

    async fn list_cache_services(&self, _namespace: &str) -> Result<Vec<Service>, Error> {
        Ok(self.with(|s| s.services.clone()))
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let k = key(
            config_map.metadata.namespace.as_deref().unwrap_or_default(),
            config_map.metadata.name.as_deref().unwrap_or_default(),
        );
        self.with(|s| s.config_maps.insert(k, config_map.clone()));
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| s.config_maps.remove(&key(namespace, name)));
        Ok(())
    }

    async fn patch_extension_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExtensionStatus,
    ) -> Result<(), Error> {
        self.with(|s| {
            if let Some(ext) = s.extensions.get_mut(&key(namespace, name)) {
                let current = ext.status.get_or_insert_with(ExtensionStatus::default);
                if status.last_operation.is_some() {
                    current.last_operation = status.last_operation.clone();
                }
                if status.provider_status.is_some() {
                    current.provider_status = status.provider_status.clone();
                }
                if status.observed_generation.is_some() {
                    current.observed_generation = status.observed_generation;
                }
            }
        });
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<(), Error> {
        self.with(|s| {
            if let Some(ext) = s.extensions.get_mut(&key(namespace, name)) {
                let finalizers = ext.metadata.finalizers.get_or_insert_with(Vec::new);
                if !finalizers.iter().any(|f| f == finalizer) {
                    finalizers.push(finalizer.to_string());
                }
            }
        });
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.with(|s| {
            if let Some(ext) = s.extensions.get_mut(&key(namespace, name)) {
                if let Some(finalizers) = ext.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
            }
        });
        Ok(())
    }

    async fn remove_operation_annotation(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            if let Some(ext) = s.extensions.get_mut(&key(namespace, name)) {
                if let Some(annotations) = ext.metadata.annotations.as_mut() {
                    annotations.remove(OPERATION_ANNOTATION);
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ExtensionReader for InMemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.with(|s| s.clusters.get(name).cloned()))
    }

    async fn get_extension(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Extension>, Error> {
        Ok(self.with(|s| s.extensions.get(&key(namespace, name)).cloned()))
    }
}

fn seeded_store() -> Arc<InMemoryStore> {
    let store = InMemoryStore::default();
    store.with(|s| {
        s.clusters.insert(
            NAMESPACE.to_string(),
            Cluster::new(
                NAMESPACE,
                ClusterSpec {
                    shoot: Shoot::default(),
                },
            ),
        );
        s.extensions.insert(
            key(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE),
            Extension {
                metadata: ObjectMeta {
                    name: Some(REGISTRY_CACHE_EXTENSION_TYPE.to_string()),
                    namespace: Some(NAMESPACE.to_string()),
                    generation: Some(1),
                    ..Default::default()
                },
                spec: ExtensionSpec {
                    type_: REGISTRY_CACHE_EXTENSION_TYPE.to_string(),
                    provider_config: Some(serde_json::json!({
                        "caches": [
                            {"upstream": "docker.io", "size": "10Gi"},
                            {"upstream": "quay.io", "size": "5Gi"}
                        ]
                    })),
                },
                status: None,
            },
        );
    });
    Arc::new(store)
}

fn context(store: &Arc<InMemoryStore>) -> Arc<Context> {
    let client: Arc<dyn ClusterClient> = store.clone();
    let actuator = CacheActuator::new(
        client.clone(),
        ActuatorConfig {
            service_wait_timeout: Duration::ZERO,
            delete_timeout: Duration::ZERO,
            ..Default::default()
        },
    );
    Arc::new(Context::new(
        client,
        Arc::new(actuator),
        REGISTRY_CACHE_EXTENSION_TYPE,
    ))
}

fn inline_data(file: &NodeFile) -> &str {
    match &file.content {
        FileContent::Inline(inline) => &inline.data,
        FileContent::ImageRef(_) => panic!("expected inline content for {}", file.path),
    }
}

#[tokio::test]
async fn two_caches_end_up_as_two_mirror_files() {
    let store = seeded_store();
    let ctx = context(&store);

    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    reconcile(Arc::new(ext), ctx.clone()).await.unwrap();

    // One bundle with namespace, two services and two workloads
    let bundle = store.with(|s| {
        s.bundles[&key(NAMESPACE, "extension-registry-cache")].clone()
    });
    let kinds: Vec<_> = bundle
        .objects()
        .iter()
        .map(|o| o["kind"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        kinds,
        vec!["Namespace", "Service", "StatefulSet", "Service", "StatefulSet"]
    );
    let sizes: Vec<_> = bundle
        .objects()
        .iter()
        .filter(|o| o["kind"] == "StatefulSet")
        .map(|o| {
            o["spec"]["volumeClaimTemplates"][0]["spec"]["resources"]["requests"]["storage"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(sizes, vec!["10Gi", "5Gi"]);

    // Status is published in configuration order and the operation succeeded
    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    let status: RegistryStatus = ext.provider_status().unwrap().unwrap();
    let endpoints: Vec<_> = status
        .caches
        .iter()
        .map(|c| (c.upstream.as_str(), c.endpoint.as_str()))
        .collect();
    assert_eq!(
        endpoints,
        vec![("docker.io", "10.0.0.5:5000"), ("quay.io", "10.0.0.6:5000")]
    );
    let op = ext.status.as_ref().unwrap().last_operation.as_ref().unwrap();
    assert_eq!(op.type_, LastOperationType::Create);
    assert_eq!(op.state, LastOperationState::Succeeded);
    assert!(store.with(|s| s
        .config_maps
        .contains_key(&key(NAMESPACE, CACHE_MONITORING_CONFIG_MAP))));

    // The node ensurer turns the status into one mirror file per upstream
    let reader: Arc<dyn ExtensionReader> = store.clone();
    let ensurer = PullThroughEnsurer::new(reader);
    let mut files = KeyedSet::new();
    ensurer
        .ensure_additional_files(NAMESPACE, &mut files)
        .await
        .unwrap();
    ensurer
        .ensure_additional_files(NAMESPACE, &mut files)
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    let docker = files
        .get("/etc/containerd/certs.d/docker.io/hosts.toml")
        .unwrap();
    assert_eq!(
        inline_data(docker),
        "server = \"https://registry-1.docker.io\"\n\n[host.\"http://10.0.0.5:5000\"]\n  capabilities = [\"pull\", \"resolve\"]\n"
    );
    let quay = files
        .get("/etc/containerd/certs.d/quay.io/hosts.toml")
        .unwrap();
    assert!(inline_data(quay).contains("server = \"https://quay.io\""));
    assert!(inline_data(quay).contains("[host.\"http://10.0.0.6:5000\"]"));

    // An event right after the success does not actuate again
    let settled = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    let action = reconcile(Arc::new(settled.clone()), ctx.clone()).await.unwrap();
    assert_ne!(action, Action::await_change());
    assert_eq!(
        store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE).status,
        settled.status
    );

    // Services lost in the shoot come back on a requested reconcile
    store.with(|s| {
        s.services.clear();
        if let Some(ext) = s
            .extensions
            .get_mut(&key(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE))
        {
            ext.metadata.annotations = Some(BTreeMap::from([(
                OPERATION_ANNOTATION.to_string(),
                "reconcile".to_string(),
            )]));
        }
    });
    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    reconcile(Arc::new(ext), ctx).await.unwrap();

    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    assert_eq!(ext.operation_annotation(), None);
    let status: RegistryStatus = ext.provider_status().unwrap().unwrap();
    let endpoints: Vec<_> = status.caches.iter().map(|c| c.endpoint.as_str()).collect();
    assert_eq!(endpoints, vec!["10.0.0.7:5000", "10.0.0.8:5000"]);
    assert_eq!(store.with(|s| s.services.len()), 2);
}

#[tokio::test]
async fn delete_tears_down_bundle_and_releases_finalizer() {
    let store = seeded_store();
    let ctx = context(&store);

    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    reconcile(Arc::new(ext), ctx.clone()).await.unwrap();

    store.with(|s| {
        if let Some(ext) = s
            .extensions
            .get_mut(&key(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE))
        {
            ext.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        }
    });

    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    assert_eq!(
        ext.metadata.finalizers.as_deref(),
        Some(&["extensions.gardener.cloud/registry-cache".to_string()][..])
    );
    let action = reconcile(Arc::new(ext), ctx).await.unwrap();
    assert_eq!(action, Action::await_change());

    let ext = store.extension(NAMESPACE, REGISTRY_CACHE_EXTENSION_TYPE);
    assert_eq!(ext.metadata.finalizers, Some(vec![]));
    store.with(|s| {
        assert!(s.bundles.is_empty());
        assert!(s.services.is_empty());
        assert!(s.config_maps.is_empty());
    });
}
