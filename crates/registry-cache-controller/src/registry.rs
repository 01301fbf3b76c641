//! Cache object synthesis
//!
//! Turns one [`DesiredCache`] into the Service and StatefulSet that run a
//! pull-through registry for its upstream. Pure: the same input always yields
//! the same objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, TCPSocketAction, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use registry_cache_common::credentials::UpstreamCredentials;
use registry_cache_common::crd::DesiredCache;
use registry_cache_common::upstream::{upstream_label_value, upstream_url};
use registry_cache_common::{
    REGISTRY_CACHE_NAMESPACE, REGISTRY_CACHE_PORT, UPSTREAM_ANNOTATION, UPSTREAM_LABEL,
};

/// Name of the cache container and its port
const CONTAINER_NAME: &str = "registry-cache";
/// Name of the cache volume
const VOLUME_NAME: &str = "cache-volume";
/// Where the registry stores blobs
const VOLUME_MOUNT_PATH: &str = "/var/lib/registry";

/// Upstream URL the registry proxies to
pub const ENV_REMOTE_URL: &str = "REGISTRY_PROXY_REMOTEURL";
/// Whether the registry may delete blobs
pub const ENV_DELETE_ENABLED: &str = "REGISTRY_STORAGE_DELETE_ENABLED";
/// Upstream username
pub const ENV_USERNAME: &str = "REGISTRY_PROXY_USERNAME";
/// Upstream password
pub const ENV_PASSWORD: &str = "REGISTRY_PROXY_PASSWORD";

/// Objects realizing one cache
#[derive(Clone, Debug, PartialEq)]
pub struct CacheObjects {
    /// ClusterIP service in front of the cache
    pub service: Service,
    /// Single-replica workload with one persistent volume
    pub stateful_set: StatefulSet,
}

/// Labels shared by every object of a cache
pub fn cache_labels(cache: &DesiredCache) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), cache.name()),
        (
            UPSTREAM_LABEL.to_string(),
            upstream_label_value(&cache.upstream),
        ),
    ])
}

/// Namespace holding every cache
pub fn build_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(REGISTRY_CACHE_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build the Service and StatefulSet for one cache
///
/// With credentials, the password is single-quoted so the registry's YAML
/// config loader keeps it a string.
pub fn build_cache_objects(
    cache: &DesiredCache,
    credentials: Option<&UpstreamCredentials>,
    image: &str,
) -> CacheObjects {
    let name = cache.name();
    let labels = cache_labels(cache);
    let annotations = BTreeMap::from([(UPSTREAM_ANNOTATION.to_string(), cache.upstream.clone())]);

    let metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(REGISTRY_CACHE_NAMESPACE.to_string()),
        labels: Some(labels.clone()),
        annotations: Some(annotations),
        ..Default::default()
    };

    let service = Service {
        metadata: metadata.clone(),
        spec: Some(ServiceSpec {
            selector: Some(labels.clone()),
            ports: Some(vec![ServicePort {
                name: Some(CONTAINER_NAME.to_string()),
                port: REGISTRY_CACHE_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(CONTAINER_NAME.to_string())),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: REGISTRY_CACHE_PORT,
            name: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        }]),
        env: Some(build_env(cache, credentials)),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String(CONTAINER_NAME.to_string()),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: VOLUME_MOUNT_PATH.to_string(),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let volume_claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(VOLUME_NAME.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cache.volume_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let stateful_set = StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            service_name: name,
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![volume_claim]),
            ..Default::default()
        }),
        ..Default::default()
    };

    CacheObjects {
        service,
        stateful_set,
    }
}

fn build_env(cache: &DesiredCache, credentials: Option<&UpstreamCredentials>) -> Vec<EnvVar> {
    let mut env = vec![
        env_var(ENV_REMOTE_URL, upstream_url(&cache.upstream)),
        env_var(
            ENV_DELETE_ENABLED,
            cache.garbage_collection_enabled.to_string(),
        ),
    ];

    if let Some(creds) = credentials {
        env.push(env_var(ENV_USERNAME, creds.username.clone()));
        env.push(env_var(ENV_PASSWORD, single_quote(&creds.password)));
    }

    env
}

/// YAML single-quoted scalar: embedded quotes are doubled
fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}
