//! Common types for the registry cache extension: CRDs, errors, naming and
//! node configuration types

#![deny(missing_docs)]

pub mod credentials;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod osc;
pub mod telemetry;
pub mod upstream;
pub mod validation;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Extension type of the pull-through cache fleet
pub const REGISTRY_CACHE_EXTENSION_TYPE: &str = "registry-cache";

/// Extension type of the peer-to-peer mirror mesh
pub const REGISTRY_SPEGEL_EXTENSION_TYPE: &str = "registry-spegel";

/// Shoot namespace hosting the cache workloads
pub const REGISTRY_CACHE_NAMESPACE: &str = "registry-cache";

/// Label carried by every cache object, valued after the upstream it serves
pub const UPSTREAM_LABEL: &str = "upstream-host";

/// Annotation carrying the raw upstream (label values cannot hold `:`)
pub const UPSTREAM_ANNOTATION: &str = "registry.extensions.gardener.cloud/upstream";

/// Name of the ManagedResource bundling the cache fleet
pub const MANAGED_RESOURCE_NAME: &str = "extension-registry-cache";

/// Port every cache listens on
pub const REGISTRY_CACHE_PORT: i32 = 5000;

/// Directory containerd reads registry host configuration from
pub const CONTAINERD_CERTS_DIR: &str = "/etc/containerd/certs.d";
