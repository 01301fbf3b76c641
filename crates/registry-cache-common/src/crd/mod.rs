//! Custom Resource Definitions and provider payloads
//!
//! `Extension` and `Cluster` are owned by the control plane; this crate only
//! reads and patches them. The registry and mesh types are the payloads carried
//! in `providerConfig` and `providerStatus`.

mod cluster;
mod extension;
mod mesh;
mod registry;

pub use cluster::{
    Cluster, ClusterSpec, Cri, CrossVersionObjectReference, Hibernation, NamedResourceReference,
    Shoot, ShootExtension, ShootMetadata, ShootProvider, ShootSpec, Worker, CRI_CONTAINERD,
};
pub use extension::{
    Extension, ExtensionSpec, ExtensionStatus, LastOperation, LastOperationState,
    LastOperationType, OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RECONCILE,
    OPERATION_RESTORE,
};
pub use mesh::{
    MeshPorts, MirrorMeshConfig, DEFAULT_METRICS_PORT, DEFAULT_REGISTRY_PORT, DEFAULT_ROUTER_PORT,
};
pub use registry::{
    parse_storage_quantity, DesiredCache, GarbageCollection, ProvisionedCache, RegistryCache,
    RegistryConfig, RegistryStatus, DEFAULT_CACHE_SIZE, DEFAULT_GARBAGE_COLLECTION_ENABLED,
    REGISTRY_API_VERSION, REGISTRY_STATUS_KIND,
};
