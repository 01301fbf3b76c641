//! Registry cache provider configuration and status
//!
//! `RegistryConfig` is what users put into the shoot's extension
//! `providerConfig`. `RegistryStatus` is what the actuator publishes into the
//! Extension's `status.providerStatus` once every cache has an endpoint.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::upstream::cache_name;

/// API version of the provider config and status payloads
pub const REGISTRY_API_VERSION: &str = "registry.extensions.gardener.cloud/v1alpha1";

/// Kind of the provider status payload
pub const REGISTRY_STATUS_KIND: &str = "RegistryStatus";

/// Default cache volume size
pub const DEFAULT_CACHE_SIZE: &str = "10Gi";

/// Default for garbage collection of cached blobs
pub const DEFAULT_GARBAGE_COLLECTION_ENABLED: bool = true;

/// Registry cache provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Caches to run, in order
    #[serde(default)]
    pub caches: Vec<RegistryCache>,
}

/// A single pull-through cache as configured by the user
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCache {
    /// Upstream registry as `host[:port]`
    pub upstream: String,

    /// Size of the cache volume (e.g., "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Garbage collection settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection: Option<GarbageCollection>,

    /// Name of a shoot resource reference holding upstream credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_reference_name: Option<String>,
}

/// Garbage collection settings of a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GarbageCollection {
    /// Whether cached blobs may be deleted
    pub enabled: bool,
}

/// A cache with all defaults resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredCache {
    /// Upstream registry as `host[:port]`
    pub upstream: String,
    /// Size of the cache volume
    pub volume_size: String,
    /// Whether cached blobs may be deleted
    pub garbage_collection_enabled: bool,
    /// Optional credential reference name
    pub secret_reference_name: Option<String>,
}

impl DesiredCache {
    /// Object name derived from the upstream
    pub fn name(&self) -> String {
        cache_name(&self.upstream)
    }
}

impl RegistryCache {
    /// Resolve defaults into a [`DesiredCache`]
    pub fn to_desired(&self) -> DesiredCache {
        DesiredCache {
            upstream: self.upstream.clone(),
            volume_size: self
                .size
                .clone()
                .unwrap_or_else(|| DEFAULT_CACHE_SIZE.to_string()),
            garbage_collection_enabled: self
                .garbage_collection
                .as_ref()
                .map(|gc| gc.enabled)
                .unwrap_or(DEFAULT_GARBAGE_COLLECTION_ENABLED),
            secret_reference_name: self.secret_reference_name.clone(),
        }
    }
}

impl RegistryConfig {
    /// All configured caches with defaults resolved, in configuration order
    pub fn desired_caches(&self) -> Vec<DesiredCache> {
        self.caches.iter().map(RegistryCache::to_desired).collect()
    }
}

/// Published observed state of the cache fleet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    /// One entry per configured cache, in configuration order
    #[serde(default)]
    pub caches: Vec<ProvisionedCache>,
}

/// A cache that has a reachable endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedCache {
    /// Upstream registry as `host[:port]`
    pub upstream: String,
    /// `host:port` of the cache service reachable from nodes
    pub endpoint: String,
}

impl RegistryStatus {
    /// Serialize as a typed `providerStatus` payload
    pub fn to_provider_status(&self) -> Result<serde_json::Value, crate::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "apiVersion".to_string(),
                serde_json::Value::String(REGISTRY_API_VERSION.to_string()),
            );
            obj.insert(
                "kind".to_string(),
                serde_json::Value::String(REGISTRY_STATUS_KIND.to_string()),
            );
        }
        Ok(value)
    }
}

/// Parse a Kubernetes storage quantity into bytes.
///
/// Accepts an unsigned decimal number followed by an optional binary
/// (`Ki`..`Ei`) or decimal (`k`..`E`) suffix. Returns `None` for anything
/// else, including zero.
pub fn parse_storage_quantity(quantity: &str) -> Option<u128> {
    const SUFFIXES: &[(&str, u128)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    let quantity = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((quantity, 1));

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u128 = number.parse().ok()?;
    let bytes = value.checked_mul(multiplier)?;
    (bytes > 0).then_some(bytes)
}
