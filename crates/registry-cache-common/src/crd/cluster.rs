//! Cluster CRD types
//!
//! The `Cluster` object is cluster-scoped and named after the shoot's control
//! plane namespace. Only the slice of the embedded shoot manifest that the
//! extension reads is modelled here; unknown fields are ignored on decode.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The shoot this cluster object describes
    pub shoot: Shoot,
}

/// Subset of a shoot manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    /// Shoot metadata
    #[serde(default)]
    pub metadata: ShootMetadata,
    /// Shoot specification
    #[serde(default)]
    pub spec: ShootSpec,
}

/// Subset of shoot metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootMetadata {
    /// Shoot name
    #[serde(default)]
    pub name: String,
    /// Project namespace of the shoot
    #[serde(default)]
    pub namespace: String,
    /// Set once the shoot is being deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub deletion_timestamp: Option<Time>,
}

/// Subset of a shoot specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Extensions enabled for the shoot
    #[serde(default)]
    pub extensions: Vec<ShootExtension>,
    /// Hibernation settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hibernation: Option<Hibernation>,
    /// Infrastructure provider settings
    #[serde(default)]
    pub provider: ShootProvider,
    /// Resources referenced by extensions (secrets, configmaps)
    #[serde(default)]
    pub resources: Vec<NamedResourceReference>,
}

/// Extension entry of a shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootExtension {
    /// Extension type
    #[serde(rename = "type")]
    pub type_: String,
    /// Raw provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
    /// Whether the extension is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// Shoot hibernation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hibernation {
    /// Whether the shoot is hibernated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Shoot provider settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootProvider {
    /// Worker pools
    #[serde(default)]
    pub workers: Vec<Worker>,
}

/// Worker pool of a shoot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Pool name
    pub name: String,
    /// Container runtime interface settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cri: Option<Cri>,
}

/// Container runtime interface of a worker pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cri {
    /// Runtime name (e.g., "containerd")
    pub name: String,
}

/// Name of the containerd CRI
pub const CRI_CONTAINERD: &str = "containerd";

/// A named reference to a resource in the shoot's project namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedResourceReference {
    /// Name extensions use to refer to this resource
    pub name: String,
    /// The referenced resource
    pub resource_ref: CrossVersionObjectReference,
}

/// Reference to an object by kind and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    /// Kind of the referent (e.g., "Secret")
    pub kind: String,
    /// Name of the referent
    pub name: String,
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl Shoot {
    /// Whether hibernation is enabled
    pub fn is_hibernated(&self) -> bool {
        self.spec
            .hibernation
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(false)
    }

    /// Whether the shoot carries a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Find the extension entry of the given type
    pub fn find_extension(&self, type_: &str) -> Option<&ShootExtension> {
        self.spec.extensions.iter().find(|e| e.type_ == type_)
    }

    /// Find a named resource reference
    pub fn find_resource(&self, name: &str) -> Option<&NamedResourceReference> {
        self.spec.resources.iter().find(|r| r.name == name)
    }

    /// `namespace/name` for log and error messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}
