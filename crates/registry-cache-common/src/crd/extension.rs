//! Extension CRD types
//!
//! `Extension` is the per-shoot object the control plane creates for every
//! enabled extension. Its `spec.providerConfig` carries the operator's
//! configuration and its `status.providerStatus` carries what the actuator
//! observed. The node ensurers read both through this type.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Annotation requesting a one-off operation on an Extension
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Operation annotation value requesting an immediate reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Operation annotation value requesting a restore
pub const OPERATION_RESTORE: &str = "restore";

/// Operation annotation value requesting a migration
pub const OPERATION_MIGRATE: &str = "migrate";

/// Specification of an Extension
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Extension",
    plural = "extensions",
    namespaced,
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Extension type (e.g., "registry-cache", "registry-spegel")
    #[serde(rename = "type")]
    pub type_: String,

    /// Extension-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
}

/// Kind of the last operation performed on an Extension
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationType {
    /// First reconciliation
    Create,
    /// Regular reconciliation
    #[default]
    Reconcile,
    /// Teardown
    Delete,
    /// Re-apply after control plane migration
    Restore,
    /// Hand-over to another actuator
    Migrate,
}

/// State of the last operation performed on an Extension
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastOperationState {
    /// Operation in flight
    #[default]
    Processing,
    /// Operation finished successfully
    Succeeded,
    /// Operation failed and will be retried
    Error,
}

impl std::fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Reconcile => write!(f, "Reconcile"),
            Self::Delete => write!(f, "Delete"),
            Self::Restore => write!(f, "Restore"),
            Self::Migrate => write!(f, "Migrate"),
        }
    }
}

impl std::fmt::Display for LastOperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "Processing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Last operation performed on an Extension
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    /// Operation state
    pub state: LastOperationState,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Completion percentage
    #[serde(default)]
    pub progress: i32,
    /// Last time the operation was updated
    pub last_update_time: DateTime<Utc>,
}

impl LastOperation {
    /// Create a new last operation stamped with the current time
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
    ) -> Self {
        let progress = match state {
            LastOperationState::Succeeded => 100,
            _ => 1,
        };
        Self {
            type_,
            state,
            description: description.into(),
            progress,
            last_update_time: Utc::now(),
        }
    }
}

/// Observed state of an Extension
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// Last operation performed by the actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Extension-specific observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    /// Generation last processed by the actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Extension {
    /// Decode `spec.providerConfig`, returning `None` when absent
    pub fn provider_config<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        self.spec
            .provider_config
            .as_ref()
            .map(|raw| {
                serde_json::from_value(raw.clone()).map_err(|e| {
                    Error::serialization_for_kind(
                        "providerConfig",
                        format!("failed to decode providerConfig of extension {}: {}", self.key(), e),
                    )
                })
            })
            .transpose()
    }

    /// Decode `status.providerStatus`, returning `None` when absent
    pub fn provider_status<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        self.status
            .as_ref()
            .and_then(|s| s.provider_status.as_ref())
            .map(|raw| {
                serde_json::from_value(raw.clone()).map_err(|e| {
                    Error::serialization_for_kind(
                        "providerStatus",
                        format!("failed to decode providerStatus of extension {}: {}", self.key(), e),
                    )
                })
            })
            .transpose()
    }

    /// Whether the last operation finished successfully
    pub fn last_operation_succeeded(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.last_operation.as_ref())
            .map(|op| op.state == LastOperationState::Succeeded)
            .unwrap_or(false)
    }

    /// Value of the `gardener.cloud/operation` annotation, if any
    pub fn operation_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OPERATION_ANNOTATION))
            .map(String::as_str)
    }

    /// `namespace/name` for log and error messages
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}
