//! ManagedResource bundles
//!
//! Shoot-side objects are not applied directly. They are serialized into a
//! Secret in the control plane namespace and referenced by a `ManagedResource`,
//! which the resource manager reconciles into the shoot and deletes again
//! (PVCs included) when the ManagedResource goes away.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::Serialize;

use registry_cache_common::Error;

/// API group/version of ManagedResource
pub const MANAGED_RESOURCE_API_VERSION: &str = "resources.gardener.cloud/v1alpha1";
/// Kind of ManagedResource
pub const MANAGED_RESOURCE_KIND: &str = "ManagedResource";
/// Label keeping shoot objects alive during shoot cleanup
pub const NO_CLEANUP_LABEL: &str = "shoot.gardener.cloud/no-cleanup";
/// Secret key holding the serialized objects
pub const OBJECTS_KEY: &str = "objects.yaml";

/// A named set of objects applied into the shoot as one unit
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedResourceBundle {
    /// ManagedResource name
    pub name: String,
    /// Control plane namespace
    pub namespace: String,
    objects: Vec<serde_json::Value>,
}

impl ManagedResourceBundle {
    /// Create an empty bundle
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            objects: Vec::new(),
        }
    }

    /// Add a typed object; `apiVersion` and `kind` come from its serialization
    pub fn add<T: Serialize>(&mut self, object: &T) -> Result<(), Error> {
        let value = serde_json::to_value(object)?;
        if value.get("kind").is_none() || value.get("apiVersion").is_none() {
            return Err(Error::serialization(
                "bundled objects must serialize apiVersion and kind",
            ));
        }
        self.objects.push(value);
        Ok(())
    }

    /// Objects in insertion order
    pub fn objects(&self) -> &[serde_json::Value] {
        &self.objects
    }

    /// Name of the backing secret
    pub fn secret_name(&self) -> String {
        format!("managedresource-{}", self.name)
    }

    /// All objects as one multi-document YAML stream
    pub fn render(&self) -> Result<String, Error> {
        let docs = self
            .objects
            .iter()
            .map(|o| {
                serde_yaml::to_string(o)
                    .map_err(|e| Error::serialization_for_kind("ManagedResource", e.to_string()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(docs.join("---\n"))
    }

    /// The secret carrying the rendered objects
    pub fn to_secret(&self) -> Result<Secret, Error> {
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                OBJECTS_KEY.to_string(),
                ByteString(self.render()?.into_bytes()),
            )])),
            ..Default::default()
        })
    }

    /// The ManagedResource referencing the secret
    pub fn to_managed_resource(&self) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": MANAGED_RESOURCE_API_VERSION,
            "kind": MANAGED_RESOURCE_KIND,
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": {
                "secretRefs": [{"name": self.secret_name()}],
                "injectLabels": {NO_CLEANUP_LABEL: "true"},
                "keepObjects": false,
                "deletePersistentVolumeClaims": true,
            }
        })
    }
}
