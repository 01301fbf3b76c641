//! Node configuration types
//!
//! Files, units and CRI settings that the node provisioning pipeline installs
//! on every worker. Ensurers mutate these in place; every collection is a
//! [`KeyedSet`] so a repeated write replaces the previous entry instead of
//! appending a duplicate.

use std::borrow::Borrow;

use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

/// Encoding marker for base64 inline content
pub const BASE64_ENCODING: &str = "b64";

// =============================================================================
// Keyed ordered container
// =============================================================================

/// An entry addressable by a unique key
pub trait Keyed {
    /// Key type
    type Key: PartialEq;

    /// The entry's key
    fn key(&self) -> &Self::Key;
}

/// Ordered collection holding at most one entry per key
///
/// `upsert` replaces an existing entry in place, keeping its position, or
/// appends a new one. Serializes as a plain list; on deserialization later
/// duplicates replace earlier ones.
#[derive(Clone, Debug, PartialEq, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct KeyedSet<T> {
    items: Vec<T>,
}

impl<T> Default for KeyedSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Keyed> KeyedSet<T> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by key, returning the replaced entry
    pub fn upsert(&mut self, item: T) -> Option<T> {
        match self.items.iter().position(|i| i.key() == item.key()) {
            Some(idx) => Some(std::mem::replace(&mut self.items[idx], item)),
            None => {
                self.items.push(item);
                None
            }
        }
    }

    /// Look up an entry by key
    pub fn get<Q>(&self, key: &Q) -> Option<&T>
    where
        T::Key: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        self.items.iter().find(|i| i.key().borrow() == key)
    }

    /// Remove an entry by key
    pub fn remove<Q>(&mut self, key: &Q) -> Option<T>
    where
        T::Key: Borrow<Q>,
        Q: PartialEq + ?Sized,
    {
        let idx = self.items.iter().position(|i| i.key().borrow() == key)?;
        Some(self.items.remove(idx))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<'de, T: Keyed + Deserialize<'de>> Deserialize<'de> for KeyedSet<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<T>::deserialize(deserializer)?.into_iter().collect())
    }
}

impl<T: Keyed> FromIterator<T> for KeyedSet<T> {
    /// Later entries win over earlier ones with the same key
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.upsert(item);
        }
        set
    }
}

impl<T: Keyed> Extend<T> for KeyedSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.upsert(item);
        }
    }
}

impl<'a, T> IntoIterator for &'a KeyedSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// =============================================================================
// Files
// =============================================================================

/// A file installed on every node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeFile {
    /// Absolute path on the node
    pub path: String,
    /// Unix permissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    /// File content
    pub content: FileContent,
}

impl Keyed for NodeFile {
    type Key = String;

    fn key(&self) -> &String {
        &self.path
    }
}

/// Content of a node file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum FileContent {
    /// Content carried inline
    Inline(FileContentInline),
    /// Content extracted from a container image
    ImageRef(FileContentImageRef),
}

/// Inline file content
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileContentInline {
    /// Empty for plain text, `b64` for base64
    #[serde(default)]
    pub encoding: String,
    /// The (possibly encoded) data
    pub data: String,
}

impl FileContentInline {
    /// Plain-text content
    pub fn plain(data: impl Into<String>) -> Self {
        Self {
            encoding: String::new(),
            data: data.into(),
        }
    }

    /// Base64-encoded content
    pub fn base64(data: impl AsRef<[u8]>) -> Self {
        Self {
            encoding: BASE64_ENCODING.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    /// Decode to text regardless of encoding
    pub fn decoded(&self) -> Result<String, Error> {
        match self.encoding.as_str() {
            "" => Ok(self.data.clone()),
            BASE64_ENCODING => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&self.data)
                    .map_err(|e| Error::serialization(format!("invalid base64 content: {}", e)))?;
                String::from_utf8(bytes)
                    .map_err(|e| Error::serialization(format!("content is not UTF-8: {}", e)))
            }
            other => Err(Error::serialization(format!(
                "unsupported file encoding {}",
                other
            ))),
        }
    }
}

/// File content extracted from an image
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileContentImageRef {
    /// Image reference
    pub image: String,
    /// Path of the file inside the image
    pub file_path_in_image: String,
}

// =============================================================================
// Units
// =============================================================================

/// Command applied to a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum UnitCommand {
    /// Start the unit
    Start,
    /// Restart the unit
    Restart,
    /// Stop the unit
    Stop,
}

/// A systemd unit installed on every node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeUnit {
    /// Unit name (e.g., "spegel.service")
    pub name: String,
    /// Command to run after installation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<UnitCommand>,
    /// Whether the unit is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Unit file content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Files whose change restarts the unit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
}

impl Keyed for NodeUnit {
    type Key = String;

    fn key(&self) -> &String {
        &self.name
    }
}

// =============================================================================
// CRI
// =============================================================================

/// Container runtime configuration of a node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CriConfig {
    /// Runtime name
    #[serde(default)]
    pub name: String,
    /// containerd settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containerd: Option<ContainerdConfig>,
}

/// containerd settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerdConfig {
    /// Registry host configuration per upstream
    #[serde(default)]
    pub registries: Vec<RegistryHostsConfig>,
    /// Plugin configuration, one entry per plugin path
    #[serde(default)]
    pub plugins: KeyedSet<PluginConfig>,
}

/// containerd `hosts.toml` settings for one upstream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHostsConfig {
    /// Upstream host
    pub upstream: String,
    /// Fallback server URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Mirror hosts in priority order
    #[serde(default)]
    pub hosts: Vec<RegistryHost>,
}

/// A mirror host entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHost {
    /// Mirror URL
    pub url: String,
    /// Operations the mirror serves
    #[serde(default)]
    pub capabilities: Vec<RegistryCapability>,
}

/// Operation a registry host may serve
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RegistryCapability {
    /// Fetch content
    Pull,
    /// Resolve tags to digests
    Resolve,
    /// Upload content
    Push,
}

/// containerd plugin settings at a config path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// TOML table path (e.g., `["io.containerd.grpc.v1.cri", "containerd"]`)
    pub path: Vec<String>,
    /// Values merged into the table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

impl Keyed for PluginConfig {
    type Key = Vec<String>;

    fn key(&self) -> &Vec<String> {
        &self.path
    }
}
