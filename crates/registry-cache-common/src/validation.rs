//! Provider configuration validation
//!
//! Shared by the admission validators (which report every problem) and the
//! actuators (which fail on the first).

use std::collections::HashMap;

use crate::crd::{parse_storage_quantity, RegistryConfig};
use crate::upstream::{normalize_upstream, validate_upstream};
use crate::{Error, REGISTRY_CACHE_EXTENSION_TYPE};

/// Collect every problem with a registry configuration
///
/// Checks upstream syntax, duplicate upstreams, upstreams that normalize to
/// the same object name, and volume sizes.
pub fn registry_config_errors(config: &RegistryConfig) -> Vec<Error> {
    let mut errors = Vec::new();
    let mut seen_upstreams: HashMap<&str, usize> = HashMap::new();
    let mut seen_names: HashMap<String, usize> = HashMap::new();

    for (i, cache) in config.caches.iter().enumerate() {
        let field = format!("providerConfig.caches[{}]", i);

        if let Err(message) = validate_upstream(&cache.upstream) {
            errors.push(field_error(format!("{}.upstream", field), message));
            continue;
        }

        if let Some(first) = seen_upstreams.insert(cache.upstream.as_str(), i) {
            errors.push(field_error(
                format!("{}.upstream", field),
                format!(
                    "duplicate upstream {} (also at caches[{}])",
                    cache.upstream, first
                ),
            ));
            continue;
        }

        let name = normalize_upstream(&cache.upstream);
        if let Some(first) = seen_names.insert(name.clone(), i) {
            errors.push(field_error(
                format!("{}.upstream", field),
                format!(
                    "upstream {} maps to the same cache name as caches[{}] ({})",
                    cache.upstream, first, name
                ),
            ));
        }

        if let Some(size) = &cache.size {
            if parse_storage_quantity(size).is_none() {
                errors.push(field_error(
                    format!("{}.size", field),
                    format!("size {} must be a positive storage quantity", size),
                ));
            }
        }

        if let Some(reference) = &cache.secret_reference_name {
            if reference.is_empty() {
                errors.push(field_error(
                    format!("{}.secretReferenceName", field),
                    "secretReferenceName must not be empty",
                ));
            }
        }
    }

    errors
}

/// Validate a registry configuration, failing on the first problem
pub fn validate_registry_config(config: &RegistryConfig) -> Result<(), Error> {
    match registry_config_errors(config).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn field_error(field: String, message: impl Into<String>) -> Error {
    Error::validation_for_field(REGISTRY_CACHE_EXTENSION_TYPE, field, message)
}
