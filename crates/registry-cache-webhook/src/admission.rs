//! Shoot admission validation
//!
//! Checks a shoot's `registry-cache` and `registry-spegel` extension entries
//! before the shoot is admitted. Validators collect every problem; the
//! `validate_*` wrappers return the first one. Shoots without the extension
//! (or with it disabled) always pass.

use registry_cache_common::credentials::lookup_referenced_secret;
use registry_cache_common::crd::{
    MirrorMeshConfig, RegistryConfig, Shoot, ShootExtension, CRI_CONTAINERD,
};
use registry_cache_common::validation::registry_config_errors;
use registry_cache_common::{Error, REGISTRY_CACHE_EXTENSION_TYPE, REGISTRY_SPEGEL_EXTENSION_TYPE};

/// Index and entry of an enabled extension of the given type
fn enabled_extension<'a>(
    shoot: &'a Shoot,
    type_: &str,
) -> Option<(usize, &'a ShootExtension)> {
    shoot
        .spec
        .extensions
        .iter()
        .enumerate()
        .find(|(_, e)| e.type_ == type_)
        .filter(|(_, e)| !e.disabled.unwrap_or(false))
}

/// Re-root a provider-config-relative field path under `spec.extensions[i]`
fn under_extension(err: Error, index: usize) -> Error {
    match err {
        Error::Validation {
            extension,
            message,
            field,
        } => Error::Validation {
            extension,
            message,
            field: Some(match field {
                Some(f) => format!("spec.extensions[{}].{}", index, f),
                None => format!("spec.extensions[{}].providerConfig", index),
            }),
        },
        other => other,
    }
}

/// Every problem with the shoot's `registry-cache` configuration
pub fn registry_cache_shoot_errors(shoot: &Shoot) -> Vec<Error> {
    let Some((index, extension)) = enabled_extension(shoot, REGISTRY_CACHE_EXTENSION_TYPE) else {
        return Vec::new();
    };
    let provider_config_path = format!("spec.extensions[{}].providerConfig", index);

    let Some(raw) = extension.provider_config.as_ref() else {
        return vec![Error::validation_for_field(
            REGISTRY_CACHE_EXTENSION_TYPE,
            provider_config_path,
            "providerConfig is required for the registry-cache extension",
        )];
    };
    let config: RegistryConfig = match serde_json::from_value(raw.clone()) {
        Ok(config) => config,
        Err(e) => {
            return vec![Error::validation_for_field(
                REGISTRY_CACHE_EXTENSION_TYPE,
                provider_config_path,
                format!("failed to decode providerConfig: {}", e),
            )]
        }
    };

    if config.caches.is_empty() {
        return vec![Error::validation_for_field(
            REGISTRY_CACHE_EXTENSION_TYPE,
            format!("{}.caches", provider_config_path),
            "at least one cache must be provided",
        )];
    }

    let mut errors: Vec<Error> = registry_config_errors(&config)
        .into_iter()
        .map(|e| under_extension(e, index))
        .collect();

    for (i, cache) in config.caches.iter().enumerate() {
        let Some(reference) = cache.secret_reference_name.as_deref() else {
            continue;
        };
        if reference.is_empty() {
            continue;
        }
        if let Err(e) = lookup_referenced_secret(shoot, reference) {
            errors.push(Error::validation_for_field(
                REGISTRY_CACHE_EXTENSION_TYPE,
                format!("{}.caches[{}].secretReferenceName", provider_config_path, i),
                e.to_string(),
            ));
        }
    }

    errors
}

/// Every problem with the shoot's `registry-spegel` configuration
pub fn mesh_shoot_errors(shoot: &Shoot) -> Vec<Error> {
    let Some((index, extension)) = enabled_extension(shoot, REGISTRY_SPEGEL_EXTENSION_TYPE) else {
        return Vec::new();
    };
    let mut errors = Vec::new();

    // Pools without an explicit CRI get containerd by default
    for (i, worker) in shoot.spec.provider.workers.iter().enumerate() {
        if let Some(cri) = &worker.cri {
            if cri.name != CRI_CONTAINERD {
                errors.push(Error::validation_for_field(
                    REGISTRY_SPEGEL_EXTENSION_TYPE,
                    format!("spec.provider.workers[{}].cri.name", i),
                    format!(
                        "container runtime of worker {} needs to be containerd when the registry-spegel extension is enabled",
                        worker.name
                    ),
                ));
            }
        }
    }

    let provider_config_path = format!("spec.extensions[{}].providerConfig", index);
    let Some(raw) = extension.provider_config.as_ref() else {
        errors.push(Error::validation_for_field(
            REGISTRY_SPEGEL_EXTENSION_TYPE,
            provider_config_path,
            "providerConfig is required for the registry-spegel extension",
        ));
        return errors;
    };

    match serde_json::from_value::<MirrorMeshConfig>(raw.clone()) {
        Ok(config) => {
            if let Err(e) = config.resolve() {
                errors.push(under_extension(e, index));
            }
        }
        Err(e) => errors.push(Error::validation_for_field(
            REGISTRY_SPEGEL_EXTENSION_TYPE,
            provider_config_path,
            format!("failed to decode providerConfig: {}", e),
        )),
    }

    errors
}

/// Validate the shoot's `registry-cache` configuration
pub fn validate_registry_cache_shoot(shoot: &Shoot) -> Result<(), Error> {
    first_error(registry_cache_shoot_errors(shoot))
}

/// Validate the shoot's `registry-spegel` configuration
pub fn validate_mesh_shoot(shoot: &Shoot) -> Result<(), Error> {
    first_error(mesh_shoot_errors(shoot))
}

fn first_error(errors: Vec<Error>) -> Result<(), Error> {
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
