//! Status publication
//!
//! Pairs every desired cache with its realized Service and produces the
//! ordered `ProvisionedCache` list. Either every cache resolves to an endpoint
//! or nothing is returned.

use k8s_openapi::api::core::v1::Service;

use registry_cache_common::crd::{DesiredCache, ProvisionedCache, RegistryStatus};
use registry_cache_common::upstream::upstream_label_value;
use registry_cache_common::{Error, UPSTREAM_ANNOTATION, UPSTREAM_LABEL};

/// Resolve endpoints for every desired cache, in desired order
///
/// Fails without a partial result when the service count differs from the
/// desired count, when a cache has no service, or when a service has no
/// cluster IP or port yet.
pub fn collect_provisioned_caches(
    desired: &[DesiredCache],
    services: &[Service],
) -> Result<RegistryStatus, Error> {
    if services.len() != desired.len() {
        return Err(Error::consistency(
            "status",
            format!(
                "not all services for all configured caches exist: expected {}, found {}",
                desired.len(),
                services.len()
            ),
        ));
    }

    let caches = desired
        .iter()
        .map(|cache| {
            let service = find_service(services, &cache.upstream).ok_or_else(|| {
                Error::consistency(
                    "status",
                    format!("no service found for upstream {}", cache.upstream),
                )
            })?;
            Ok(ProvisionedCache {
                upstream: cache.upstream.clone(),
                endpoint: service_endpoint(service, &cache.upstream)?,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(RegistryStatus { caches })
}

/// Find the service serving `upstream`
///
/// The raw upstream annotation is authoritative; the label is the fallback
/// for objects created without it.
fn find_service<'a>(services: &'a [Service], upstream: &str) -> Option<&'a Service> {
    let label = upstream_label_value(upstream);
    services
        .iter()
        .find(|svc| {
            svc.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(UPSTREAM_ANNOTATION))
                .is_some_and(|v| v == upstream)
        })
        .or_else(|| {
            services.iter().find(|svc| {
                svc.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(UPSTREAM_LABEL))
                    .is_some_and(|v| *v == label)
            })
        })
}

fn service_endpoint(service: &Service, upstream: &str) -> Result<String, Error> {
    let spec = service.spec.as_ref();
    let cluster_ip = spec
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .ok_or_else(|| {
            Error::consistency(
                "status",
                format!("service for upstream {} has no cluster IP yet", upstream),
            )
        })?;
    let port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.port)
        .ok_or_else(|| {
            Error::consistency(
                "status",
                format!("service for upstream {} exposes no port", upstream),
            )
        })?;
    Ok(format!("{}:{}", cluster_ip, port))
}
