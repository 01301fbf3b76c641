//! Upstream registry naming
//!
//! Everything derived from an upstream string lives here so the synthesizer,
//! the status publisher and the node ensurer agree on names, labels and URLs.

/// Docker Hub alias as users write it
pub const DOCKER_HUB_ALIAS: &str = "docker.io";

/// Host actually serving the Docker Hub registry API
pub const DOCKER_HUB_BACKEND: &str = "registry-1.docker.io";

/// Prefix of every per-upstream cache object name
pub const CACHE_NAME_PREFIX: &str = "cache-";

/// Longest object name or label value Kubernetes accepts
pub const MAX_NAME_LENGTH: usize = 63;

/// Strip the port from an upstream (`host[:port]`).
pub fn upstream_host(upstream: &str) -> &str {
    upstream.split(':').next().unwrap_or(upstream)
}

/// Normalize an upstream into a DNS-label friendly fragment.
///
/// Strips the port, lower-cases and replaces `.` with `-`:
/// `Registry.K8s.io:443` becomes `registry-k8s-io`.
pub fn normalize_upstream(upstream: &str) -> String {
    upstream_host(upstream).to_lowercase().replace('.', "-")
}

/// Deterministic object name for the cache serving `upstream`
pub fn cache_name(upstream: &str) -> String {
    format!("{}{}", CACHE_NAME_PREFIX, normalize_upstream(upstream))
}

/// Value of the upstream discriminator label for `upstream`.
///
/// Label values may not contain `:`, so a port separator becomes `-`.
pub fn upstream_label_value(upstream: &str) -> String {
    upstream.replace(':', "-")
}

/// The URL the cache proxies to (and the `server` containerd falls back to)
pub fn upstream_url(upstream: &str) -> String {
    let host = if upstream == DOCKER_HUB_ALIAS {
        DOCKER_HUB_BACKEND
    } else {
        upstream
    };
    format!("https://{}", host)
}

/// Check that an upstream is a bare `host[:port]`.
///
/// Rejects schemes, paths, empty hosts and non-numeric ports, and upstreams
/// whose cache name or label value would exceed [`MAX_NAME_LENGTH`].
pub fn validate_upstream(upstream: &str) -> Result<(), String> {
    if upstream.is_empty() {
        return Err("upstream must not be empty".to_string());
    }
    if upstream.contains("://") {
        return Err(format!("upstream {} must not include a scheme", upstream));
    }
    if upstream.contains('/') {
        return Err(format!("upstream {} must not include a path", upstream));
    }

    let mut parts = upstream.splitn(2, ':');
    let host = parts.next().unwrap_or_default();
    if host.is_empty() {
        return Err(format!("upstream {} has an empty host", upstream));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("upstream {} has an invalid host", upstream));
    }
    if host.starts_with('.') || host.ends_with('.') || host.starts_with('-') {
        return Err(format!("upstream {} has an invalid host", upstream));
    }
    if let Some(port) = parts.next() {
        if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return Err(format!("upstream {} has an invalid port", upstream));
        }
    }

    let name = cache_name(upstream);
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "upstream {} yields cache name {} longer than {} characters",
            upstream, name, MAX_NAME_LENGTH
        ));
    }
    if upstream_label_value(upstream).len() > MAX_NAME_LENGTH {
        return Err(format!(
            "upstream {} is longer than {} characters",
            upstream, MAX_NAME_LENGTH
        ));
    }
    Ok(())
}
