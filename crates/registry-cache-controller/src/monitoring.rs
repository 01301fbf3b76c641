//! Monitoring side-configuration
//!
//! ConfigMaps picked up by the control plane's Prometheus and dashboard
//! tooling: one scrape job per cache plus a dashboard for the fleet, and a
//! node-exporter scrape job for the mirror mesh.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use registry_cache_common::crd::DesiredCache;
use registry_cache_common::{Error, REGISTRY_CACHE_NAMESPACE};

/// Name of the cache fleet's monitoring ConfigMap
pub const CACHE_MONITORING_CONFIG_MAP: &str = "registry-cache-config-prometheus";
/// Name of the mirror mesh's monitoring ConfigMap
pub const MESH_MONITORING_CONFIG_MAP: &str = "registry-spegel-config-prometheus";

const KUBE_APISERVER: &str = "kube-apiserver:443";
const CA_FILE: &str = "/etc/prometheus/seed/ca.crt";
const TOKEN_FILE: &str = "/var/run/secrets/gardener.cloud/shoot/token/token";
const METRICS_PORT_NAME: &str = "registry-cache";

/// Build the cache fleet's scrape config and dashboard
pub fn build_cache_monitoring(
    namespace: &str,
    caches: &[DesiredCache],
) -> Result<ConfigMap, Error> {
    let jobs: Vec<serde_json::Value> = caches
        .iter()
        .map(|cache| cache_scrape_job(&cache.name()))
        .collect();
    let scrape_config = to_yaml(&jobs)?;

    let dashboard = serde_json::to_string(&cache_dashboard())?;
    let dashboards = to_yaml(&BTreeMap::from([("registry-cache-dashboard.json", dashboard)]))?;

    Ok(config_map(
        CACHE_MONITORING_CONFIG_MAP,
        namespace,
        "registry-cache",
        BTreeMap::from([
            ("scrape_config".to_string(), scrape_config),
            ("dashboard_operators".to_string(), dashboards),
        ]),
    ))
}

/// Build the mirror mesh's scrape config
///
/// The mesh daemon's metrics reach Prometheus through the node-exporter
/// textfile collector, so the job scrapes node-exporter endpoints.
pub fn build_mesh_monitoring(namespace: &str) -> Result<ConfigMap, Error> {
    let job = json!({
        "job_name": "registry-spegel-metrics",
        "scheme": "https",
        "honor_labels": false,
        "scrape_timeout": "10s",
        "tls_config": {"insecure_skip_verify": true},
        "authorization": {"type": "Bearer", "credentials_file": TOKEN_FILE},
        "kubernetes_sd_configs": [{
            "role": "endpoints",
            "api_server": format!("https://{}", KUBE_APISERVER),
            "namespaces": {"names": ["kube-system"]},
            "tls_config": {"insecure_skip_verify": true},
            "authorization": {"type": "Bearer", "credentials_file": TOKEN_FILE},
        }],
        "relabel_configs": [
            {"source_labels": ["__meta_kubernetes_service_name", "__meta_kubernetes_endpoint_port_name"],
             "regex": "node-exporter;metrics", "action": "keep"},
            {"action": "labelmap", "regex": "__meta_kubernetes_service_label_(.+)"},
            {"source_labels": ["__meta_kubernetes_pod_name"], "target_label": "pod"},
            {"source_labels": ["__meta_kubernetes_pod_node_name"], "target_label": "node"},
            {"target_label": "__address__", "replacement": KUBE_APISERVER},
            {"source_labels": ["__meta_kubernetes_pod_name", "__meta_kubernetes_pod_container_port_number"],
             "regex": "(.+);(.+)", "target_label": "__metrics_path__",
             "replacement": "/api/v1/namespaces/kube-system/pods/${1}:${2}/proxy/metrics"},
        ],
        "metric_relabel_configs": [
            {"source_labels": ["__name__"], "regex": "spegel_.+|http_requests_.+|http_response_.+", "action": "keep"},
        ],
    });

    Ok(config_map(
        MESH_MONITORING_CONFIG_MAP,
        namespace,
        "registry-spegel",
        BTreeMap::from([("scrape_config".to_string(), to_yaml(&vec![job])?)]),
    ))
}

fn cache_scrape_job(name: &str) -> serde_json::Value {
    json!({
        "job_name": format!("{}-metrics", name),
        "scheme": "https",
        "tls_config": {"ca_file": CA_FILE},
        "authorization": {"type": "Bearer", "credentials_file": TOKEN_FILE},
        "honor_labels": false,
        "kubernetes_sd_configs": [{
            "role": "endpoints",
            "api_server": format!("https://{}", KUBE_APISERVER),
            "namespaces": {"names": [REGISTRY_CACHE_NAMESPACE]},
            "tls_config": {"ca_file": CA_FILE},
            "authorization": {"type": "Bearer", "credentials_file": TOKEN_FILE},
        }],
        "relabel_configs": [
            {"source_labels": ["__meta_kubernetes_service_name", "__meta_kubernetes_endpoint_port_name"],
             "regex": format!("{};{}", name, METRICS_PORT_NAME), "action": "keep"},
            {"action": "labelmap", "regex": "__meta_kubernetes_service_label_(.+)"},
            {"target_label": "__address__", "replacement": KUBE_APISERVER},
            {"source_labels": ["__meta_kubernetes_endpoint_node_name"], "target_label": "node"},
            {"source_labels": ["__meta_kubernetes_pod_name"], "target_label": "pod"},
            {"source_labels": ["__meta_kubernetes_pod_name", "__meta_kubernetes_pod_container_port_number"],
             "regex": "(.+);(.+)", "target_label": "__metrics_path__",
             "replacement": format!("/api/v1/namespaces/{}/pods/${{1}}:${{2}}/proxy/metrics", REGISTRY_CACHE_NAMESPACE)},
        ],
        "metric_relabel_configs": [
            {"source_labels": ["__name__"], "regex": "registry_proxy_.+", "action": "keep"},
        ],
    })
}

fn cache_dashboard() -> serde_json::Value {
    let panel = |id: u32, title: &str, expr: &str, y: u32| {
        json!({
            "id": id,
            "title": title,
            "type": "graph",
            "datasource": "prometheus",
            "gridPos": {"h": 8, "w": 24, "x": 0, "y": y},
            "targets": [{"expr": expr, "legendFormat": "{{upstream_host}}", "refId": "A"}],
        })
    };

    json!({
        "editable": true,
        "panels": [
            panel(1, "Blob pulls", "sum by (upstream_host) (rate(registry_proxy_blobs_requests_total[5m]))", 0),
            panel(2, "Blob hit ratio", "sum by (upstream_host) (rate(registry_proxy_blobs_hits_total[5m])) / sum by (upstream_host) (rate(registry_proxy_blobs_requests_total[5m]))", 8),
            panel(3, "Manifest pulls", "sum by (upstream_host) (rate(registry_proxy_manifests_requests_total[5m]))", 16),
        ],
        "schemaVersion": 27,
        "time": {"from": "now-1h", "to": "now"},
        "timezone": "utc",
        "title": "Registry Proxy Cache",
        "uid": "extension-registry-cache",
        "version": 1,
    })
}

fn config_map(
    name: &str,
    namespace: &str,
    component: &str,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                ("component".to_string(), component.to_string()),
                (
                    "extensions.gardener.cloud/configuration".to_string(),
                    "monitoring".to_string(),
                ),
            ])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn to_yaml<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(upstream: &str) -> DesiredCache {
        DesiredCache {
            upstream: upstream.to_string(),
            volume_size: "10Gi".to_string(),
            garbage_collection_enabled: true,
            secret_reference_name: None,
        }
    }

    #[test]
    fn one_scrape_job_per_cache() {
        let cm = build_cache_monitoring(
            "shoot--dev--a",
            &[desired("docker.io"), desired("quay.io")],
        )
        .unwrap();
        let data = cm.data.unwrap();

        let jobs: Vec<serde_json::Value> = serde_yaml::from_str(&data["scrape_config"]).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["job_name"], "cache-docker-io-metrics");
        assert_eq!(jobs[1]["job_name"], "cache-quay-io-metrics");
        assert_eq!(
            jobs[1]["relabel_configs"][0]["regex"],
            "cache-quay-io;registry-cache"
        );
        assert!(data["dashboard_operators"].contains("registry-cache-dashboard.json"));
    }

    #[test]
    fn monitoring_labels_are_set() {
        let cm = build_cache_monitoring("shoot--dev--a", &[desired("docker.io")]).unwrap();
        let labels = cm.metadata.labels.unwrap();
        assert_eq!(labels["component"], "registry-cache");
        assert_eq!(labels["extensions.gardener.cloud/configuration"], "monitoring");
        assert_eq!(cm.metadata.name.as_deref(), Some(CACHE_MONITORING_CONFIG_MAP));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("shoot--dev--a"));
    }

    #[test]
    fn mesh_scrapes_node_exporter() {
        let cm = build_mesh_monitoring("shoot--dev--a").unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some(MESH_MONITORING_CONFIG_MAP));
        let data = cm.data.unwrap();
        assert!(data["scrape_config"].contains("node-exporter;metrics"));
        assert_eq!(cm.metadata.labels.unwrap()["component"], "registry-spegel");
    }
}
