//! Kubernetes helpers shared by the controller and webhook crates

use std::future::Future;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)`. Errors from the
/// check are logged and retried. On timeout returns an internal error carrying
/// `timeout_msg`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let timeout_msg = timeout_msg.into();
    poll(timeout, poll_interval, check_fn)
        .await
        .map_err(|_| Error::internal_with_context("poll_until", timeout_msg))
}

/// Poll until `exists_fn` reports the resource gone
///
/// Unlike [`poll_until`] an elapsed wait is reported as
/// [`Error::TeardownTimeout`] so callers can tell it apart from I/O failures.
pub async fn wait_until_deleted<F, Fut>(
    resource: impl Into<String>,
    timeout: Duration,
    poll_interval: Duration,
    mut exists_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let resource = resource.into();
    poll(timeout, poll_interval, || {
        let fut = exists_fn();
        async move { fut.await.map(|exists| !exists) }
    })
    .await
    .map_err(|_| Error::teardown_timeout(resource, timeout))
}

struct Elapsed;

async fn poll<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    mut check_fn: F,
) -> Result<(), Elapsed>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!("Polling condition not yet met, retrying...");
            }
            Err(e) => {
                // Polling failures are expected while resources converge
                trace!("Polling check returned error (retrying): {}", e);
            }
        }

        if start.elapsed() >= timeout {
            return Err(Elapsed);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Build a client from an in-memory kubeconfig document
///
/// Used for the shoot cluster, whose kubeconfig lives in a secret of the
/// control plane namespace.
pub async fn client_from_kubeconfig_yaml(kubeconfig: &str) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to parse kubeconfig: {}", e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "client_from_kubeconfig",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "client_from_kubeconfig",
            format!("failed to create client: {}", e),
        )
    })
}
