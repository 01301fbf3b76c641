//! Extension reconciliation controller
//!
//! One controller runs per extension type. Each cycle picks the lifecycle
//! operation from the Extension's state:
//! - deletion timestamp set → `Delete`, then the finalizer is released
//! - `gardener.cloud/operation: restore` → `Restore`
//! - `gardener.cloud/operation: migrate` → `Migrate`
//! - otherwise → `Create` (first time) or `Reconcile`
//!
//! `status.lastOperation` is moved to `Processing` before the actuator runs
//! and to `Succeeded` or `Error` after it. A succeeded Extension at its
//! current generation is reconciled again once its last success is
//! [`RESYNC_INTERVAL`] old, or right away when annotated with
//! `gardener.cloud/operation: reconcile`. Events in between (such as our own
//! status writes) only reschedule that resync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use registry_cache_common::crd::{
    Extension, ExtensionStatus, LastOperation, LastOperationState, LastOperationType,
    OPERATION_MIGRATE, OPERATION_RECONCILE, OPERATION_RESTORE,
};
use registry_cache_common::Error;

use crate::actuator::Actuator;
use crate::client::ClusterClient;

/// Finalizer prefix; the extension type is appended
pub const FINALIZER_PREFIX: &str = "extensions.gardener.cloud";

/// Periodic resync interval for healthy Extensions
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Controller context for one extension type
pub struct Context {
    /// Seed and shoot access
    pub client: Arc<dyn ClusterClient>,
    /// Actuator for [`Context::extension_type`]
    pub actuator: Arc<dyn Actuator>,
    /// Extension type this controller is responsible for
    pub extension_type: String,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Arc<dyn ClusterClient>,
        actuator: Arc<dyn Actuator>,
        extension_type: impl Into<String>,
    ) -> Self {
        Self {
            client,
            actuator,
            extension_type: extension_type.into(),
        }
    }

    /// Finalizer guarding Extensions of this type
    pub fn finalizer(&self) -> String {
        format!("{}/{}", FINALIZER_PREFIX, self.extension_type)
    }
}

/// Pick the lifecycle operation for the Extension's current state
///
/// `gardener.cloud/operation: reconcile` selects `Create` or `Reconcile` like
/// an unannotated Extension; it only forces actuation.
pub fn select_operation(extension: &Extension) -> LastOperationType {
    if extension.meta().deletion_timestamp.is_some() {
        return LastOperationType::Delete;
    }
    match extension.operation_annotation() {
        Some(OPERATION_RESTORE) => LastOperationType::Restore,
        Some(OPERATION_MIGRATE) => LastOperationType::Migrate,
        _ => {
            let has_operation = extension
                .status
                .as_ref()
                .is_some_and(|s| s.last_operation.is_some());
            if has_operation {
                LastOperationType::Reconcile
            } else {
                LastOperationType::Create
            }
        }
    }
}

/// Time left until an unchanged Extension is due for its periodic reconcile
///
/// `None` means it must be actuated now: its current generation was never
/// reconciled successfully, a reconcile was requested through the operation
/// annotation, or the last success is at least [`RESYNC_INTERVAL`] old.
pub fn time_until_resync(extension: &Extension, now: DateTime<Utc>) -> Option<Duration> {
    if extension.operation_annotation() == Some(OPERATION_RECONCILE) {
        return None;
    }
    let status = extension.status.as_ref()?;
    let last = status.last_operation.as_ref()?;
    let observed = status.observed_generation;
    if observed.is_none()
        || observed != extension.meta().generation
        || last.state != LastOperationState::Succeeded
    {
        return None;
    }
    // A timestamp from the future counts as a success just now
    let age = (now - last.last_update_time).to_std().unwrap_or_default();
    RESYNC_INTERVAL
        .checked_sub(age)
        .filter(|left| !left.is_zero())
}

/// Reconcile an Extension of the context's type
pub async fn reconcile(extension: Arc<Extension>, ctx: Arc<Context>) -> Result<Action, Error> {
    if extension.spec.type_ != ctx.extension_type {
        return Ok(Action::await_change());
    }

    let name = extension.name_any();
    let namespace = extension.namespace().ok_or_else(|| {
        Error::validation_for(name.clone(), "Extension must be namespaced")
    })?;
    let finalizer = ctx.finalizer();
    let operation = select_operation(&extension);

    if operation == LastOperationType::Delete {
        if !extension.finalizers().iter().any(|f| *f == finalizer) {
            return Ok(Action::await_change());
        }
    } else {
        if operation == LastOperationType::Reconcile {
            if let Some(left) = time_until_resync(&extension, Utc::now()) {
                debug!(extension = %extension.key(), resync_in = ?left, "extension is up to date");
                return Ok(Action::requeue(left));
            }
        }
        ctx.client
            .add_finalizer(&namespace, &name, &finalizer)
            .await?;
    }

    info!(extension = %extension.key(), operation = %operation, "running extension operation");
    record_operation(
        &ctx,
        &extension,
        operation,
        LastOperationState::Processing,
        format!("{} of extension is in progress", operation),
    )
    .await?;

    let result = match operation {
        LastOperationType::Create | LastOperationType::Reconcile => {
            ctx.actuator.reconcile(&extension).await
        }
        LastOperationType::Delete => ctx.actuator.delete(&extension).await,
        LastOperationType::Restore => ctx.actuator.restore(&extension).await,
        LastOperationType::Migrate => ctx.actuator.migrate(&extension).await,
    };

    if let Err(e) = result {
        if let Err(patch_err) = record_operation(
            &ctx,
            &extension,
            operation,
            LastOperationState::Error,
            e.to_string(),
        )
        .await
        {
            warn!(
                extension = %extension.key(),
                error = %patch_err,
                "failed to record failed operation in status"
            );
        }
        return Err(e);
    }

    record_operation(
        &ctx,
        &extension,
        operation,
        LastOperationState::Succeeded,
        format!("{} of extension succeeded", operation),
    )
    .await?;

    match operation {
        LastOperationType::Delete => {
            ctx.client
                .remove_finalizer(&namespace, &name, &finalizer)
                .await?;
            info!(extension = %extension.key(), "extension deleted, finalizer released");
            Ok(Action::await_change())
        }
        LastOperationType::Restore | LastOperationType::Migrate => {
            ctx.client
                .remove_operation_annotation(&namespace, &name)
                .await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        LastOperationType::Create | LastOperationType::Reconcile => {
            if extension.operation_annotation() == Some(OPERATION_RECONCILE) {
                ctx.client
                    .remove_operation_annotation(&namespace, &name)
                    .await?;
            }
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
    }
}

async fn record_operation(
    ctx: &Context,
    extension: &Extension,
    type_: LastOperationType,
    state: LastOperationState,
    description: String,
) -> Result<(), Error> {
    let namespace = extension.namespace().unwrap_or_default();
    let observed_generation = match state {
        LastOperationState::Succeeded => extension.meta().generation,
        _ => None,
    };
    ctx.client
        .patch_extension_status(
            &namespace,
            &extension.name_any(),
            &ExtensionStatus {
                last_operation: Some(LastOperation::new(type_, state, description)),
                observed_generation,
                ..Default::default()
            },
        )
        .await
}

/// Requeue delay after a failed cycle
pub fn requeue_delay(error: &Error) -> Duration {
    if error.is_teardown_timeout() {
        Duration::from_secs(10)
    } else if error.is_retryable() {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(300)
    }
}

/// Error policy for the extension controllers
///
/// Teardown timeouts retry quickly, transient errors after 30 seconds and
/// configuration errors only every five minutes (or on the next change).
pub fn error_policy(extension: Arc<Extension>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(extension = %extension.key(), error = %error, "extension reconcile failed, will retry");
    } else {
        error!(extension = %extension.key(), error = %error, "extension reconcile failed permanently");
    }
    Action::requeue(requeue_delay(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockActuator;
    use crate::client::MockClusterClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use registry_cache_common::crd::{ExtensionSpec, OPERATION_ANNOTATION};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const TYPE: &str = "registry-cache";

    /// Captured status patches for verification
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<ExtensionStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: ExtensionStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn states(&self) -> Vec<(LastOperationType, LastOperationState)> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .iter()
                .filter_map(|s| s.last_operation.as_ref())
                .map(|op| (op.type_, op.state))
                .collect()
        }

        fn last(&self) -> Option<ExtensionStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }
    }

    fn extension() -> Extension {
        Extension {
            metadata: ObjectMeta {
                name: Some("registry-cache".to_string()),
                namespace: Some("shoot--dev--a".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec: ExtensionSpec {
                type_: TYPE.to_string(),
                provider_config: None,
            },
            status: None,
        }
    }

    fn with_finalizer(mut ext: Extension) -> Extension {
        ext.metadata.finalizers = Some(vec![format!("{}/{}", FINALIZER_PREFIX, TYPE)]);
        ext
    }

    fn with_annotation(mut ext: Extension, value: &str) -> Extension {
        ext.metadata.annotations = Some(BTreeMap::from([(
            OPERATION_ANNOTATION.to_string(),
            value.to_string(),
        )]));
        ext
    }

    fn deleting(ext: Extension) -> Extension {
        let mut ext = with_finalizer(ext);
        ext.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        ext
    }

    fn succeeded(ext: Extension, generation: i64) -> Extension {
        succeeded_at(ext, generation, chrono::Utc::now())
    }

    fn succeeded_at(mut ext: Extension, generation: i64, at: DateTime<Utc>) -> Extension {
        let mut last_operation = LastOperation::new(
            LastOperationType::Reconcile,
            LastOperationState::Succeeded,
            "done",
        );
        last_operation.last_update_time = at;
        ext.status = Some(ExtensionStatus {
            last_operation: Some(last_operation),
            observed_generation: Some(generation),
            provider_status: None,
        });
        ext
    }

    fn client_with_capture() -> (MockClusterClient, StatusCapture) {
        let capture = StatusCapture::default();
        let c = capture.clone();
        let mut client = MockClusterClient::new();
        client
            .expect_patch_extension_status()
            .returning(move |_, _, status| {
                c.record(status.clone());
                Ok(())
            });
        client.expect_add_finalizer().returning(|_, _, _| Ok(()));
        (client, capture)
    }

    fn context(client: MockClusterClient, actuator: MockActuator) -> Arc<Context> {
        Arc::new(Context::new(Arc::new(client), Arc::new(actuator), TYPE))
    }

    #[test]
    fn operation_selection() {
        assert_eq!(select_operation(&extension()), LastOperationType::Create);
        assert_eq!(
            select_operation(&succeeded(extension(), 1)),
            LastOperationType::Reconcile
        );
        assert_eq!(
            select_operation(&with_annotation(extension(), "restore")),
            LastOperationType::Restore
        );
        assert_eq!(
            select_operation(&with_annotation(extension(), "migrate")),
            LastOperationType::Migrate
        );
        // Deletion wins over annotations
        assert_eq!(
            select_operation(&deleting(with_annotation(extension(), "restore"))),
            LastOperationType::Delete
        );
    }

    #[tokio::test]
    async fn first_reconcile_is_a_create_and_records_generation() {
        let (client, capture) = client_with_capture();
        let mut actuator = MockActuator::new();
        actuator.expect_reconcile().times(1).returning(|_| Ok(()));

        let action = reconcile(Arc::new(extension()), context(client, actuator))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(
            capture.states(),
            vec![
                (LastOperationType::Create, LastOperationState::Processing),
                (LastOperationType::Create, LastOperationState::Succeeded),
            ]
        );
        assert_eq!(capture.last().unwrap().observed_generation, Some(3));
    }

    #[tokio::test]
    async fn failed_actuation_records_error_and_propagates() {
        let (client, capture) = client_with_capture();
        let mut actuator = MockActuator::new();
        actuator
            .expect_reconcile()
            .returning(|_| Err(Error::consistency("status", "services missing")));

        let err = reconcile(Arc::new(succeeded(extension(), 2)), context(client, actuator))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Consistency { .. }));
        let last = capture.last().unwrap();
        let op = last.last_operation.unwrap();
        assert_eq!(op.state, LastOperationState::Error);
        assert!(op.description.contains("services missing"));
        assert_eq!(last.observed_generation, None);
    }

    #[test]
    fn resync_is_due_once_the_last_success_is_old_enough() {
        let at = chrono::Utc::now();
        let ext = succeeded_at(extension(), 3, at);

        assert_eq!(
            time_until_resync(&ext, at + chrono::Duration::minutes(4)),
            Some(Duration::from_secs(360))
        );
        assert_eq!(time_until_resync(&ext, at), Some(RESYNC_INTERVAL));
        assert_eq!(
            time_until_resync(&ext, at - chrono::Duration::minutes(1)),
            Some(RESYNC_INTERVAL)
        );
        assert_eq!(time_until_resync(&ext, at + chrono::Duration::minutes(10)), None);
        assert_eq!(time_until_resync(&ext, at + chrono::Duration::hours(2)), None);
    }

    #[test]
    fn resync_is_due_immediately_when_not_settled() {
        let at = chrono::Utc::now();
        // Never reconciled
        assert_eq!(time_until_resync(&extension(), at), None);
        // Spec changed since the last success
        assert_eq!(time_until_resync(&succeeded_at(extension(), 2, at), at), None);
        // Explicit reconcile request
        assert_eq!(
            time_until_resync(&with_annotation(succeeded_at(extension(), 3, at), "reconcile"), at),
            None
        );
        // Last attempt failed
        let mut failed = succeeded_at(extension(), 3, at);
        if let Some(op) = failed
            .status
            .as_mut()
            .and_then(|s| s.last_operation.as_mut())
        {
            op.state = LastOperationState::Error;
        }
        assert_eq!(time_until_resync(&failed, at), None);
    }

    #[tokio::test]
    async fn event_right_after_success_only_reschedules() {
        let client = MockClusterClient::new();
        let mut actuator = MockActuator::new();
        actuator.expect_reconcile().never();

        let action = reconcile(
            Arc::new(with_finalizer(succeeded(extension(), 3))),
            context(client, actuator),
        )
        .await
        .unwrap();
        assert_ne!(action, Action::await_change());
    }

    #[tokio::test]
    async fn periodic_resync_actuates_unchanged_extension() {
        let (mut client, capture) = client_with_capture();
        client.expect_remove_operation_annotation().never();
        let mut actuator = MockActuator::new();
        actuator.expect_reconcile().times(1).returning(|_| Ok(()));

        let last_success = chrono::Utc::now() - chrono::Duration::minutes(11);
        let action = reconcile(
            Arc::new(with_finalizer(succeeded_at(extension(), 3, last_success))),
            context(client, actuator),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(
            capture.states(),
            vec![
                (LastOperationType::Reconcile, LastOperationState::Processing),
                (LastOperationType::Reconcile, LastOperationState::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_annotation_is_actuated_and_cleared() {
        let (mut client, capture) = client_with_capture();
        client
            .expect_remove_operation_annotation()
            .withf(|ns, name| ns == "shoot--dev--a" && name == "registry-cache")
            .times(1)
            .returning(|_, _| Ok(()));
        let mut actuator = MockActuator::new();
        actuator.expect_reconcile().times(1).returning(|_| Ok(()));

        let ext = with_annotation(with_finalizer(succeeded(extension(), 3)), "reconcile");
        assert_eq!(select_operation(&ext), LastOperationType::Reconcile);

        let action = reconcile(Arc::new(ext), context(client, actuator))
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(
            capture.states().last(),
            Some(&(LastOperationType::Reconcile, LastOperationState::Succeeded))
        );
    }

    #[tokio::test]
    async fn failed_error_record_keeps_actuation_error() {
        let mut client = MockClusterClient::new();
        client.expect_add_finalizer().returning(|_, _, _| Ok(()));
        client
            .expect_patch_extension_status()
            .returning(|_, _, status| {
                match status.last_operation.as_ref().map(|op| op.state) {
                    Some(LastOperationState::Error) => Err(Error::internal_with_context(
                        "status",
                        "conflict while patching status",
                    )),
                    _ => Ok(()),
                }
            });
        let mut actuator = MockActuator::new();
        actuator
            .expect_reconcile()
            .returning(|_| Err(Error::validation("bad upstream")));

        let err = reconcile(Arc::new(extension()), context(client, actuator))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(requeue_delay(&err), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn other_extension_types_are_ignored() {
        let mut ext = extension();
        ext.spec.type_ = "registry-spegel".to_string();

        let action = reconcile(
            Arc::new(ext),
            context(MockClusterClient::new(), MockActuator::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn delete_releases_finalizer_after_actuation() {
        let (mut client, capture) = client_with_capture();
        client
            .expect_remove_finalizer()
            .withf(|_, _, f| f == "extensions.gardener.cloud/registry-cache")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut actuator = MockActuator::new();
        actuator.expect_delete().times(1).returning(|_| Ok(()));

        let action = reconcile(Arc::new(deleting(extension())), context(client, actuator))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(
            capture.states().last(),
            Some(&(LastOperationType::Delete, LastOperationState::Succeeded))
        );
    }

    #[tokio::test]
    async fn delete_timeout_keeps_finalizer() {
        let (mut client, _capture) = client_with_capture();
        client.expect_remove_finalizer().never();
        let mut actuator = MockActuator::new();
        actuator.expect_delete().returning(|_| {
            Err(Error::teardown_timeout(
                "ManagedResource shoot--dev--a/extension-registry-cache",
                Duration::from_secs(120),
            ))
        });

        let err = reconcile(Arc::new(deleting(extension())), context(client, actuator))
            .await
            .unwrap_err();
        assert!(err.is_teardown_timeout());
        assert_eq!(requeue_delay(&err), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn restore_runs_and_clears_annotation() {
        let (mut client, capture) = client_with_capture();
        client
            .expect_remove_operation_annotation()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut actuator = MockActuator::new();
        actuator.expect_restore().times(1).returning(|_| Ok(()));

        reconcile(
            Arc::new(with_annotation(succeeded(extension(), 3), "restore")),
            context(client, actuator),
        )
        .await
        .unwrap();
        assert_eq!(
            capture.states().last(),
            Some(&(LastOperationType::Restore, LastOperationState::Succeeded))
        );
    }

    #[test]
    fn requeue_delay_by_error_class() {
        assert_eq!(
            requeue_delay(&Error::consistency("status", "not yet")),
            Duration::from_secs(30)
        );
        assert_eq!(
            requeue_delay(&Error::validation("bad upstream")),
            Duration::from_secs(300)
        );
    }
}
