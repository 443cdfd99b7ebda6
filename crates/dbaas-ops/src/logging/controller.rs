//! Facilities for reporting Kubernetes controller outcomes
//!
//! The primary entry point is [`report_controller_reconciled`].

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use super::k8s_events::{EventRecorder, error_to_event};

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// A reference to a secondary object providing additional context, if any
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Reports the controller reconciliation result to all relevant targets
///
/// Successes are logged. Failures are logged and, when they happened while reconciling a
/// specific object, published as a Warning event on that object.
pub async fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    recorder: &dyn EventRecorder,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    K::DynamicType: Clone,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: std::error::Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
            if let controller::Error::ReconcilerFailed(err, obj) = err {
                let mut event = error_to_event(err);
                if let Some(secondary) = err.secondary_object() {
                    event.note = format!("{} (while handling {secondary})", event.note);
                }
                let reference = obj.clone().erase().into();
                recorder.publish(&reference, event).await;
            }
        }
    }
}
