//! Utilities for publishing Kubernetes events

use std::error::Error;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};

use super::controller::ReconcilerError;

/// Maximum size of an event note in bytes.
const MAX_NOTE_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum OpsEventType {
    Normal,
    Warning,
}

/// An event about an operation, published on the OpsRequest or the Cluster it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpsEvent {
    pub type_: OpsEventType,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl OpsEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self::new(OpsEventType::Normal, reason, note)
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self::new(OpsEventType::Warning, reason, note)
    }

    fn new(type_: OpsEventType, reason: impl Into<String>, note: impl Into<String>) -> Self {
        let mut note = note.into();
        message::truncate_with_ellipsis(&mut note, MAX_NOTE_LEN);
        Self {
            type_,
            reason: reason.into(),
            note,
            action: "Reconcile".to_owned(),
        }
    }
}

/// Publishes events. Failing to publish is logged and never fails the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, target: &ObjectReference, event: OpsEvent);
}

/// An [`EventRecorder`] writing `events.k8s.io` events through the API server.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            recorder: Recorder::new(
                client,
                Reporter {
                    controller: controller.to_owned(),
                    instance: None,
                },
            ),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, target: &ObjectReference, event: OpsEvent) {
        let event = Event {
            type_: match event.type_ {
                OpsEventType::Normal => EventType::Normal,
                OpsEventType::Warning => EventType::Warning,
            },
            reason: event.reason,
            note: Some(event.note),
            action: event.action,
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, target).await {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                object.name = target.name.as_deref(),
                "Failed to publish K8s event"
            );
        }
    }
}

/// Converts an error into a publishable [`OpsEvent`]
pub fn error_to_event<E: ReconcilerError>(err: &E) -> OpsEvent {
    // Walk the whole error chain, so that we get all the full reason for the error
    let mut full_msg = err.to_string();
    let mut source: Option<&dyn Error> = err.source();
    while let Some(err) = source {
        full_msg.push_str(": ");
        full_msg.push_str(&err.to_string());
        source = err.source();
    }
    OpsEvent::warning(err.category(), full_msg)
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        let len = msg.len();
        if len > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        loop {
            if s.is_char_boundary(pos) {
                break pos;
            }
            pos -= 1;
        }
    }

}
