//! Per-object progress of an operation.

use std::fmt;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};

use crate::{
    crd::{ProgressDetail, ProgressStatus},
    logging::k8s_events::OpsEvent,
};

/// Key of a progress detail, e.g. `Pod/mycluster-mysql-0`.
pub fn object_key(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

pub fn processing_message(verb: &str, object_key: &str, component: &str) -> String {
    format!("Start to {verb}: {object_key} in Component: {component}")
}

pub fn succeed_message(verb: &str, object_key: &str, component: &str) -> String {
    format!("Successfully {verb}: {object_key} in Component: {component}")
}

pub fn failed_message(verb: &str, object_key: &str, component: &str, message: &str) -> String {
    format!("Failed to {verb}: {object_key} in Component: {component}, message: {message}")
}

pub fn find_progress_detail<'a>(
    details: &'a [ProgressDetail],
    object_key: &str,
) -> Option<&'a ProgressDetail> {
    details.iter().find(|detail| detail.object_key == object_key)
}

/// Upserts `new` into `details` by object key.
///
/// A failed object keeps its status until it succeeds. Start and end times are stamped on the
/// first transition to Processing and to a terminal status respectively. Returns the event
/// describing the transition, if the detail changed and is not Pending.
pub fn set_progress_detail(
    details: &mut Vec<ProgressDetail>,
    mut new: ProgressDetail,
    now: Timestamp,
) -> Option<OpsEvent> {
    let Some(existing) = details
        .iter_mut()
        .find(|detail| detail.object_key == new.object_key)
    else {
        stamp_times(&mut new, now);
        let event = progress_event(&new);
        details.push(new);
        return event;
    };

    if existing.status == new.status
        || (existing.status == ProgressStatus::Failed && new.status != ProgressStatus::Succeed)
    {
        return None;
    }
    existing.status = new.status;
    existing.message = new.message;
    if new.group.is_some() {
        existing.group = new.group;
    }
    stamp_times(existing, now);
    progress_event(existing)
}

fn stamp_times(detail: &mut ProgressDetail, now: Timestamp) {
    if detail.status == ProgressStatus::Processing && detail.start_time.is_none() {
        detail.start_time = Some(Time(now));
    }
    if detail.status.is_terminal() && detail.end_time.is_none() {
        detail.end_time = Some(Time(now));
    }
}

fn progress_event(detail: &ProgressDetail) -> Option<OpsEvent> {
    let note = detail.message.clone().unwrap_or_default();
    match detail.status {
        ProgressStatus::Pending => None,
        ProgressStatus::Processing => Some(OpsEvent::normal("Processing", note)),
        ProgressStatus::Succeed => Some(OpsEvent::normal("Succeed", note)),
        ProgressStatus::Failed => Some(OpsEvent::warning("Failed", note)),
    }
}

/// Succeeded and expected object counts, rendered as `succeeded/expected`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub succeed: i32,
    pub expected: i32,
}

impl Progress {
    pub fn new(succeed: i32, expected: i32) -> Self {
        Self { succeed, expected }
    }

    pub fn is_complete(self) -> bool {
        self.succeed == self.expected
    }
}

impl std::ops::Add for Progress {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            succeed: self.succeed + rhs.succeed,
            expected: self.expected + rhs.expected,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.succeed, self.expected)
    }
}

/// Counts succeeded details against the declared number of affected objects.
///
/// `expected` comes from the declared replica or volume count rather than from the details, so
/// objects that do not exist yet still count as outstanding.
pub fn aggregate(details: &[ProgressDetail], expected: i32) -> Progress {
    let succeed = details
        .iter()
        .filter(|detail| detail.status == ProgressStatus::Succeed)
        .count();
    Progress::new(i32::try_from(succeed).unwrap_or(i32::MAX), expected)
}
