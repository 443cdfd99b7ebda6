use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::EnumCount;

use crate::crd::OpsType;

pub const REASON_VALIDATE_PASSED: &str = "ValidatePassed";
pub const REASON_VALIDATE_FAILED: &str = "ValidateFailed";
pub const REASON_CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
pub const REASON_OPS_TYPE_NOT_SUPPORTED: &str = "OpsTypeNotSupported";
pub const REASON_CONFLICTING_OPERATION: &str = "ConflictingOperation";
pub const REASON_PROCESSED_SUCCESSFULLY: &str = "OpsRequestProcessedSuccessfully";
pub const REASON_OPS_FAILED: &str = "OpsRequestFailed";

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// A human readable message indicating details about the transition.
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The reason for the condition's last transition.
    pub reason: Option<String>,
    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,
    #[serde(rename = "type")]
    pub type_: OpsConditionType,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    EnumCount,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "PascalCase")]
pub enum OpsConditionType {
    /// The request passed validation against the live cluster.
    #[default]
    Validated,
    Upgrading,
    VerticalScaling,
    HorizontalScaling,
    VolumeExpanding,
    Restarting,
    Reconfiguring,
    Succeed,
    Failed,
}

impl From<OpsType> for OpsConditionType {
    fn from(value: OpsType) -> Self {
        match value {
            OpsType::Upgrade => Self::Upgrading,
            OpsType::VerticalScaling => Self::VerticalScaling,
            OpsType::HorizontalScaling => Self::HorizontalScaling,
            OpsType::VolumeExpansion => Self::VolumeExpanding,
            OpsType::Restart => Self::Restarting,
            OpsType::Reconfigure => Self::Reconfiguring,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    #[default]
    True,
    False,
    Unknown,
}

impl OpsCondition {
    fn new(
        type_: OpsConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            last_transition_time: None,
            message: Some(message.into()),
            reason: Some(reason.to_owned()),
            status,
            type_,
        }
    }

    pub fn validated(request_name: &str) -> Self {
        Self::new(
            OpsConditionType::Validated,
            ConditionStatus::True,
            REASON_VALIDATE_PASSED,
            format!("OpsRequest: {request_name} is validated"),
        )
    }

    /// The type-specific condition marking that the action was applied.
    pub fn started(ops_type: OpsType, cluster_name: &str) -> Self {
        let message = match ops_type {
            OpsType::Upgrade => "Start to upgrade",
            OpsType::VerticalScaling => "Start to vertical scale resources",
            OpsType::HorizontalScaling => "Start to horizontal scale replicas",
            OpsType::VolumeExpansion => "Start to expand the volumes",
            OpsType::Restart => "Start to restart database",
            OpsType::Reconfigure => "Start to reconfigure",
        };
        let message = format!("{message} in Cluster: {cluster_name}");
        Self::new(
            ops_type.into(),
            ConditionStatus::True,
            &ops_type.to_string(),
            message,
        )
    }

    pub fn succeed(request_name: &str) -> Self {
        Self::new(
            OpsConditionType::Succeed,
            ConditionStatus::True,
            REASON_PROCESSED_SUCCESSFULLY,
            format!("Successfully processed the OpsRequest: {request_name} in Cluster"),
        )
    }

    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self::new(
            OpsConditionType::Failed,
            ConditionStatus::False,
            reason,
            message,
        )
    }

    pub fn is_failure(&self) -> bool {
        self.status == ConditionStatus::False
    }
}

/// Helper struct to order and merge [`OpsCondition`]s, holding at most one condition per type.
#[derive(Clone, Default)]
struct OpsConditionSet {
    conditions: Vec<Option<OpsCondition>>,
}

impl OpsConditionSet {
    fn new() -> Self {
        Self {
            // Each OpsConditionType has its fixed position, which keeps the order stable and
            // prevents storing a condition under the index of another type.
            conditions: vec![None; OpsConditionType::COUNT],
        }
    }

    fn put(&mut self, condition: OpsCondition) {
        let index = condition.type_ as usize;
        self.conditions[index] = Some(condition);
    }

    fn take(&mut self, type_: OpsConditionType) -> Option<OpsCondition> {
        self.conditions[type_ as usize].take()
    }
}

impl From<OpsConditionSet> for Vec<OpsCondition> {
    fn from(value: OpsConditionSet) -> Self {
        value.conditions.into_iter().flatten().collect()
    }
}

impl From<Vec<OpsCondition>> for OpsConditionSet {
    fn from(value: Vec<OpsCondition>) -> Self {
        let mut result = Self::new();
        for c in value {
            result.put(c);
        }
        result
    }
}

/// Sets `new_condition` in `conditions`, replacing a previous condition of the same type.
///
/// The transition time is kept when the status did not change. Returns `false` if an identical
/// condition was already present.
pub fn set_condition(
    conditions: &mut Vec<OpsCondition>,
    new_condition: OpsCondition,
    now: Timestamp,
) -> bool {
    let mut set = OpsConditionSet::from(std::mem::take(conditions));
    let changed;
    let merged = match set.take(new_condition.type_) {
        Some(old) if old.status == new_condition.status => {
            changed = old.message != new_condition.message || old.reason != new_condition.reason;
            OpsCondition {
                last_transition_time: old.last_transition_time,
                ..new_condition
            }
        }
        _ => {
            changed = true;
            OpsCondition {
                last_transition_time: Some(Time(now)),
                ..new_condition
            }
        }
    };
    set.put(merged);
    *conditions = set.into();
    changed
}
