//! Ordering of pods for rollouts that must keep a replicated component available.
//!
//! Pods are sorted by ascending role priority, so learners and followers are handled before the
//! leader. Pods with the same priority are sorted by their ordinal.

use std::{cmp::Ordering, collections::BTreeMap, sync::LazyLock};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use regex::Regex;

use crate::{
    constants::ROLE_KEY,
    crd::cluster::{AccessMode, ReplicaRole},
};

const LEADER_PRIORITY: u8 = 1 << 5;
const FOLLOWER_READ_WRITE_PRIORITY: u8 = 1 << 4;
const FOLLOWER_READONLY_PRIORITY: u8 = 1 << 3;
const FOLLOWER_NONE_PRIORITY: u8 = 1 << 2;
const LEARNER_PRIORITY: u8 = 1 << 1;
const EMPTY_PRIORITY: u8 = 1 << 0;
const UNKNOWN_PRIORITY: u8 = 0;

static ORDINAL_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.*)-([0-9]+)$").ok());

/// Maps role names of a component to their rollout priority.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolePriorityMap {
    priorities: BTreeMap<String, u8>,
}

impl RolePriorityMap {
    pub fn from_roles(roles: &[ReplicaRole]) -> Self {
        let priorities = roles
            .iter()
            .map(|role| {
                let priority = match (role.is_leader, role.can_vote, role.access_mode) {
                    (true, _, _) => LEADER_PRIORITY,
                    (false, false, _) => LEARNER_PRIORITY,
                    (false, true, AccessMode::ReadWrite) => FOLLOWER_READ_WRITE_PRIORITY,
                    (false, true, AccessMode::Readonly) => FOLLOWER_READONLY_PRIORITY,
                    (false, true, AccessMode::None) => FOLLOWER_NONE_PRIORITY,
                };
                (role.name.to_lowercase(), priority)
            })
            .collect();
        Self { priorities }
    }

    /// Priority of a pod's role. Pods without a role label sort before all known roles.
    pub fn priority_of(&self, pod: &Pod) -> u8 {
        match pod.labels().get(ROLE_KEY) {
            None => EMPTY_PRIORITY,
            Some(role) if role.is_empty() => EMPTY_PRIORITY,
            Some(role) => self
                .priorities
                .get(&role.to_lowercase())
                .copied()
                .unwrap_or(UNKNOWN_PRIORITY),
        }
    }
}

/// Parses the ordinal suffix of a StatefulSet pod name, e.g. `2` for `mycluster-mysql-2`.
pub fn pod_ordinal(name: &str) -> Option<u32> {
    ORDINAL_REGEX
        .as_ref()?
        .captures(name)?
        .get(2)?
        .as_str()
        .parse()
        .ok()
}

/// Sorts pods into rollout order: ascending role priority, then ascending ordinal.
pub fn sort_pods(pods: &mut [Pod], priorities: &RolePriorityMap) {
    pods.sort_by(|a, b| compare(a, b, priorities));
}

fn compare(a: &Pod, b: &Pod, priorities: &RolePriorityMap) -> Ordering {
    priorities
        .priority_of(a)
        .cmp(&priorities.priority_of(b))
        .then_with(|| {
            let ordinal_a = pod_ordinal(&a.name_any());
            let ordinal_b = pod_ordinal(&b.name_any());
            ordinal_a.cmp(&ordinal_b)
        })
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test::PodBuilder;

    fn consensus_roles() -> Vec<ReplicaRole> {
        vec![
            ReplicaRole {
                name: "leader".to_owned(),
                is_leader: true,
                can_vote: true,
                access_mode: AccessMode::ReadWrite,
            },
            ReplicaRole {
                name: "follower".to_owned(),
                is_leader: false,
                can_vote: true,
                access_mode: AccessMode::Readonly,
            },
            ReplicaRole {
                name: "learner".to_owned(),
                is_leader: false,
                can_vote: false,
                access_mode: AccessMode::Readonly,
            },
        ]
    }

    fn names(pods: &[Pod]) -> Vec<String> {
        pods.iter().map(ResourceExt::name_any).collect()
    }

    #[test]
    fn consensus_set_puts_leader_last() {
        let mut pods = vec![
            PodBuilder::new("c", "mysql", 0).role("leader").build(),
            PodBuilder::new("c", "mysql", 1).role("follower").build(),
            PodBuilder::new("c", "mysql", 2).role("Follower").build(),
            PodBuilder::new("c", "mysql", 3).role("learner").build(),
        ];

        sort_pods(&mut pods, &RolePriorityMap::from_roles(&consensus_roles()));

        assert_eq!(
            names(&pods),
            vec!["c-mysql-3", "c-mysql-1", "c-mysql-2", "c-mysql-0"]
        );
    }

    #[test]
    fn unlabeled_and_unknown_roles_go_first() {
        let mut pods = vec![
            PodBuilder::new("c", "mysql", 0).role("leader").build(),
            PodBuilder::new("c", "mysql", 1).build(),
            PodBuilder::new("c", "mysql", 2).role("candidate").build(),
        ];

        sort_pods(&mut pods, &RolePriorityMap::from_roles(&consensus_roles()));

        assert_eq!(names(&pods), vec!["c-mysql-2", "c-mysql-1", "c-mysql-0"]);
    }

    #[test]
    fn pods_without_roles_are_ordered_by_ordinal() {
        let mut pods = vec![
            PodBuilder::new("c", "mysql", 10).build(),
            PodBuilder::new("c", "mysql", 2).build(),
            PodBuilder::new("c", "mysql", 1).build(),
        ];

        sort_pods(&mut pods, &RolePriorityMap::default());

        assert_eq!(names(&pods), vec!["c-mysql-1", "c-mysql-2", "c-mysql-10"]);
    }

    #[rstest]
    #[case("mycluster-mysql-2", Some(2))]
    #[case("mycluster-mysql-12", Some(12))]
    #[case("mycluster-mysql", None)]
    #[case("mysql-x1", None)]
    fn parse_ordinal(#[case] name: &str, #[case] expected: Option<u32>) {
        assert_eq!(pod_ordinal(name), expected);
    }
}
