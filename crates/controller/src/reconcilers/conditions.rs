//! Condition types and reasons recorded on `VmCluster` status.

use chrono::Utc;

use crate::api::Condition;

pub const HEAD_NODE_READY: &str = "HeadNodeReady";
pub const WORKER_NODE_READY: &str = "WorkerNodeReady";
pub const DELETE_CLUSTER: &str = "DeleteCluster";

pub const FAILURE_TO_DEPLOY_NODE: &str = "FailureToDeployNode";
pub const FAILURE_TO_DELETE_AUXILIARY_RESOURCES: &str = "FailureToDeleteAuxiliaryResources";
pub const FAILURE_TO_DELETE_WORKER_NODE: &str = "FailureToDeleteWorkerNode";
pub const FAILURE_TO_DELETE_HEAD_NODE: &str = "FailureToDeleteHeadNode";

const CONDITION_FALSE: &str = "False";

/// Append a failed condition. Conditions are never replaced one by one; the
/// whole list is reset at the start of each create/update cycle.
///
/// A failure identical to one already in the list is moved to the end with its
/// original transition time, so retried teardowns do not grow the list.
pub fn record_failure(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    message: impl Into<String>,
) {
    let message = message.into();
    let existing = conditions
        .iter()
        .position(|c| c.type_ == type_ && c.reason == reason && c.message == message);

    let condition = match existing {
        Some(index) => conditions.remove(index),
        None => Condition {
            type_: type_.to_string(),
            status: CONDITION_FALSE.to_string(),
            reason: reason.to_string(),
            message,
            last_transition_time: Utc::now(),
        },
    };
    conditions.push(condition);
}

/// Conditions that are recorded again unchanged keep the time they first appeared,
/// so a persistent failure does not rewrite status every cycle
pub fn keep_transition_times(previous: &[Condition], current: &mut [Condition]) {
    for condition in current.iter_mut() {
        let earlier = previous.iter().find(|p| {
            p.type_ == condition.type_
                && p.reason == condition.reason
                && p.message == condition.message
        });
        if let Some(earlier) = earlier {
            condition.last_transition_time = earlier.last_transition_time;
        }
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_in_order() {
        let mut conditions = vec![];
        record_failure(&mut conditions, HEAD_NODE_READY, FAILURE_TO_DEPLOY_NODE, "boom");
        record_failure(
            &mut conditions,
            DELETE_CLUSTER,
            FAILURE_TO_DELETE_HEAD_NODE,
            "still there",
        );

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[1].reason, FAILURE_TO_DELETE_HEAD_NODE);
        assert_eq!(
            find(&conditions, HEAD_NODE_READY).map(|c| c.message.as_str()),
            Some("boom")
        );
        assert!(find(&conditions, WORKER_NODE_READY).is_none());
    }

    #[test]
    fn repeated_failure_moves_to_the_end() {
        let mut conditions = vec![];
        record_failure(&mut conditions, DELETE_CLUSTER, FAILURE_TO_DELETE_HEAD_NODE, "busy");
        conditions[0].last_transition_time -= chrono::Duration::minutes(5);
        let first_seen = conditions[0].last_transition_time;

        record_failure(&mut conditions, HEAD_NODE_READY, FAILURE_TO_DEPLOY_NODE, "boom");
        record_failure(&mut conditions, DELETE_CLUSTER, FAILURE_TO_DELETE_HEAD_NODE, "busy");

        let reasons: Vec<_> = conditions.iter().map(|c| c.reason.as_str()).collect();
        assert_eq!(reasons, vec![FAILURE_TO_DEPLOY_NODE, FAILURE_TO_DELETE_HEAD_NODE]);
        assert_eq!(conditions[1].last_transition_time, first_seen);

        // Same reason with a different message is a separate failure
        record_failure(&mut conditions, DELETE_CLUSTER, FAILURE_TO_DELETE_HEAD_NODE, "gone");
        assert_eq!(conditions.len(), 3);
    }

    #[test]
    fn repeated_failures_keep_their_first_timestamp() {
        let mut previous = vec![];
        record_failure(&mut previous, HEAD_NODE_READY, FAILURE_TO_DEPLOY_NODE, "boom");
        previous[0].last_transition_time -= chrono::Duration::minutes(5);

        let mut current = vec![];
        record_failure(&mut current, HEAD_NODE_READY, FAILURE_TO_DEPLOY_NODE, "boom");
        record_failure(&mut current, WORKER_NODE_READY, FAILURE_TO_DEPLOY_NODE, "new");
        let fresh = current[1].last_transition_time;

        keep_transition_times(&previous, &mut current);

        assert_eq!(current[0].last_transition_time, previous[0].last_transition_time);
        assert_eq!(current[1].last_transition_time, fresh);
    }
}
