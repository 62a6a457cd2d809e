use std::collections::{BTreeMap, BTreeSet};

use tracing::{Level, instrument};

use crate::{
    Result,
    api::{NodeStatus, VmClusterStatus},
    provider::Provider,
    reconcilers::node::{ClusterRef, NodeLifecycleManager, NodeRequest, NodeTarget},
};

/// Outcome of comparing declared workers with observed ones
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WorkerDiff {
    /// Observed but no longer declared
    pub stale: Vec<String>,
    /// Declared but not observed yet
    pub missing: Vec<String>,
}

/// Compute which workers to delete and which are new. During teardown the
/// declared set counts as empty so every observed worker is stale.
pub fn diff_workers(
    desired: &BTreeMap<String, String>,
    current: &BTreeMap<String, NodeStatus>,
    teardown: bool,
) -> WorkerDiff {
    let desired: BTreeSet<&str> = if teardown {
        BTreeSet::new()
    } else {
        desired.keys().map(String::as_str).collect()
    };
    let current: BTreeSet<&str> = current.keys().map(String::as_str).collect();

    WorkerDiff {
        stale: current.difference(&desired).map(|s| s.to_string()).collect(),
        missing: desired.difference(&current).map(|s| s.to_string()).collect(),
    }
}

/// Converges `status.currentWorkers` toward `spec.desiredWorkers`
pub struct WorkerSetReconciler<'a> {
    pub provider: &'a dyn Provider,
    pub nodes: &'a NodeLifecycleManager,
}

impl WorkerSetReconciler<'_> {
    /// Delete the named workers in order, dropping each from `current` once
    /// it is gone. Stops at the first failure.
    pub async fn delete_workers(
        &self,
        namespace: &str,
        current: &mut BTreeMap<String, NodeStatus>,
        names: &[String],
    ) -> Result<()> {
        for name in names {
            self.provider.delete(namespace, name).await?;
            current.remove(name);
            tracing::info!(worker = %name, "Deleted worker node");
        }
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(cluster = cluster.name))]
    pub async fn reconcile(&self, cluster: ClusterRef<'_>, status: &mut VmClusterStatus) -> Result<()> {
        let desired = &cluster.spec.desired_workers;
        let diff = diff_workers(desired, &status.current_workers, false);
        if !diff.missing.is_empty() {
            tracing::info!(workers = ?diff.missing, "Scaling up worker nodes");
        }

        self.delete_workers(cluster.namespace, &mut status.current_workers, &diff.stale)
            .await?;

        for (name, node_type) in desired {
            let mut node = status.current_workers.get(name).cloned().unwrap_or_default();
            let result = self
                .nodes
                .advance(NodeRequest {
                    cluster,
                    name,
                    node_type,
                    status: &mut node,
                    target: NodeTarget::Worker {
                        head: &status.head_node_status,
                    },
                })
                .await;

            // Persist whatever the manager observed before looking at the error
            status.current_workers.insert(name.clone(), node);
            result?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        api::LifecycleState,
        provider::mock::{self, Call, MockProvider},
        test_support::{NAMESPACE, cluster_spec},
    };

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn desired(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), "cpu".to_string()))
            .collect()
    }

    fn current(names: &[&str]) -> BTreeMap<String, NodeStatus> {
        names
            .iter()
            .map(|n| (n.to_string(), NodeStatus::default()))
            .collect()
    }

    fn running_head() -> NodeStatus {
        NodeStatus {
            ip: Some("10.0.0.5".to_string()),
            vm_state: LifecycleState::Running,
            process_state: LifecycleState::Running,
            ..Default::default()
        }
    }

    #[test]
    fn diff_splits_stale_and_missing() {
        let diff = diff_workers(&desired(&["w1", "w2"]), &current(&["w1", "w3"]), false);
        assert_eq!(
            diff,
            WorkerDiff {
                stale: names(&["w3"]),
                missing: names(&["w2"]),
            }
        );
    }

    #[test]
    fn teardown_marks_every_worker_stale() {
        let diff = diff_workers(&desired(&["w1", "w2"]), &current(&["w1", "w3"]), true);
        assert_eq!(diff.stale, names(&["w1", "w3"]));
        assert!(diff.missing.is_empty());
    }

    #[tokio::test]
    async fn one_pass_deletes_stale_and_advances_declared() {
        let provider = MockProvider::new();
        let nodes = NodeLifecycleManager::new(Arc::new(provider.clone()));
        let workers = WorkerSetReconciler {
            provider: &provider,
            nodes: &nodes,
        };

        let mut spec = cluster_spec();
        spec.desired_workers = desired(&["w1", "w2"]);
        let mut status = VmClusterStatus {
            head_node_status: running_head(),
            current_workers: current(&["w1", "w3"]),
            ..Default::default()
        };

        let cluster = ClusterRef {
            namespace: NAMESPACE,
            name: "demo",
            spec: &spec,
            owner: None,
        };
        workers.reconcile(cluster, &mut status).await.unwrap();

        assert_eq!(
            provider.calls(),
            vec![
                Call::Delete("w3".to_string()),
                Call::Deploy("w1".to_string()),
                Call::Deploy("w2".to_string()),
            ]
        );
        assert_eq!(
            status.current_workers.keys().collect::<Vec<_>>(),
            vec!["w1", "w2"]
        );

        // With a healthy provider both workers reach running
        for _ in 0..2 {
            workers.reconcile(cluster, &mut status).await.unwrap();
        }
        for worker in status.current_workers.values() {
            assert_eq!(worker.vm_state, LifecycleState::Running);
            assert_eq!(worker.process_state, LifecycleState::Running);
        }
        assert_eq!(status.current_workers.len(), 2);
    }

    #[tokio::test]
    async fn failed_delete_aborts_before_any_advance() {
        let provider = MockProvider::new();
        provider.script_delete("w3", Err(mock::unavailable()));
        let nodes = NodeLifecycleManager::new(Arc::new(provider.clone()));
        let workers = WorkerSetReconciler {
            provider: &provider,
            nodes: &nodes,
        };

        let mut spec = cluster_spec();
        spec.desired_workers = desired(&["w1"]);
        let mut status = VmClusterStatus {
            head_node_status: running_head(),
            current_workers: current(&["w3", "w4"]),
            ..Default::default()
        };

        let cluster = ClusterRef {
            namespace: NAMESPACE,
            name: "demo",
            spec: &spec,
            owner: None,
        };
        assert!(workers.reconcile(cluster, &mut status).await.is_err());

        assert_eq!(provider.calls(), vec![Call::Delete("w3".to_string())]);
        assert!(status.current_workers.contains_key("w3"));
        assert!(status.current_workers.contains_key("w4"));
    }

    #[tokio::test]
    async fn failed_worker_is_persisted_and_stops_the_pass() {
        let provider = MockProvider::new();
        provider.script_deploy("w1", Err(mock::unavailable()));
        let nodes = NodeLifecycleManager::new(Arc::new(provider.clone()));
        let workers = WorkerSetReconciler {
            provider: &provider,
            nodes: &nodes,
        };

        let mut spec = cluster_spec();
        spec.desired_workers = desired(&["w1", "w2"]);
        let mut status = VmClusterStatus {
            head_node_status: running_head(),
            ..Default::default()
        };

        let cluster = ClusterRef {
            namespace: NAMESPACE,
            name: "demo",
            spec: &spec,
            owner: None,
        };
        assert!(workers.reconcile(cluster, &mut status).await.is_err());

        assert_eq!(
            status.current_workers["w1"].vm_state,
            LifecycleState::Failure
        );
        assert!(!status.current_workers.contains_key("w2"));
    }
}
