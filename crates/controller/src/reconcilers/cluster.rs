use std::sync::Arc;

use futures::Stream;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{ClusterState, Condition, LifecycleState, VmCluster},
    config::ControllerConfig,
    provider::{Provider, vmop::resources::VirtualMachine},
    reconcilers::{
        conditions::{self, record_failure},
        node::{ClusterRef, NodeLifecycleManager, NodeRequest, NodeTarget},
        status,
        workers::{WorkerSetReconciler, diff_workers},
    },
};

const MANAGER_NAME: &str = "vmcluster-controller";

struct ReconcilerCtx {
    client: Client,
    reconciler: ClusterReconciler,
    config: ControllerConfig,
}

pub fn control_loop(
    client: Client,
    provider: Arc<dyn Provider>,
    config: ControllerConfig,
) -> impl Stream<Item = Result<(ObjectRef<VmCluster>, Action), ControllerError<Error, watcher::Error>>>
{
    let (clusters, vms) = match config.namespace.as_deref() {
        Some(namespace) => (
            Api::<VmCluster>::namespaced(client.clone(), namespace),
            Api::<VirtualMachine>::namespaced(client.clone(), namespace),
        ),
        None => (
            Api::<VmCluster>::all(client.clone()),
            Api::<VirtualMachine>::all(client.clone()),
        ),
    };

    let context = Arc::new(ReconcilerCtx {
        client,
        reconciler: ClusterReconciler::new(provider),
        config,
    });

    Controller::new(clusters, watcher::Config::default())
        .owns(vms, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

#[instrument(
    level = Level::DEBUG,
    skip_all,
    fields(cluster = %cluster.name_any(), namespace = ?cluster.namespace())
)]
async fn reconcile(cluster: Arc<VmCluster>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    let namespace = cluster.namespace().ok_or(Error::MissingField)?;
    let name = cluster.name_any();
    let clusters = Api::<VmCluster>::namespaced(context.client.clone(), &namespace);
    let cycle_timeout = context.config.cycle_timeout;

    if cluster.metadata.deletion_timestamp.is_some() {
        if !cluster.has_finalizer() {
            return Ok(Action::await_change());
        }

        tracing::info!("Tearing down cluster");
        let mut working = cluster.as_ref().clone();
        let outcome =
            tokio::time::timeout(cycle_timeout, context.reconciler.teardown(&mut working)).await;

        return match outcome {
            Ok(Ok(())) => {
                if let Some(patch) = status::finalizer_removal(&working) {
                    clusters
                        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                        .await?;
                }
                tracing::info!("Cluster deleted");
                Ok(Action::await_change())
            }
            Ok(Err(e)) => {
                persist_status(&clusters, &name, &cluster, &working).await?;
                Err(e)
            }
            Err(_) => {
                persist_status(&clusters, &name, &cluster, &working).await?;
                Err(Error::DeadlineExceeded(cycle_timeout))
            }
        };
    }

    tracing::info!("Reconciling...");

    let mut working = cluster.as_ref().clone();
    if let Some(patch) = status::ensure_metadata(&mut working) {
        working = clusters
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        tracing::debug!("Stored finalizer and head nonce");
    }

    let snapshot = working.clone();
    let outcome =
        tokio::time::timeout(cycle_timeout, context.reconciler.converge(&mut working)).await;

    // Everything the cycle managed to observe is written back, even past the deadline
    persist_status(&clusters, &name, &snapshot, &working).await?;

    match outcome {
        Ok(()) => Ok(Action::requeue(context.config.requeue_interval)),
        Err(_) => Err(Error::DeadlineExceeded(cycle_timeout)),
    }
}

async fn persist_status(
    clusters: &Api<VmCluster>,
    name: &str,
    snapshot: &VmCluster,
    working: &VmCluster,
) -> Result<()> {
    let Some(patch) = status::status_patch(snapshot, working)? else {
        return Ok(());
    };

    clusters
        .patch_status(name, &PatchParams::apply(MANAGER_NAME), &Patch::<()>::Json(patch))
        .await?;
    Ok(())
}

fn error_policy(cluster: Arc<VmCluster>, error: &Error, context: Arc<ReconcilerCtx>) -> Action {
    tracing::warn!(cluster = %cluster.name_any(), %error, "Reconcile failed, retrying");
    Action::requeue(context.config.error_requeue)
}

/// Drives one cluster toward its declared state against a [`Provider`].
///
/// Works only on an in-memory copy of the cluster; persisting the result is the
/// caller's job.
pub struct ClusterReconciler {
    provider: Arc<dyn Provider>,
    nodes: NodeLifecycleManager,
}

impl ClusterReconciler {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            nodes: NodeLifecycleManager::new(provider.clone()),
            provider,
        }
    }

    fn workers(&self) -> WorkerSetReconciler<'_> {
        WorkerSetReconciler {
            provider: self.provider.as_ref(),
            nodes: &self.nodes,
        }
    }

    /// One create/update cycle. Node failures end up in status and conditions
    /// rather than being returned.
    pub async fn converge(&self, cluster: &mut VmCluster) {
        let previous = take_conditions(cluster);
        self.converge_nodes(cluster).await;
        restore_transition_times(cluster, &previous);
    }

    async fn converge_nodes(&self, cluster: &mut VmCluster) {
        let head_name = cluster.head_node_name();
        let owner = cluster.controller_owner_ref(&());
        let VmCluster {
            metadata,
            spec,
            status,
        } = cluster;
        let status = status.get_or_insert_default();
        let cluster = ClusterRef {
            namespace: metadata.namespace.as_deref().unwrap_or_default(),
            name: metadata.name.as_deref().unwrap_or_default(),
            spec,
            owner: owner.as_ref(),
        };

        let head = self
            .nodes
            .advance(NodeRequest {
                cluster,
                name: &head_name,
                node_type: &spec.head_node.node_type,
                status: &mut status.head_node_status,
                target: NodeTarget::Head {
                    ingress: &mut status.head_service_ingress,
                },
            })
            .await;

        if let Err(e) = head {
            tracing::error!(error = %e, "Head node reconcile failed");
            status.cluster_state = Some(ClusterState::Unhealthy);
            record_failure(
                &mut status.conditions,
                conditions::HEAD_NODE_READY,
                conditions::FAILURE_TO_DEPLOY_NODE,
                e.to_string(),
            );
            return;
        }

        // Workers cannot join until the process on the head is up
        if status.head_node_status.process_state != LifecycleState::Running {
            tracing::debug!(state = %status.head_node_status.process_state, "Head node not running yet");
            return;
        }

        if let Err(e) = self.workers().reconcile(cluster, status).await {
            tracing::error!(error = %e, "Worker node reconcile failed");
            status.cluster_state = Some(ClusterState::Unhealthy);
            record_failure(
                &mut status.conditions,
                conditions::WORKER_NODE_READY,
                conditions::FAILURE_TO_DEPLOY_NODE,
                e.to_string(),
            );
            return;
        }

        let min_workers = spec.node_config.min_workers;
        let current = status.current_workers.len();
        if current <= min_workers as usize {
            status.cluster_state = Some(ClusterState::Unhealthy);
            record_failure(
                &mut status.conditions,
                conditions::WORKER_NODE_READY,
                conditions::FAILURE_TO_DEPLOY_NODE,
                format!("{current} worker nodes present, more than {min_workers} required"),
            );
        } else {
            status.cluster_state = Some(ClusterState::Healthy);
        }
    }

    /// One teardown cycle: auxiliary resources, then workers, then the head.
    /// Returns `Ok` only once all three are gone. Failures are appended to the
    /// conditions left by earlier cycles.
    pub async fn teardown(&self, cluster: &mut VmCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let head_name = cluster.head_node_name();
        let status = cluster.status.get_or_insert_default();

        if let Err(e) = self
            .provider
            .delete_auxiliary_resources(&namespace, &name)
            .await
        {
            tracing::error!(error = %e, "Failed to delete auxiliary resources");
            record_failure(
                &mut status.conditions,
                conditions::DELETE_CLUSTER,
                conditions::FAILURE_TO_DELETE_AUXILIARY_RESOURCES,
                e.to_string(),
            );
            return Err(e.into());
        }

        let stale = diff_workers(&cluster.spec.desired_workers, &status.current_workers, true).stale;
        if let Err(e) = self
            .workers()
            .delete_workers(&namespace, &mut status.current_workers, &stale)
            .await
        {
            tracing::error!(error = %e, "Failed to delete worker nodes");
            record_failure(
                &mut status.conditions,
                conditions::DELETE_CLUSTER,
                conditions::FAILURE_TO_DELETE_WORKER_NODE,
                e.to_string(),
            );
            return Err(e);
        }

        if let Err(e) = self.provider.delete(&namespace, &head_name).await {
            tracing::error!(error = %e, head = %head_name, "Failed to delete head node");
            record_failure(
                &mut status.conditions,
                conditions::DELETE_CLUSTER,
                conditions::FAILURE_TO_DELETE_HEAD_NODE,
                e.to_string(),
            );
            return Err(e.into());
        }

        status.head_node_status = Default::default();
        status.head_service_ingress = None;
        Ok(())
    }
}

/// Each cycle starts from an empty condition list
fn take_conditions(cluster: &mut VmCluster) -> Vec<Condition> {
    cluster
        .status
        .as_mut()
        .map(|status| std::mem::take(&mut status.conditions))
        .unwrap_or_default()
}

fn restore_transition_times(cluster: &mut VmCluster, previous: &[Condition]) {
    if let Some(status) = cluster.status.as_mut() {
        conditions::keep_transition_times(previous, &mut status.conditions);
    }
}
