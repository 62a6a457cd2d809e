use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{LifecycleState, NodeStatus, ServiceIngress, VmClusterSpec},
    provider::{DeploymentRequest, NodeRole, Provider},
};

/// The parts of a cluster every node request needs
#[derive(Debug, Clone, Copy)]
pub struct ClusterRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub spec: &'a VmClusterSpec,
    pub owner: Option<&'a OwnerReference>,
}

pub enum NodeTarget<'a> {
    /// The head publishes its load balancer address into cluster status
    Head {
        ingress: &'a mut Option<ServiceIngress>,
    },
    /// Workers join the head, so they carry its latest status
    Worker { head: &'a NodeStatus },
}

pub struct NodeRequest<'a> {
    pub cluster: ClusterRef<'a>,
    pub name: &'a str,
    pub node_type: &'a str,
    pub status: &'a mut NodeStatus,
    pub target: NodeTarget<'a>,
}

impl NodeRequest<'_> {
    fn deployment(&self) -> DeploymentRequest {
        let (role, ingress_address) = match &self.target {
            NodeTarget::Head { ingress } => (
                NodeRole::Head,
                ingress.as_ref().map(|i| i.address.clone()),
            ),
            NodeTarget::Worker { head } => (
                NodeRole::Worker {
                    head_ip: head.ip.clone(),
                },
                None,
            ),
        };

        let spec = self.cluster.spec;
        DeploymentRequest {
            namespace: self.cluster.namespace.to_string(),
            cluster_name: self.cluster.name.to_string(),
            vm_name: self.name.to_string(),
            role,
            node_type: self.node_type.to_string(),
            image: spec.image.clone(),
            api_server: spec.api_server.clone(),
            head_node: spec.head_node.clone(),
            node_config: spec.node_config.clone(),
            enable_tls: spec.enable_tls,
            registry: spec.registry.clone(),
            ingress_address,
            owner: self.cluster.owner.cloned(),
        }
    }
}

/// Moves a single node one step through its lifecycle.
///
/// Every call makes at most one provider round trip (two for a head node that
/// still needs its load balancer) and then updates the node status in place.
/// Progress across states happens one reconcile cycle at a time.
pub struct NodeLifecycleManager {
    provider: Arc<dyn Provider>,
}

impl NodeLifecycleManager {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    #[instrument(
        level = Level::DEBUG,
        skip_all,
        fields(node = request.name, state = %request.status.vm_state)
    )]
    pub async fn advance(&self, request: NodeRequest<'_>) -> Result<()> {
        match request.status.vm_state.clone() {
            LifecycleState::Empty => self.create(request).await,
            LifecycleState::Initialized => self.await_address(request).await,
            LifecycleState::Running => self.monitor(request).await,
            LifecycleState::Failure => self.recover(request).await,
            LifecycleState::Unrecognized(state) => {
                tracing::error!(node = request.name, %state, "Node status holds an unknown lifecycle state");
                Err(Error::InvalidNodeStatus(state))
            }
        }
    }

    async fn create(&self, request: NodeRequest<'_>) -> Result<()> {
        let mut deployment = request.deployment();

        if let NodeTarget::Head { ingress } = request.target {
            let Some(address) = self.provider.deploy_head_ingress(&deployment).await? else {
                tracing::info!(node = request.name, "Waiting for head load balancer address");
                return Ok(());
            };
            deployment.ingress_address = Some(address.clone());
            *ingress = Some(ServiceIngress { address });
        }

        match self.provider.deploy(&deployment).await {
            Ok(()) => tracing::info!(node = request.name, "Requested virtual machine"),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(node = request.name, "Virtual machine already exists")
            }
            Err(e) => {
                request.status.vm_state = LifecycleState::Failure;
                return Err(e.into());
            }
        }

        request.status.vm_state = LifecycleState::Initialized;
        Ok(())
    }

    async fn await_address(&self, request: NodeRequest<'_>) -> Result<()> {
        let status = request.status;
        let observation = match self
            .provider
            .fetch_status(request.cluster.namespace, request.name)
            .await
        {
            Ok(observation) => observation,
            Err(e) => {
                status.vm_state = LifecycleState::Failure;
                return Err(e.into());
            }
        };

        status.ip = observation.ip;
        status.conditions = observation.conditions;

        if status.ip.is_some() {
            tracing::info!(node = request.name, ip = ?status.ip, "Virtual machine is up");
            status.vm_state = LifecycleState::Running;
            status.process_state = LifecycleState::Initialized;
        }
        Ok(())
    }

    async fn monitor(&self, request: NodeRequest<'_>) -> Result<()> {
        let status = request.status;
        let error = match self
            .provider
            .fetch_status(request.cluster.namespace, request.name)
            .await
        {
            Ok(observation) if observation.ip.is_some() => {
                status.ip = observation.ip;
                status.conditions = observation.conditions;
                status.process_state = LifecycleState::Running;
                return Ok(());
            }
            Ok(observation) => {
                status.ip = None;
                status.conditions = observation.conditions;
                Error::AddressNotFound(request.name.to_string())
            }
            Err(e) => e.into(),
        };

        tracing::warn!(node = request.name, %error, "Lost track of running node");
        status.vm_state = LifecycleState::Failure;
        status.process_state = LifecycleState::Failure;
        Err(error)
    }

    async fn recover(&self, request: NodeRequest<'_>) -> Result<()> {
        let status = request.status;
        match self
            .provider
            .fetch_status(request.cluster.namespace, request.name)
            .await
        {
            Ok(_) => {
                status.vm_state = LifecycleState::Initialized;
                status.process_state = LifecycleState::Empty;
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(node = request.name, "Virtual machine is gone, recreating");
                status.ip = None;
                status.vm_state = LifecycleState::Empty;
                status.process_state = LifecycleState::Empty;
            }
            Err(e) => {
                tracing::warn!(node = request.name, error = %e, "Failed node is still unreachable");
            }
        }
        Ok(())
    }
}
