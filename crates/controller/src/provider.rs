use garde::Validate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use thiserror::Error;

use crate::api::{ApiServerInfo, Condition, HeadNodeConfig, NodeConfig, RegistryConfig};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod vmop;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("Invalid deployment request: {0}")]
    Invalid(String),
    /// The infrastructure could not serve the request right now; retried next cycle
    #[error("Infrastructure unavailable: {0}")]
    Unavailable(String),
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists { .. })
    }
}

impl From<garde::Report> for ProviderError {
    fn from(report: garde::Report) -> Self {
        ProviderError::Invalid(report.to_string())
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Infrastructure actions the reconcilers depend on.
///
/// Implementations must be idempotent: every call may be repeated on the next
/// cycle after a crash or requeue.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Create the VM described by `request`. Returns
    /// [`ProviderError::AlreadyExists`] when it is already there.
    async fn deploy(&self, request: &DeploymentRequest) -> ProviderResult<()>;

    /// Ensure the head node's load balancer exists and return its address, or
    /// `None` while the address is still being assigned.
    async fn deploy_head_ingress(&self, request: &DeploymentRequest)
    -> ProviderResult<Option<String>>;

    /// Observe a VM. Returns [`ProviderError::NotFound`] when it does not exist.
    async fn fetch_status(&self, namespace: &str, name: &str) -> ProviderResult<VmObservation>;

    /// Delete a VM. Deleting a missing VM succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> ProviderResult<()>;

    /// Tear down accounts, roles and secrets created for the cluster.
    async fn delete_auxiliary_resources(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> ProviderResult<()>;
}

/// What the provider currently reports for a VM
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmObservation {
    pub ip: Option<String>,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeRole {
    Head,
    /// Workers join the head at this address
    Worker { head_ip: Option<String> },
}

/// Everything a provider needs to bring up one node
#[derive(Debug, Clone, Validate)]
pub struct DeploymentRequest {
    #[garde(length(min = 1))]
    pub namespace: String,
    #[garde(length(min = 1))]
    pub cluster_name: String,
    /// VM names end up as DNS labels
    #[garde(length(min = 1, max = 63))]
    pub vm_name: String,
    #[garde(skip)]
    pub role: NodeRole,
    #[garde(length(min = 1))]
    pub node_type: String,
    #[garde(length(min = 1))]
    pub image: String,
    #[garde(skip)]
    pub api_server: ApiServerInfo,
    #[garde(skip)]
    pub head_node: HeadNodeConfig,
    #[garde(skip)]
    pub node_config: NodeConfig,
    #[garde(skip)]
    pub enable_tls: bool,
    #[garde(skip)]
    pub registry: Option<RegistryConfig>,
    /// Address of the head node's load balancer, head only
    #[garde(skip)]
    pub ingress_address: Option<String>,
    #[garde(skip)]
    pub owner: Option<OwnerReference>,
}

impl DeploymentRequest {
    pub fn is_head(&self) -> bool {
        self.role == NodeRole::Head
    }
}
