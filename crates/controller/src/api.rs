use std::{borrow::Cow, collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use garde::Validate;
use kube::CustomResource;
use schemars::{JsonSchema, SchemaGenerator, Schema};
use serde::{Deserialize, Serialize};

/// Label holding the per-cluster head node nonce
pub const HEAD_NONCE_LABEL: &str = "vmcluster.dev/head-nonce";

/// Finalizer blocking removal of a cluster until its VMs are gone
pub const CLUSTER_FINALIZER: &str = "vmcluster.dev/finalizer";

pub const DEFAULT_HEAD_PORT: u16 = 6379;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Validate, JsonSchema)]
#[kube(
    group = "vmcluster.dev",
    version = "v1alpha1",
    kind = "VmCluster",
    namespaced
)]
#[kube(status = "VmClusterStatus", shortname = "vmc")]
#[serde(rename_all = "camelCase")]
pub struct VmClusterSpec {
    /// Container image the workload process runs from
    #[garde(length(min = 1))]
    pub image: String,
    #[garde(dive)]
    pub api_server: ApiServerInfo,
    #[garde(dive)]
    pub head_node: HeadNodeConfig,
    #[garde(dive)]
    pub node_config: NodeConfig,
    /// Worker name to node type. Owned by the autoscaler running on the head node.
    #[garde(skip)]
    #[serde(default)]
    pub desired_workers: BTreeMap<String, String>,
    #[garde(skip)]
    #[serde(default)]
    pub enable_tls: bool,
    #[garde(skip)]
    pub registry: Option<RegistryConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerInfo {
    #[garde(length(min = 1))]
    pub location: String,
    #[garde(skip)]
    pub ca_cert: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeadNodeConfig {
    /// Key into `nodeConfig.nodeTypes`
    #[garde(length(min = 1))]
    pub node_type: String,
    #[garde(skip)]
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[garde(range(min = 1))]
    pub port: Option<u16>,
}

impl HeadNodeConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_HEAD_PORT)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[garde(length(min = 1))]
    pub vm_image: String,
    #[garde(length(min = 1))]
    pub storage_class: String,
    #[garde(skip)]
    pub vm_user: Option<String>,
    #[garde(skip)]
    pub min_workers: u32,
    #[garde(custom(at_least(&self.min_workers)))]
    pub max_workers: u32,
    #[garde(skip)]
    pub idle_timeout_minutes: Option<u32>,
    #[garde(length(min = 1), dive)]
    pub node_types: BTreeMap<String, NodeType>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeType {
    #[garde(length(min = 1))]
    pub vm_class: String,
    #[garde(skip)]
    pub min_workers: u32,
    #[garde(custom(at_least(&self.min_workers)))]
    pub max_workers: u32,
    #[garde(skip)]
    #[serde(default)]
    pub resources: NodeResources,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    pub cpu: Option<u32>,
    /// Memory quantity, e.g. `16Gi`
    pub memory: Option<String>,
    pub gpu: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Name of a secret in the cluster namespace holding registry credentials
    pub credentials_secret: String,
}

fn at_least<'a>(min: &'a u32) -> impl FnOnce(&u32, &()) -> garde::Result + 'a {
    move |max, _| {
        if max < min {
            return Err(garde::Error::new(format!(
                "maxWorkers ({max}) is below minWorkers ({min})"
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmClusterStatus {
    #[serde(default)]
    pub head_node_status: NodeStatus,
    #[serde(default)]
    pub current_workers: BTreeMap<String, NodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_state: Option<ClusterState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_service_ingress: Option<ServiceIngress>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    Healthy,
    Unhealthy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceIngress {
    pub address: String,
}

/// Lifecycle record of a single VM and the workload process on it
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub vm_state: LifecycleState,
    #[serde(default)]
    pub process_state: LifecycleState,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// State of a VM or of its workload process.
///
/// Persisted as a plain string. Anything outside the four known values is kept
/// as [`LifecycleState::Unrecognized`] so that one corrupted record cannot stop
/// the watch stream from decoding the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LifecycleState {
    #[default]
    Empty,
    Initialized,
    Running,
    Failure,
    Unrecognized(String),
}

impl LifecycleState {
    pub fn as_str(&self) -> &str {
        match self {
            LifecycleState::Empty => "",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::Failure => "failure",
            LifecycleState::Unrecognized(other) => other,
        }
    }
}

impl From<String> for LifecycleState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" => LifecycleState::Empty,
            "initialized" => LifecycleState::Initialized,
            "running" => LifecycleState::Running,
            "failure" => LifecycleState::Failure,
            _ => LifecycleState::Unrecognized(value),
        }
    }
}

impl From<LifecycleState> for String {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Unrecognized(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Empty => f.write_str("empty"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl JsonSchema for LifecycleState {
    fn schema_name() -> Cow<'static, str> {
        "LifecycleState".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

impl VmCluster {
    /// Nonce assigned to the head node, if one has been stored yet
    pub fn head_nonce(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(HEAD_NONCE_LABEL))
            .map(String::as_str)
    }

    /// Name of the head VM, qualified by the nonce when present
    pub fn head_node_name(&self) -> String {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        match self.head_nonce() {
            Some(nonce) if !nonce.is_empty() => format!("{name}-h-{nonce}"),
            _ => format!("{name}-h"),
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == CLUSTER_FINALIZER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_state_round_trips_through_strings() {
        let json = serde_json::to_string(&LifecycleState::Empty).unwrap();
        assert_eq!(json, "\"\"");

        let state: LifecycleState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(state, LifecycleState::Running);

        let state: LifecycleState = serde_json::from_str("\"rebooting\"").unwrap();
        assert_eq!(state, LifecycleState::Unrecognized("rebooting".into()));
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"rebooting\"");
    }

    #[test]
    fn head_node_name_uses_nonce_label() {
        let mut cluster = VmCluster::new("demo", crate::test_support::cluster_spec());
        assert_eq!(cluster.head_node_name(), "demo-h");

        cluster
            .metadata
            .labels
            .get_or_insert_default()
            .insert(HEAD_NONCE_LABEL.to_string(), "x1y2z".to_string());
        assert_eq!(cluster.head_node_name(), "demo-h-x1y2z");
    }

    #[test]
    fn max_workers_below_min_is_rejected() {
        let mut spec = crate::test_support::cluster_spec();
        spec.node_config.min_workers = 3;
        spec.node_config.max_workers = 1;
        assert!(spec.validate().is_err());

        spec.node_config.max_workers = 3;
        assert!(spec.validate().is_ok());
    }
}
