//! Fixtures shared by unit tests.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::{
    api::{
        ApiServerInfo, HEAD_NONCE_LABEL, HeadNodeConfig, NodeConfig, NodeResources, NodeType,
        VmCluster, VmClusterSpec,
    },
    provider::{DeploymentRequest, NodeRole},
};

pub const NAMESPACE: &str = "compute";
pub const NONCE: &str = "a1b2c";

pub fn cluster_spec() -> VmClusterSpec {
    VmClusterSpec {
        image: "rayproject/ray:2.9.0".to_string(),
        api_server: ApiServerInfo {
            location: "https://10.0.0.1:6443".to_string(),
            ca_cert: None,
        },
        head_node: HeadNodeConfig {
            node_type: "cpu".to_string(),
            setup_commands: vec![],
            port: None,
        },
        node_config: NodeConfig {
            vm_image: "ubuntu-22.04".to_string(),
            storage_class: "wcp-storage".to_string(),
            vm_user: None,
            min_workers: 1,
            max_workers: 4,
            idle_timeout_minutes: Some(5),
            node_types: BTreeMap::from([(
                "cpu".to_string(),
                NodeType {
                    vm_class: "best-effort-small".to_string(),
                    min_workers: 0,
                    max_workers: 4,
                    resources: NodeResources::default(),
                },
            )]),
        },
        desired_workers: BTreeMap::new(),
        enable_tls: false,
        registry: None,
    }
}

/// A cluster as it looks after its first reconcile stored finalizer and nonce
pub fn cluster(name: &str) -> VmCluster {
    let mut cluster = VmCluster::new(name, cluster_spec());
    cluster.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        labels: Some([(HEAD_NONCE_LABEL.to_string(), NONCE.to_string())].into()),
        finalizers: Some(vec![crate::api::CLUSTER_FINALIZER.to_string()]),
        ..Default::default()
    };
    cluster
}

pub fn deployment_request(vm_name: &str, role: NodeRole) -> DeploymentRequest {
    let spec = cluster_spec();
    DeploymentRequest {
        namespace: NAMESPACE.to_string(),
        cluster_name: "demo".to_string(),
        vm_name: vm_name.to_string(),
        role,
        node_type: "cpu".to_string(),
        image: spec.image,
        api_server: spec.api_server,
        head_node: spec.head_node,
        node_config: spec.node_config,
        enable_tls: spec.enable_tls,
        registry: spec.registry,
        ingress_address: None,
        owner: None,
    }
}
