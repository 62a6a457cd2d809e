//! Minimal bindings for the vm-operator resources the provider manages.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::Condition;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "vmoperator.vmware.com",
    version = "v1alpha2",
    kind = "VirtualMachine",
    namespaced
)]
#[kube(status = "VirtualMachineStatus")]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    pub image_name: String,
    pub class_name: String,
    pub storage_class: Option<String>,
    pub power_state: Option<String>,
    pub bootstrap: Option<VirtualMachineBootstrap>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBootstrap {
    pub cloud_init: Option<CloudInitBootstrap>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitBootstrap {
    pub raw_cloud_config: Option<SecretKeyRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    pub network: Option<VirtualMachineNetworkStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct VirtualMachineNetworkStatus {
    #[serde(rename = "primaryIP4")]
    pub primary_ip4: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "vmoperator.vmware.com",
    version = "v1alpha2",
    kind = "VirtualMachineService",
    namespaced
)]
#[kube(status = "VirtualMachineServiceStatus")]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineServiceSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub ports: Vec<VirtualMachineServicePort>,
    pub selector: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineServicePort {
    pub name: String,
    pub protocol: String,
    pub port: i32,
    pub target_port: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineServiceStatus {
    pub load_balancer: Option<LoadBalancerStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct LoadBalancerIngress {
    pub ip: Option<String>,
    pub hostname: Option<String>,
}

/// Only looked up to confirm a node's image exists before deploying it
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "vmoperator.vmware.com",
    version = "v1alpha2",
    kind = "VirtualMachineImage",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImageSpec {
    #[serde(rename = "imageID")]
    pub image_id: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "vmoperator.vmware.com",
    version = "v1alpha2",
    kind = "VirtualMachineClass",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClassSpec {
    pub hardware: Option<VirtualMachineClassHardware>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct VirtualMachineClassHardware {
    pub cpus: Option<i64>,
    pub memory: Option<String>,
}

impl VirtualMachineService {
    /// First address the load balancer has published, if any
    pub fn ingress_address(&self) -> Option<String> {
        self.status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .iter()
            .find_map(|ingress| {
                [ingress.ip.as_deref(), ingress.hostname.as_deref()]
                    .into_iter()
                    .flatten()
                    .find(|address| !address.is_empty())
            })
            .map(str::to_string)
    }
}

impl VirtualMachine {
    pub fn primary_ip(&self) -> Option<String> {
        self.status
            .as_ref()?
            .network
            .as_ref()?
            .primary_ip4
            .clone()
            .filter(|ip| !ip.is_empty())
    }
}
