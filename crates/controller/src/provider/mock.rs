//! Scripted [`Provider`] for unit tests.
//!
//! Every operation pops the next scripted response for the VM (or cluster) it
//! is called with and falls back to a healthy default once the script runs
//! out. All calls are recorded in order.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{DeploymentRequest, Provider, ProviderError, ProviderResult, VmObservation};

pub const DEFAULT_INGRESS_ADDRESS: &str = "192.168.10.2";
pub const DEFAULT_VM_ADDRESS: &str = "10.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Deploy(String),
    DeployHeadIngress(String),
    FetchStatus(String),
    Delete(String),
    DeleteAuxiliaryResources(String),
}

#[derive(Default)]
struct State {
    deploy: HashMap<String, VecDeque<ProviderResult<()>>>,
    ingress: HashMap<String, VecDeque<ProviderResult<Option<String>>>>,
    fetch: HashMap<String, VecDeque<ProviderResult<VmObservation>>>,
    delete: HashMap<String, VecDeque<ProviderResult<()>>>,
    auxiliary: HashMap<String, VecDeque<ProviderResult<()>>>,
    calls: Vec<Call>,
    requests: Vec<DeploymentRequest>,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<State>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mock provider state poisoned")
    }

    pub fn script_deploy(&self, vm: &str, result: ProviderResult<()>) -> &Self {
        push(&mut self.state().deploy, vm, result);
        self
    }

    pub fn script_ingress(&self, vm: &str, result: ProviderResult<Option<String>>) -> &Self {
        push(&mut self.state().ingress, vm, result);
        self
    }

    pub fn script_fetch(&self, vm: &str, result: ProviderResult<VmObservation>) -> &Self {
        push(&mut self.state().fetch, vm, result);
        self
    }

    pub fn script_delete(&self, vm: &str, result: ProviderResult<()>) -> &Self {
        push(&mut self.state().delete, vm, result);
        self
    }

    pub fn script_delete_auxiliary(&self, cluster: &str, result: ProviderResult<()>) -> &Self {
        push(&mut self.state().auxiliary, cluster, result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Deployment requests received so far, in call order
    pub fn requests(&self) -> Vec<DeploymentRequest> {
        self.state().requests.clone()
    }
}

fn push<T>(scripts: &mut HashMap<String, VecDeque<T>>, key: &str, value: T) {
    scripts.entry(key.to_string()).or_default().push_back(value);
}

fn pop<T>(scripts: &mut HashMap<String, VecDeque<T>>, key: &str) -> Option<T> {
    scripts.get_mut(key).and_then(VecDeque::pop_front)
}

pub fn observed(ip: &str) -> VmObservation {
    VmObservation {
        ip: Some(ip.to_string()),
        conditions: vec![],
    }
}

pub fn not_found(name: &str) -> ProviderError {
    ProviderError::NotFound {
        kind: "VirtualMachine",
        name: name.to_string(),
    }
}

pub fn already_exists(name: &str) -> ProviderError {
    ProviderError::AlreadyExists {
        kind: "VirtualMachine",
        name: name.to_string(),
    }
}

pub fn unavailable() -> ProviderError {
    ProviderError::Unavailable("connection refused".to_string())
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn deploy(&self, request: &DeploymentRequest) -> ProviderResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Deploy(request.vm_name.clone()));
        state.requests.push(request.clone());
        pop(&mut state.deploy, &request.vm_name).unwrap_or(Ok(()))
    }

    async fn deploy_head_ingress(
        &self,
        request: &DeploymentRequest,
    ) -> ProviderResult<Option<String>> {
        let mut state = self.state();
        state
            .calls
            .push(Call::DeployHeadIngress(request.vm_name.clone()));
        pop(&mut state.ingress, &request.vm_name)
            .unwrap_or_else(|| Ok(Some(DEFAULT_INGRESS_ADDRESS.to_string())))
    }

    async fn fetch_status(&self, _namespace: &str, name: &str) -> ProviderResult<VmObservation> {
        let mut state = self.state();
        state.calls.push(Call::FetchStatus(name.to_string()));
        pop(&mut state.fetch, name).unwrap_or_else(|| Ok(observed(DEFAULT_VM_ADDRESS)))
    }

    async fn delete(&self, _namespace: &str, name: &str) -> ProviderResult<()> {
        let mut state = self.state();
        state.calls.push(Call::Delete(name.to_string()));
        pop(&mut state.delete, name).unwrap_or(Ok(()))
    }

    async fn delete_auxiliary_resources(
        &self,
        _namespace: &str,
        cluster_name: &str,
    ) -> ProviderResult<()> {
        let mut state = self.state();
        state
            .calls
            .push(Call::DeleteAuxiliaryResources(cluster_name.to_string()));
        pop(&mut state.auxiliary, cluster_name).unwrap_or(Ok(()))
    }
}
