//! [`Provider`] backed by the vSphere VM operator running in the same cluster.

use std::collections::BTreeMap;

use garde::Validate;
use k8s_openapi::api::{core::v1::Secret, storage::v1::StorageClass};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
};
use tracing::{Level, instrument};

use super::{DeploymentRequest, Provider, ProviderError, ProviderResult, VmObservation};

mod bootstrap;
mod rbac;
pub mod resources;

use bootstrap::BootstrapSecrets;
use resources::{
    CloudInitBootstrap, SecretKeyRef, VirtualMachine, VirtualMachineBootstrap,
    VirtualMachineClass, VirtualMachineImage, VirtualMachineService, VirtualMachineServicePort,
    VirtualMachineServiceSpec, VirtualMachineSpec,
};

const MANAGER_NAME: &str = "vmcluster-controller";

const CLUSTER_LABEL: &str = "vmcluster.dev/cluster";
const NODE_LABEL: &str = "vmcluster.dev/node";

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

const DASHBOARD_PORT: i32 = 8265;
const CLIENT_PORT: i32 = 10001;
const SSH_PORT: i32 = 22;

pub struct VmOperatorProvider {
    client: Client,
}

impl VmOperatorProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn vm_services(&self, namespace: &str) -> Api<VirtualMachineService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Store the cloud-config for a node in its own secret
    async fn apply_bootstrap_secret(
        &self,
        request: &DeploymentRequest,
        secrets: &BootstrapSecrets<'_>,
    ) -> ProviderResult<String> {
        let name = format!("{}-bootstrap", request.vm_name);
        let api = Api::<Secret>::namespaced(self.client.clone(), &request.namespace);

        api.patch(
            &name,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Apply(Secret {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(request.namespace.clone()),
                    labels: Some(cluster_labels(&request.cluster_name)),
                    owner_references: request.owner.clone().map(|o| vec![o]),
                    ..Default::default()
                },
                string_data: Some(
                    [(
                        bootstrap::USER_DATA_KEY.to_string(),
                        bootstrap::render_user_data(request, secrets)?,
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
        )
        .await?;

        Ok(name)
    }

    /// Image, storage class and VM class must all exist before a VM can be
    /// created from them
    async fn check_infrastructure(
        &self,
        request: &DeploymentRequest,
        vm_class: &str,
    ) -> ProviderResult<()> {
        let namespace = &request.namespace;
        let node_config = &request.node_config;

        let image = Api::<VirtualMachineImage>::namespaced(self.client.clone(), namespace)
            .get_opt(&node_config.vm_image)
            .await?;
        require("VM image", &node_config.vm_image, image)?;

        let storage_class = Api::<StorageClass>::all(self.client.clone())
            .get_opt(&node_config.storage_class)
            .await?;
        require("Storage class", &node_config.storage_class, storage_class)?;

        let class = Api::<VirtualMachineClass>::namespaced(self.client.clone(), namespace)
            .get_opt(vm_class)
            .await?;
        require("VM class", vm_class, class)?;

        Ok(())
    }

    async fn read_registry_auth(
        &self,
        request: &DeploymentRequest,
    ) -> ProviderResult<Option<String>> {
        let Some(registry) = &request.registry else {
            return Ok(None);
        };
        let name = &registry.credentials_secret;
        let secret = Api::<Secret>::namespaced(self.client.clone(), &request.namespace)
            .get_opt(name)
            .await?;
        docker_config_from_secret(name, secret.as_ref()).map(Some)
    }
}

fn require<T>(kind: &str, name: &str, found: Option<T>) -> ProviderResult<T> {
    found.ok_or_else(|| ProviderError::Invalid(format!("{kind} `{name}` does not exist")))
}

fn docker_config_from_secret(name: &str, secret: Option<&Secret>) -> ProviderResult<String> {
    let secret = require("Registry credentials secret", name, secret)?;
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(DOCKER_CONFIG_KEY))
        .and_then(|config| String::from_utf8(config.0.clone()).ok())
        .ok_or_else(|| {
            ProviderError::Invalid(format!(
                "Registry credentials secret `{name}` has no {DOCKER_CONFIG_KEY} entry"
            ))
        })
}

pub(crate) fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    [(CLUSTER_LABEL.to_string(), cluster_name.to_string())].into()
}

fn classify(error: kube::Error, kind: &'static str, name: &str) -> ProviderError {
    match error {
        kube::Error::Api(ref response) if response.code == 404 => ProviderError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ref response) if response.code == 409 => ProviderError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        other => ProviderError::Kube(other),
    }
}

pub(crate) fn ignore_not_found<T>(result: Result<T, kube::Error>) -> ProviderResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait::async_trait]
impl Provider for VmOperatorProvider {
    #[instrument(level = Level::DEBUG, skip_all, fields(vm = %request.vm_name))]
    async fn deploy(&self, request: &DeploymentRequest) -> ProviderResult<()> {
        request.validate()?;

        let node_type = request
            .node_config
            .node_types
            .get(&request.node_type)
            .ok_or_else(|| {
                ProviderError::Invalid(format!(
                    "Invalid node type `{}` requested",
                    request.node_type
                ))
            })?;

        self.check_infrastructure(request, &node_type.vm_class).await?;

        let token = if request.is_head() {
            rbac::apply_head_rbac(
                &self.client,
                &request.namespace,
                &request.cluster_name,
                request.owner.as_ref(),
            )
            .await?;
            let token =
                rbac::read_head_token(&self.client, &request.namespace, &request.cluster_name)
                    .await?;
            Some(token)
        } else {
            None
        };
        let registry_auth = self.read_registry_auth(request).await?;

        let secrets = BootstrapSecrets {
            service_account_token: token.as_deref(),
            registry_auth: registry_auth.as_deref(),
        };
        let secret_name = self.apply_bootstrap_secret(request, &secrets).await?;

        let mut labels = cluster_labels(&request.cluster_name);
        labels.insert(NODE_LABEL.to_string(), request.vm_name.clone());

        let vm = VirtualMachine {
            metadata: ObjectMeta {
                name: Some(request.vm_name.clone()),
                namespace: Some(request.namespace.clone()),
                labels: Some(labels),
                owner_references: request.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: VirtualMachineSpec {
                image_name: request.node_config.vm_image.clone(),
                class_name: node_type.vm_class.clone(),
                storage_class: Some(request.node_config.storage_class.clone()),
                power_state: Some("PoweredOn".to_string()),
                bootstrap: Some(VirtualMachineBootstrap {
                    cloud_init: Some(CloudInitBootstrap {
                        raw_cloud_config: Some(SecretKeyRef {
                            name: secret_name,
                            key: bootstrap::USER_DATA_KEY.to_string(),
                        }),
                    }),
                }),
            },
            status: None,
        };

        self.vms(&request.namespace)
            .create(&PostParams::default(), &vm)
            .await
            .map_err(|e| classify(e, "VirtualMachine", &request.vm_name))?;

        tracing::info!(vm = %request.vm_name, class = %node_type.vm_class, "Created virtual machine");
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip_all, fields(vm = %request.vm_name))]
    async fn deploy_head_ingress(
        &self,
        request: &DeploymentRequest,
    ) -> ProviderResult<Option<String>> {
        let services = self.vm_services(&request.namespace);

        if let Some(service) = services.get_opt(&request.vm_name).await? {
            return Ok(service.ingress_address());
        }

        let port = |name: &str, port: i32| VirtualMachineServicePort {
            name: name.to_string(),
            protocol: "TCP".to_string(),
            port,
            target_port: port,
        };

        let service = VirtualMachineService {
            metadata: ObjectMeta {
                name: Some(request.vm_name.clone()),
                namespace: Some(request.namespace.clone()),
                labels: Some(cluster_labels(&request.cluster_name)),
                owner_references: request.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: VirtualMachineServiceSpec {
                type_: "LoadBalancer".to_string(),
                ports: vec![
                    port("head", i32::from(request.head_node.port())),
                    port("dashboard", DASHBOARD_PORT),
                    port("client", CLIENT_PORT),
                    port("ssh", SSH_PORT),
                ],
                selector: [(NODE_LABEL.to_string(), request.vm_name.clone())].into(),
            },
            status: None,
        };

        match services.create(&PostParams::default(), &service).await {
            Ok(_) => tracing::info!(service = %request.vm_name, "Created head load balancer"),
            Err(e) => match classify(e, "VirtualMachineService", &request.vm_name) {
                ProviderError::AlreadyExists { .. } => {}
                other => return Err(other),
            },
        }

        // Freshly created load balancers never have an address yet
        Ok(None)
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn fetch_status(&self, namespace: &str, name: &str) -> ProviderResult<VmObservation> {
        let vm = self
            .vms(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, "VirtualMachine", name))?;

        Ok(VmObservation {
            ip: vm.primary_ip(),
            conditions: vm.status.map(|s| s.conditions).unwrap_or_default(),
        })
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        let dp = DeleteParams::default();

        ignore_not_found(self.vm_services(namespace).delete(name, &dp).await)?;
        ignore_not_found(self.vms(namespace).delete(name, &dp).await)?;

        tracing::info!(vm = name, "Deleted virtual machine");
        Ok(())
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn delete_auxiliary_resources(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> ProviderResult<()> {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let selector = format!("{CLUSTER_LABEL}={cluster_name}");

        ignore_not_found(
            secrets
                .delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
                .await,
        )?;
        rbac::delete_head_rbac(&self.client, namespace, cluster_name).await?;

        Ok(())
    }
}
