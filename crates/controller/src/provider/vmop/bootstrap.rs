//! Cloud-config handed to each VM at first boot.
//!
//! The document is serialized from typed data. Every node gets its settings in
//! `/etc/vmcluster/node.json`, an env file for the workload container and the
//! commands that pull and start the cluster image. The head starts the cluster
//! process; workers join it.

use serde::Serialize;

use crate::{
    api::NodeResources,
    provider::{DeploymentRequest, NodeRole, ProviderError, ProviderResult},
};

pub(super) const USER_DATA_KEY: &str = "user-data";

const NODE_SETTINGS_PATH: &str = "/etc/vmcluster/node.json";
const NODE_ENV_PATH: &str = "/etc/vmcluster/node.env";
const DOCKER_CONFIG_PATH: &str = "/root/.docker/config.json";
const CONTAINER_NAME: &str = "vmcluster-node";
const DASHBOARD_HOST: &str = "0.0.0.0";

/// Credentials read from the cluster namespace before rendering
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct BootstrapSecrets<'a> {
    /// Head only: lets the autoscaler on the head patch its `VmCluster`
    pub service_account_token: Option<&'a str>,
    /// Contents of a `.dockerconfigjson` for pulling the image
    pub registry_auth: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<Vec<CloudUser>>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CloudUser {
    name: String,
    sudo: String,
}

#[derive(Debug, Serialize)]
struct WriteFile {
    path: String,
    permissions: String,
    content: String,
}

impl WriteFile {
    fn new(path: &str, permissions: &str, content: String) -> Self {
        Self {
            path: path.to_string(),
            permissions: permissions.to_string(),
            content,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeSettings<'a> {
    cluster: &'a str,
    namespace: &'a str,
    role: &'static str,
    node_type: &'a str,
    image: &'a str,
    api_server: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_cert: Option<&'a str>,
    head_address: Option<&'a str>,
    port: u16,
    enable_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    idle_timeout_minutes: Option<u32>,
    resources: Option<&'a NodeResources>,
}

/// How the cluster process is started inside the container
#[derive(Debug, PartialEq)]
enum ProcessStart<'a> {
    Head {
        port: u16,
        setup_commands: &'a [String],
    },
    Worker {
        head_address: &'a str,
        port: u16,
    },
}

impl ProcessStart<'_> {
    fn command(&self) -> String {
        match self {
            ProcessStart::Head {
                port,
                setup_commands,
            } => {
                let start = format!(
                    "ray start --head --port={port} --block --dashboard-host={DASHBOARD_HOST}"
                );
                setup_commands
                    .iter()
                    .map(String::as_str)
                    .chain([start.as_str()])
                    .collect::<Vec<_>>()
                    .join("; ")
            }
            ProcessStart::Worker { head_address, port } => {
                format!("ray start --block --address={head_address}:{port}")
            }
        }
    }
}

/// Single-quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn container_commands(
    image: &str,
    start: &ProcessStart<'_>,
    vm_user: Option<&str>,
) -> Vec<String> {
    let mut commands = vec![];
    if let Some(user) = vm_user {
        commands.push(format!("usermod -aG docker {user}"));
    }
    commands.push(format!("docker pull {}", shell_quote(image)));
    commands.push(format!(
        "docker run --rm -d --name {CONTAINER_NAME} --network host --env-file {NODE_ENV_PATH} \
         -v {NODE_SETTINGS_PATH}:{NODE_SETTINGS_PATH}:ro {} /bin/bash -c {}",
        shell_quote(image),
        shell_quote(&start.command()),
    ));
    commands
}

fn env_file(request: &DeploymentRequest, secrets: &BootstrapSecrets<'_>) -> String {
    let mut lines = vec![
        format!("RAY_USE_TLS={}", u8::from(request.enable_tls)),
        format!("VMCLUSTER_NAME={}", request.cluster_name),
        format!("VMCLUSTER_NAMESPACE={}", request.namespace),
        format!("VMCLUSTER_API_SERVER={}", request.api_server.location),
    ];
    if let Some(token) = secrets.service_account_token {
        lines.push(format!("SVC_ACCOUNT_TOKEN={token}"));
    }
    lines.join("\n") + "\n"
}

pub(super) fn render_user_data(
    request: &DeploymentRequest,
    secrets: &BootstrapSecrets<'_>,
) -> ProviderResult<String> {
    let port = request.head_node.port();
    let (role, head_address, start) = match &request.role {
        NodeRole::Head => {
            if secrets.service_account_token.is_none() {
                return Err(ProviderError::Invalid(format!(
                    "head node `{}` needs a service account token",
                    request.vm_name
                )));
            }
            (
                "head",
                request.ingress_address.as_deref(),
                ProcessStart::Head {
                    port,
                    setup_commands: &request.head_node.setup_commands,
                },
            )
        }
        NodeRole::Worker { head_ip } => {
            let head_address = head_ip.as_deref().ok_or_else(|| {
                ProviderError::Invalid(format!(
                    "worker `{}` has no head address to join",
                    request.vm_name
                ))
            })?;
            (
                "worker",
                Some(head_address),
                ProcessStart::Worker { head_address, port },
            )
        }
    };

    let settings = NodeSettings {
        cluster: &request.cluster_name,
        namespace: &request.namespace,
        role,
        node_type: &request.node_type,
        image: &request.image,
        api_server: &request.api_server.location,
        ca_cert: request.api_server.ca_cert.as_deref(),
        head_address,
        port,
        enable_tls: request.enable_tls,
        idle_timeout_minutes: request.node_config.idle_timeout_minutes,
        resources: request
            .node_config
            .node_types
            .get(&request.node_type)
            .map(|t| &t.resources),
    };

    let mut write_files = vec![
        WriteFile::new(
            NODE_SETTINGS_PATH,
            "0644",
            serde_json::to_string_pretty(&settings)
                .map_err(|e| ProviderError::Serialization(e.to_string()))?,
        ),
        // Holds the service account token on the head
        WriteFile::new(NODE_ENV_PATH, "0600", env_file(request, secrets)),
    ];
    if let Some(auth) = secrets.registry_auth {
        write_files.push(WriteFile::new(DOCKER_CONFIG_PATH, "0600", auth.to_string()));
    }

    let vm_user = request.node_config.vm_user.as_deref();
    let config = CloudConfig {
        users: vm_user.map(|name| {
            vec![CloudUser {
                name: name.to_string(),
                sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
            }]
        }),
        write_files,
        runcmd: container_commands(&request.image, &start, vm_user),
    };

    let body = serde_yaml_ng::to_string(&config)
        .map_err(|e| ProviderError::Serialization(e.to_string()))?;
    Ok(format!("#cloud-config\n{body}"))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{api::RegistryConfig, test_support::deployment_request};

    const TOKEN: &str = "eyJhbGciOiJSUzI1NiJ9.head";

    #[derive(Debug, Deserialize)]
    struct RenderedFile {
        path: String,
        permissions: String,
        content: String,
    }

    #[derive(Debug, Deserialize)]
    struct Rendered {
        write_files: Vec<RenderedFile>,
        runcmd: Vec<String>,
    }

    fn parse(user_data: &str) -> Rendered {
        let body = user_data.strip_prefix("#cloud-config\n").unwrap();
        serde_yaml_ng::from_str(body).unwrap()
    }

    fn file<'a>(rendered: &'a Rendered, path: &str) -> &'a RenderedFile {
        rendered.write_files.iter().find(|f| f.path == path).unwrap()
    }

    fn head_secrets() -> BootstrapSecrets<'static> {
        BootstrapSecrets {
            service_account_token: Some(TOKEN),
            registry_auth: None,
        }
    }

    fn worker(head_ip: Option<&str>) -> DeploymentRequest {
        deployment_request(
            "worker-1",
            NodeRole::Worker {
                head_ip: head_ip.map(str::to_string),
            },
        )
    }

    #[test]
    fn head_starts_the_cluster_process_with_its_token() {
        let mut request = deployment_request("demo-h-abcde", NodeRole::Head);
        request.head_node.setup_commands = vec!["pip install torch".to_string()];
        request.ingress_address = Some("192.168.10.2".to_string());

        let user_data = render_user_data(&request, &head_secrets()).unwrap();
        assert!(user_data.starts_with("#cloud-config\n"));

        let rendered = parse(&user_data);
        let env = file(&rendered, NODE_ENV_PATH);
        assert_eq!(env.permissions, "0600");
        assert!(env.content.contains(&format!("SVC_ACCOUNT_TOKEN={TOKEN}")));
        assert!(file(&rendered, NODE_SETTINGS_PATH).content.contains("192.168.10.2"));

        assert_eq!(rendered.runcmd[0], format!("docker pull '{}'", request.image));
        let run = &rendered.runcmd[1];
        assert!(run.starts_with("docker run"));
        assert!(run.contains(&request.image));
        assert!(run.contains(&format!("--env-file {NODE_ENV_PATH}")));
        assert!(run.contains("pip install torch; ray start --head --port=6379 --block"));
    }

    #[test]
    fn head_without_token_is_rejected() {
        let request = deployment_request("demo-h-abcde", NodeRole::Head);
        let err = render_user_data(&request, &BootstrapSecrets::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Invalid(_)));
    }

    #[test]
    fn worker_joins_the_head() {
        let mut request = worker(Some("10.0.0.5"));
        request.head_node.port = Some(6380);
        request.head_node.setup_commands = vec!["pip install torch".to_string()];

        let rendered = parse(&render_user_data(&request, &BootstrapSecrets::default()).unwrap());

        let run = rendered.runcmd.last().unwrap();
        assert!(run.contains("ray start --block --address=10.0.0.5:6380"));
        assert!(!run.contains("--head"));
        // Setup commands belong to the head
        assert!(!run.contains("pip install torch"));
        assert!(!file(&rendered, NODE_ENV_PATH).content.contains("SVC_ACCOUNT_TOKEN"));
    }

    #[test]
    fn worker_without_head_address_is_rejected() {
        let err = render_user_data(&worker(None), &BootstrapSecrets::default()).unwrap_err();
        assert!(err.to_string().contains("no head address"));
    }

    #[test]
    fn registry_credentials_are_written_for_docker() {
        let mut request = worker(Some("10.0.0.5"));
        request.registry = Some(RegistryConfig {
            credentials_secret: "regcred".to_string(),
        });
        let auth = r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;
        let secrets = BootstrapSecrets {
            service_account_token: None,
            registry_auth: Some(auth),
        };

        let rendered = parse(&render_user_data(&request, &secrets).unwrap());
        let docker_config = file(&rendered, DOCKER_CONFIG_PATH);
        assert_eq!(docker_config.permissions, "0600");
        assert_eq!(docker_config.content, auth);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
        assert_eq!(
            ProcessStart::Worker {
                head_address: "10.0.0.5",
                port: 6379
            }
            .command(),
            "ray start --block --address=10.0.0.5:6379"
        );
    }
}
