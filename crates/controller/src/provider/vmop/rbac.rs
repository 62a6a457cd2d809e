use k8s_openapi::{
    api::{
        core::v1::{Secret, ServiceAccount},
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    Api, Client,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams},
};
use tracing::{Level, instrument};

use super::{MANAGER_NAME, cluster_labels, ignore_not_found};
use crate::provider::{ProviderError, ProviderResult};

const TOKEN_KEY: &str = "token";

pub(super) fn head_account_name(cluster_name: &str) -> String {
    format!("{cluster_name}-head")
}

fn rule(resource: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["vmcluster.dev".to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Give the head node an identity that may read its cluster and write
/// `desiredWorkers` back, which is how the autoscaler on the head scales the fleet
#[instrument(level = Level::DEBUG, skip(client, owner))]
pub(super) async fn apply_head_rbac(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    owner: Option<&OwnerReference>,
) -> ProviderResult<()> {
    let service_accounts = Api::<ServiceAccount>::namespaced(client.clone(), namespace);
    let roles = Api::<Role>::namespaced(client.clone(), namespace);
    let role_bindings = Api::<RoleBinding>::namespaced(client.clone(), namespace);
    let secrets = Api::<Secret>::namespaced(client.clone(), namespace);

    let pp = PatchParams::apply(MANAGER_NAME);
    let name = head_account_name(cluster_name);
    let metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.to_string()),
        labels: Some(cluster_labels(cluster_name)),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    };

    roles
        .patch(
            &name,
            &pp,
            &Patch::Apply(Role {
                metadata: metadata.clone(),
                rules: Some(vec![
                    rule("vmclusters", &["get", "list", "watch", "patch", "update"]),
                    rule("vmclusters/status", &["get"]),
                ]),
            }),
        )
        .await?;

    service_accounts
        .patch(
            &name,
            &pp,
            &Patch::Apply(ServiceAccount {
                metadata: metadata.clone(),
                ..Default::default()
            }),
        )
        .await?;

    role_bindings
        .patch(
            &name,
            &pp,
            &Patch::Apply(RoleBinding {
                metadata: metadata.clone(),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "Role".to_string(),
                    name: name.clone(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: name.clone(),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                }]),
            }),
        )
        .await?;

    secrets
        .patch(
            &name,
            &pp,
            &Patch::Apply(Secret {
                metadata: ObjectMeta {
                    annotations: Some(
                        [(
                            "kubernetes.io/service-account.name".to_string(),
                            name.clone(),
                        )]
                        .into(),
                    ),
                    ..metadata
                },
                type_: Some("kubernetes.io/service-account-token".to_string()),
                ..Default::default()
            }),
        )
        .await?;

    Ok(())
}

/// Token the control plane issued into the head's service account secret
pub(super) fn token_from_secret(secret: &Secret) -> Option<String> {
    let token = secret.data.as_ref()?.get(TOKEN_KEY)?;
    String::from_utf8(token.0.clone())
        .ok()
        .filter(|token| !token.is_empty())
}

/// Read the head's service account token. The token controller fills the
/// secret asynchronously, so a missing token is retried on a later cycle.
#[instrument(level = Level::DEBUG, skip(client))]
pub(super) async fn read_head_token(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> ProviderResult<String> {
    let name = head_account_name(cluster_name);
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(&name)
        .await?;

    secret.as_ref().and_then(token_from_secret).ok_or_else(|| {
        ProviderError::Unavailable(format!(
            "service account token in secret `{name}` has not been issued yet"
        ))
    })
}

#[instrument(level = Level::DEBUG, skip(client))]
pub(super) async fn delete_head_rbac(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
) -> ProviderResult<()> {
    let name = head_account_name(cluster_name);
    let dp = DeleteParams::default();

    ignore_not_found(
        Api::<Secret>::namespaced(client.clone(), namespace)
            .delete(&name, &dp)
            .await,
    )?;
    ignore_not_found(
        Api::<RoleBinding>::namespaced(client.clone(), namespace)
            .delete(&name, &dp)
            .await,
    )?;
    ignore_not_found(
        Api::<ServiceAccount>::namespaced(client.clone(), namespace)
            .delete(&name, &dp)
            .await,
    )?;
    ignore_not_found(
        Api::<Role>::namespaced(client.clone(), namespace)
            .delete(&name, &dp)
            .await,
    )?;

    Ok(())
}
