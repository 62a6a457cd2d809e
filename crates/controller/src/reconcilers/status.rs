//! Writes back to the `VmCluster` object.
//!
//! Status is persisted as a JSON patch computed against the snapshot taken at
//! the start of the cycle, so only fields the cycle actually changed are sent.

use rand::Rng;
use serde_json::{Map, Value, json};

use crate::{
    Result,
    api::{CLUSTER_FINALIZER, HEAD_NONCE_LABEL, VmCluster},
};

const NONCE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NONCE_LENGTH: usize = 5;

pub fn generate_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LENGTH)
        .map(|_| NONCE_ALPHABET[rng.random_range(0..NONCE_ALPHABET.len())] as char)
        .collect()
}

/// Add the finalizer and head nonce to `cluster` when either is missing and
/// return the merge patch that persists them.
pub fn ensure_metadata(cluster: &mut VmCluster) -> Option<Value> {
    let mut metadata = Map::new();

    if !cluster.has_finalizer() {
        let finalizers = cluster.metadata.finalizers.get_or_insert_default();
        finalizers.push(CLUSTER_FINALIZER.to_string());
        metadata.insert("finalizers".to_string(), json!(finalizers));
    }

    if cluster.head_nonce().is_none() {
        let nonce = generate_nonce();
        cluster
            .metadata
            .labels
            .get_or_insert_default()
            .insert(HEAD_NONCE_LABEL.to_string(), nonce.clone());
        metadata.insert("labels".to_string(), json!({ HEAD_NONCE_LABEL: nonce }));
    }

    if metadata.is_empty() {
        return None;
    }
    // The finalizer list is replaced wholesale, so guard it with the version we read
    if let Some(version) = &cluster.metadata.resource_version {
        metadata.insert("resourceVersion".to_string(), json!(version));
    }
    Some(json!({ "metadata": metadata }))
}

/// Merge patch dropping our finalizer, or `None` when it is already gone
pub fn finalizer_removal(cluster: &VmCluster) -> Option<Value> {
    if !cluster.has_finalizer() {
        return None;
    }

    let remaining: Vec<&String> = cluster
        .metadata
        .finalizers
        .iter()
        .flatten()
        .filter(|f| *f != CLUSTER_FINALIZER)
        .collect();

    let mut metadata = json!({ "finalizers": remaining });
    if let Some(version) = &cluster.metadata.resource_version {
        metadata["resourceVersion"] = json!(version);
    }
    Some(json!({ "metadata": metadata }))
}

fn status_document(cluster: &VmCluster) -> Result<Value> {
    let mut document = Map::new();
    if let Some(status) = &cluster.status {
        document.insert("status".to_string(), serde_json::to_value(status)?);
    }
    Ok(Value::Object(document))
}

/// JSON patch turning the snapshot's status into the working copy's status,
/// or `None` when the cycle changed nothing
pub fn status_patch(snapshot: &VmCluster, working: &VmCluster) -> Result<Option<json_patch::Patch>> {
    let patch = json_patch::diff(&status_document(snapshot)?, &status_document(working)?);
    if patch.0.is_empty() {
        return Ok(None);
    }
    Ok(Some(patch))
}
