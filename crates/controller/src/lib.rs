/// K8s API objects
pub mod api;

/// Reconciler runtime settings
pub mod config;

/// Infrastructure backends the reconcilers drive
pub mod provider;

/// K8s reconciliation logic
pub mod reconcilers;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Primary IPv4 address not found for node {0}")]
    AddressNotFound(String),
    #[error("Invalid node status {0:?}")]
    InvalidNodeStatus(String),
    #[error("Reconcile cycle exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("Missing field in object reference")]
    MissingField,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
