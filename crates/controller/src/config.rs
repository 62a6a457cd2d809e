use std::time::Duration;

/// Settings shared by every reconcile cycle
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only watch clusters in this namespace when set
    pub namespace: Option<String>,
    /// Delay before the next cycle after a successful reconcile
    pub requeue_interval: Duration,
    /// Delay before retrying a failed reconcile
    pub error_requeue: Duration,
    /// Upper bound on a single cycle, provider calls included
    pub cycle_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_interval: Duration::from_secs(60),
            error_requeue: Duration::from_secs(10),
            cycle_timeout: Duration::from_secs(300),
        }
    }
}
