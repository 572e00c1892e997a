use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::file_format::Dataset;

/// Holds the loaded dataset and lets requests wait until there is one.
///
/// Waiting never times out: if no dataset is ever published, waiters stay
/// suspended.
pub struct ReadinessGate {
    dataset: watch::Sender<Option<Arc<Dataset>>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        ReadinessGate::new()
    }
}

impl ReadinessGate {
    pub fn new() -> ReadinessGate {
        let (dataset, _) = watch::channel(None);
        ReadinessGate { dataset }
    }

    /// Make `dataset` current, replacing any earlier one, and wake everyone
    /// waiting on it.
    pub fn publish(&self, dataset: Arc<Dataset>) {
        let previous = self.dataset.send_replace(Some(dataset));
        trace!(replaced = previous.is_some(), "published dataset");
    }

    pub fn current(&self) -> Option<Arc<Dataset>> {
        self.dataset.borrow().clone()
    }

    pub async fn wait_ready(&self) -> Arc<Dataset> {
        let mut rx = self.dataset.subscribe();
        let ready = match rx.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            // Only possible once the sender is gone, and `self` owns it.
            Err(_) => None,
        };
        match ready {
            Some(dataset) => dataset,
            None => std::future::pending().await,
        }
    }
}
