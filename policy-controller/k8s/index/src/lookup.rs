//! Read access to the cluster objects the controller consults while handling events.

use netpol_controller_k8s_api::{Namespace, Pod};

/// Finds namespace objects, first in a local cache and then, on a miss, from the API server.
#[async_trait::async_trait]
pub trait NamespaceSource: Send + Sync + 'static {
    fn cached(&self, name: &str) -> Option<Namespace>;

    /// Queries the API server directly. Returns `Ok(None)` if the namespace does not exist.
    async fn fetch(&self, name: &str) -> anyhow::Result<Option<Namespace>>;
}

/// Lists the pods known in a namespace.
pub trait PodLister: Send + Sync + 'static {
    fn pods(&self, namespace: &str) -> Vec<Pod>;
}
