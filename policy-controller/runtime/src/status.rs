use netpol_controller_k8s_api::{self as k8s, EgressFirewall, EgressFirewallStatus};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// The field manager recorded on status patches.
const FIELD_MANAGER: &str = "netpol-controller";

/// Writes egress firewall statuses back to the API server.
pub struct Controller {
    client: k8s::Client,
    updates: UnboundedReceiver<Update>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub namespace: String,
    pub name: String,
    pub status: EgressFirewallStatus,
}

/// Queues status updates for the status controller.
#[derive(Clone, Debug)]
pub struct Updates(UnboundedSender<Update>);

// === impl Controller ===

impl Controller {
    pub fn new(client: k8s::Client, updates: UnboundedReceiver<Update>) -> Self {
        Self { client, updates }
    }

    pub async fn process_updates(mut self) {
        let patch_params = k8s::PatchParams::apply(FIELD_MANAGER);
        while let Some(Update {
            namespace,
            name,
            status,
        }) = self.updates.recv().await
        {
            let api = k8s::Api::<EgressFirewall>::namespaced(self.client.clone(), &namespace);
            let patch = k8s::Patch::Merge(serde_json::json!({ "status": &status }));
            match api.patch_status(&name, &patch_params, &patch).await {
                Ok(_) => {
                    debug!(ns = %namespace, %name, status = ?status.status, "Patched EgressFirewall status")
                }
                Err(error) => {
                    warn!(ns = %namespace, %name, %error, "Failed to patch EgressFirewall status")
                }
            }
        }
    }
}

// === impl Updates ===

impl Updates {
    pub fn new(tx: UnboundedSender<Update>) -> Self {
        Self(tx)
    }

    /// Queues an update unless the resource already reports `status`.
    pub fn report(&self, ef: &EgressFirewall, status: EgressFirewallStatus) {
        if ef.status.as_ref() == Some(&status) {
            return;
        }
        let (Some(namespace), Some(name)) = (ef.metadata.namespace.clone(), ef.metadata.name.clone())
        else {
            return;
        };
        if self
            .0
            .send(Update {
                namespace,
                name,
                status,
            })
            .is_err()
        {
            debug!("Status controller has shut down");
        }
    }
}
