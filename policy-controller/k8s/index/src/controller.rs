//! Cluster event handlers.
//!
//! Every handler that touches a namespace's derived state does so through a guard obtained from
//! the `NamespaceStateManager`, and egress firewall operations are only issued while that guard is
//! held. Handlers return errors rather than retrying; redelivery is left to the watch.

use crate::{
    cluster_info::ClusterInfo,
    egress_dns::EgressDns,
    egress_firewall::{self, EgressFirewallReconciler},
    lookup::{NamespaceSource, PodLister},
    namespace::{NamespaceState, NamespaceStateManager},
    node::NodeIndex,
    pod,
};
use anyhow::{anyhow, bail, Result};
use netpol_controller_core::{AclLoggingLevels, AddressSetFactory, Store};
use netpol_controller_k8s_api::{EgressFirewall, Namespace, Node, Pod, ResourceExt};
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, instrument, warn};

pub struct Controller {
    cluster: Arc<ClusterInfo>,
    namespaces: NamespaceStateManager,
    firewalls: EgressFirewallReconciler,
    dns: Arc<EgressDns>,
    nodes: Arc<NodeIndex>,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        cluster: ClusterInfo,
        store: Arc<dyn Store>,
        source: Arc<dyn NamespaceSource>,
        pods: Arc<dyn PodLister>,
    ) -> Self {
        let cluster = Arc::new(cluster);
        let dns = Arc::new(EgressDns::new(
            &cluster.controller_name,
            AddressSetFactory::new(store.clone(), cluster.ipv4_mode, cluster.ipv6_mode),
        ));
        let nodes = Arc::new(NodeIndex::default());
        let firewalls =
            EgressFirewallReconciler::new(cluster.clone(), store.clone(), dns.clone(), nodes.clone());
        let namespaces = NamespaceStateManager::new(cluster.clone(), store, source, pods);
        Self {
            cluster,
            namespaces,
            firewalls,
            dns,
            nodes,
        }
    }

    pub fn cluster(&self) -> &ClusterInfo {
        &self.cluster
    }

    pub fn namespaces(&self) -> &NamespaceStateManager {
        &self.namespaces
    }

    /// Removes the state of namespaces that no longer exist. Called once the initial list of
    /// namespaces is known.
    pub async fn sync_namespaces(&self, namespaces: &[Namespace]) -> Result<()> {
        self.namespaces.sync_all(namespaces).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(ns = %ns.name_any()))]
    pub async fn add_namespace(&self, ns: &Namespace) -> Result<()> {
        self.apply_namespace(ns).await
    }

    #[instrument(skip_all, fields(ns = %ns.name_any()))]
    pub async fn update_namespace(&self, ns: &Namespace) -> Result<()> {
        self.apply_namespace(ns).await
    }

    async fn apply_namespace(&self, ns: &Namespace) -> Result<()> {
        let name = ns.name_any();
        let state = self.namespaces.ensure_locked(&name, Some(ns)).await?;
        self.propagate_acl_logging(&state).await
    }

    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        if self.namespaces.delete_locked(name).await?.is_none() {
            debug!("Namespace was not known");
        }
        Ok(())
    }

    /// Adds the pod's IPs to its namespace's address set, or removes them if the pod no longer
    /// qualifies (e.g. it completed).
    #[instrument(skip_all, fields(ns = ?pod.namespace(), pod = %pod.name_any()))]
    pub async fn add_pod(&self, pod: &Pod) -> Result<()> {
        if pod::wants_host_network(pod) {
            return Ok(());
        }
        if !pod::has_namespace_ips(pod) {
            return self.delete_pod(pod).await;
        }
        let ns = pod
            .namespace()
            .ok_or_else(|| anyhow!("pod must be namespaced"))?;
        let ips = pod::pod_ips(pod);
        if ips.is_empty() {
            return Ok(());
        }

        let state = self.namespaces.ensure_locked_read(&ns, None).await?;
        state.address_set().add_ips(&ips).await?;
        debug!(?ips, "Added pod IPs");
        Ok(())
    }

    #[instrument(skip_all, fields(ns = ?pod.namespace(), pod = %pod.name_any()))]
    pub async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        if pod::wants_host_network(pod) {
            return Ok(());
        }
        let Some(ns) = pod.namespace() else {
            return Ok(());
        };
        let ips = pod::pod_ips(pod);
        if ips.is_empty() {
            return Ok(());
        }
        let Some(state) = self.namespaces.get_locked_read(&ns).await else {
            return Ok(());
        };
        state.address_set().delete_ips(&ips).await?;
        debug!(?ips, "Removed pod IPs");
        Ok(())
    }

    /// Removes the ACLs and DNS address sets left behind by egress firewalls that no longer exist.
    pub async fn sync_egress_firewalls(&self, firewalls: &[EgressFirewall]) -> Result<()> {
        self.firewalls.sync(firewalls).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(ns = ?ef.namespace(), name = %ef.name_any()))]
    pub async fn add_egress_firewall(&self, ef: &EgressFirewall) -> Result<()> {
        self.install_egress_firewall(ef).await
    }

    #[instrument(skip_all, fields(ns = ?ef.namespace(), name = %ef.name_any()))]
    pub async fn update_egress_firewall(&self, ef: &EgressFirewall) -> Result<()> {
        self.install_egress_firewall(ef).await
    }

    async fn install_egress_firewall(&self, ef: &EgressFirewall) -> Result<()> {
        let ns = ef
            .namespace()
            .ok_or_else(|| anyhow!("egress firewall must be namespaced"))?;
        let key = egress_firewall::dependent_key(&ns);

        let mut state = self.namespaces.ensure_locked(&ns, None).await?;
        if ef.name_any() == egress_firewall::POLICY_NAME {
            state.remove_dependent(&key);
        }
        self.firewalls.add(&state, ef).await?;
        state.add_dependent(key);
        Ok(())
    }

    #[instrument(skip_all, fields(ns = ?ef.namespace(), name = %ef.name_any()))]
    pub async fn delete_egress_firewall(&self, ef: &EgressFirewall) -> Result<()> {
        if ef.name_any() != egress_firewall::POLICY_NAME {
            return Ok(());
        }
        let Some(ns) = ef.namespace() else {
            return Ok(());
        };

        match self.namespaces.get_locked(&ns).await {
            Some(mut state) => {
                state.remove_dependent(&egress_firewall::dependent_key(&ns));
                self.firewalls.delete(&ns).await?;
            }
            None => self.firewalls.delete(&ns).await?,
        }
        Ok(())
    }

    /// Indexes a node and recompiles the egress firewalls that select nodes if it changed.
    #[instrument(skip_all, fields(node = %node.name_any()))]
    pub async fn apply_node(&self, node: &Node) -> Result<()> {
        if self.nodes.apply(node) {
            self.resync_node_policies().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_node(&self, name: &str) -> Result<()> {
        if self.nodes.delete(name) {
            self.resync_node_policies().await?;
        }
        Ok(())
    }

    /// Replaces the node index with the complete list of nodes.
    pub async fn sync_nodes(&self, nodes: &[Node]) -> Result<()> {
        self.nodes.reset(nodes);
        self.resync_node_policies().await
    }

    /// Publishes the resolved IPs of a DNS name. Returns false if no egress firewall references
    /// the name.
    #[instrument(skip(self, ips))]
    pub async fn update_dns(&self, dns_name: &str, ips: Vec<IpAddr>) -> Result<bool> {
        Ok(self.dns.update(dns_name, ips).await?)
    }

    /// Returns every DNS name an installed egress firewall references, for the resolver to watch.
    pub async fn dns_names(&self) -> Vec<String> {
        self.dns.names().await
    }

    pub async fn namespace_acl_logging(&self, name: &str) -> AclLoggingLevels {
        self.namespaces.acl_logging(name).await
    }

    async fn propagate_acl_logging(&self, state: &NamespaceState) -> Result<()> {
        if state.has_dependent(&egress_firewall::dependent_key(state.name())) {
            self.firewalls.update_acl_logging(state).await?;
        }
        Ok(())
    }

    async fn resync_node_policies(&self) -> Result<()> {
        let mut failed = 0;
        for ns in self.firewalls.node_selector_namespaces() {
            let Some(state) = self.namespaces.get_locked(&ns).await else {
                continue;
            };
            if let Err(error) = self.firewalls.resync(&state).await {
                warn!(%ns, %error, "Failed to update egress firewall for node change");
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("failed to update {failed} egress firewalls");
        }
        Ok(())
    }
}
