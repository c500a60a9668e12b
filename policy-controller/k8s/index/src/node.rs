//! Node labels and internal IPs, used to expand `nodeSelector` egress firewall destinations.

use ahash::AHashMap as HashMap;
use netpol_controller_k8s_api::{self as k8s, labels::Labels, ResourceExt, Selector};
use parking_lot::RwLock;
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct NodeIndex {
    index: RwLock<HashMap<String, Node>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Node {
    labels: Labels,
    ips: BTreeSet<IpAddr>,
}

// === impl NodeIndex ===

impl NodeIndex {
    /// Records a node, returning true if its labels or IPs changed.
    pub fn apply(&self, node: &k8s::Node) -> bool {
        let name = node.name_unchecked();
        let node = Node {
            labels: node.labels().clone().into(),
            ips: internal_ips(node),
        };
        let mut index = self.index.write();
        if index.get(&name) == Some(&node) {
            return false;
        }
        debug!(%name, ips = ?node.ips, "Indexed node");
        index.insert(name, node);
        true
    }

    /// Forgets a node, returning true if it was known.
    pub fn delete(&self, name: &str) -> bool {
        self.index.write().remove(name).is_some()
    }

    /// Replaces the index with exactly the given nodes.
    pub fn reset(&self, nodes: &[k8s::Node]) {
        let index = nodes
            .iter()
            .map(|node| {
                let state = Node {
                    labels: node.labels().clone().into(),
                    ips: internal_ips(node),
                };
                (node.name_unchecked(), state)
            })
            .collect();
        *self.index.write() = index;
    }

    /// Returns the sorted IPs of every node the selector matches.
    pub fn matching_ips(&self, selector: &Selector) -> Vec<IpAddr> {
        self.index
            .read()
            .values()
            .filter(|node| selector.matches(&node.labels))
            .flat_map(|node| node.ips.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn internal_ips(node: &k8s::Node) -> BTreeSet<IpAddr> {
    node.status
        .iter()
        .flat_map(|status| status.addresses.iter().flatten())
        .filter(|addr| addr.type_ == "InternalIP")
        .filter_map(|addr| match addr.address.parse() {
            Ok(ip) => Some(ip),
            Err(error) => {
                warn!(%error, address = %addr.address, "Ignoring invalid node address");
                None
            }
        })
        .collect()
}
