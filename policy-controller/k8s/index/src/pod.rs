//! Pod predicates that decide which pod IPs belong in a namespace's address set.

use netpol_controller_k8s_api::Pod;
use std::net::IpAddr;
use tracing::warn;

/// Host-network pods share their node's IPs, which must never be treated as pod IPs.
pub fn wants_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

/// A pod that has terminated (successfully or not) no longer owns its IPs.
pub fn is_completed(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

pub fn is_scheduled(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty())
}

/// Whether the pod's IPs should be members of its namespace's address set.
pub fn has_namespace_ips(pod: &Pod) -> bool {
    !wants_host_network(pod) && !is_completed(pod) && is_scheduled(pod)
}

/// Returns the pod's IPs, falling back to the primary pod IP when the list is not populated.
///
/// Unparseable addresses are logged and skipped.
pub fn pod_ips(pod: &Pod) -> Vec<IpAddr> {
    let Some(status) = pod.status.as_ref() else {
        return vec![];
    };

    let ips = match status.pod_ips.as_ref() {
        Some(ips) if !ips.is_empty() => ips.iter().map(|ip| ip.ip.as_str()).collect::<Vec<_>>(),
        _ => status.pod_ip.as_deref().into_iter().collect(),
    };

    ips.into_iter()
        .filter_map(|ip| match ip.parse() {
            Ok(ip) => Some(ip),
            Err(error) => {
                warn!(%error, %ip, "Ignoring invalid pod IP");
                None
            }
        })
        .collect()
}

/// Collects the IPs of every pod that belongs in a namespace's address set.
pub fn namespace_ips<'p>(pods: impl IntoIterator<Item = &'p Pod>) -> Vec<IpAddr> {
    pods.into_iter()
        .filter(|pod| has_namespace_ips(pod))
        .flat_map(pod_ips)
        .collect()
}
