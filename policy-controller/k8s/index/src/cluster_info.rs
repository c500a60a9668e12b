use netpol_controller_core::IpNet;

/// Holds cluster-wide controller configuration.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Recorded as the owner of every row this controller writes.
    pub controller_name: String,

    /// Networks including PodIPs in this cluster. Egress firewall rules never apply to traffic
    /// destined to these networks.
    pub cluster_subnets: Vec<IpNet>,

    pub ipv4_mode: bool,
    pub ipv6_mode: bool,

    /// When disabled, namespace ACL-logging annotations are ignored.
    pub acl_logging_enabled: bool,

    /// When disabled, namespace multicast annotations are ignored.
    pub multicast_support: bool,

    pub egress_firewall_enabled: bool,

    /// The port group that every pod's logical port belongs to. Egress firewall ACLs attach here.
    pub cluster_port_group: String,
}

impl ClusterInfo {
    /// Derives the address family modes from the configured cluster subnets.
    pub fn new(controller_name: impl Into<String>, cluster_subnets: Vec<IpNet>) -> Self {
        let ipv4_mode = cluster_subnets.iter().any(|n| matches!(n, IpNet::V4(_)));
        let ipv6_mode = cluster_subnets.iter().any(|n| matches!(n, IpNet::V6(_)));
        Self {
            controller_name: controller_name.into(),
            cluster_subnets,
            ipv4_mode,
            ipv6_mode,
            acl_logging_enabled: false,
            multicast_support: false,
            egress_firewall_enabled: true,
            cluster_port_group: "clusterPortGroup".to_string(),
        }
    }
}
