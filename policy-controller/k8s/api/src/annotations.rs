//! Namespace annotations that configure per-namespace network policy.

/// JSON-encoded `{"allow": <severity>, "deny": <severity>}` ACL log levels.
pub const ACL_LOGGING: &str = "k8s.ovn.org/acl-logging";

/// `"true"` enables multicast traffic between the namespace's pods.
pub const MULTICAST_ENABLED: &str = "k8s.ovn.org/multicast-enabled";

/// Comma-separated IPs of the external gateways that route the namespace's egress traffic.
pub const ROUTING_EXTERNAL_GWS: &str = "k8s.ovn.org/routing-external-gws";

/// Enables BFD on the namespace's external gateway routes.
pub const BFD_ENABLED: &str = "k8s.ovn.org/bfd-enabled";
