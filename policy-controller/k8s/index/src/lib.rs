//! Network Policy Controller Index
//!
//! Compiles cluster resources into the address sets and ACLs consumed by the virtual network. The
//! controller watches the following cluster resources:
//!
//! - Each `Namespace` owns an address set holding the IPs of its pods. Its annotations configure
//!   ACL logging, multicast, and external gateways.
//! - Each `Pod` contributes its IPs to its namespace's address set while it is scheduled and
//!   running on the pod network.
//! - An `EgressFirewall` (at most one per namespace, named `default`) declares an ordered list of
//!   allow/deny rules for traffic leaving the namespace's pods. Each rule becomes an ACL attached
//!   to the cluster port group.
//! - `Node` labels and addresses resolve the `nodeSelector` destinations of egress firewall rules.
//!
//! ```text
//! [ Pod ] -> [ Namespace ] <- [ EgressFirewall ] -> [ Node ]
//! ```
//!
//! A namespace's derived state is only ever accessed through a lock guard handed out by the
//! `NamespaceStateManager`. Egress firewall state is locked per namespace as well, and always after
//! the namespace's own lock.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl_logging;
mod cluster_info;
mod controller;
pub mod egress_dns;
pub mod egress_firewall;
mod lookup;
pub mod metrics;
pub mod multicast;
pub mod namespace;
pub mod node;
pub mod pod;


pub use self::{
    cluster_info::ClusterInfo,
    controller::Controller,
    egress_firewall::{EgressFirewallReconciler, Rule},
    lookup::{NamespaceSource, PodLister},
    metrics::EventMetrics,
    namespace::{NamespaceReadGuard, NamespaceState, NamespaceStateManager, NamespaceWriteGuard},
};
