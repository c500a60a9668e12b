#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod egress_firewall;
pub mod labels;

pub use self::{
    egress_firewall::{
        EgressFirewall, EgressFirewallDestination, EgressFirewallPort, EgressFirewallRule,
        EgressFirewallSpec, EgressFirewallStatus, RuleType,
    },
    labels::{Labels, Selector},
};
pub use k8s_openapi::api::{
    self,
    core::v1::{Namespace, Node, NodeAddress, NodeStatus, Pod, PodSpec, PodStatus},
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client,
};
