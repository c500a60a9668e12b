//! Northbound building blocks shared by the network policy controller.
//!
//! This crate knows nothing about Kubernetes. It models the objects the controller materializes in
//! the northbound database (address sets and ACLs), the identifiers used to find them again, the
//! `Store` interface through which they are written, and the compiler that renders egress firewall
//! rules into match expressions.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl;
pub mod address_set;
pub mod egress_match;
mod ids;
pub mod memory;
pub mod store;

pub use self::{
    acl::{Acl, AclLoggingLevels, Action, Direction, Severity},
    address_set::{AddressSet, AddressSetFactory, IpFamily},
    ids::{DbObjectIds, IdsType, ObjectIdKey, ObjectKind},
    store::{AddressSetRow, Store, StoreError},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
