use crate::acl::Acl;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

/// An address set row as stored in the northbound database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSetRow {
    pub name: String,
    pub external_ids: BTreeMap<String, String>,
    pub addresses: BTreeSet<IpAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("address set {0} does not exist")]
    AddressSetNotFound(String),

    #[error("ACL {0} does not exist")]
    AclNotFound(String),

    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
}

/// The northbound database operations the controller relies on.
///
/// Every operation is idempotent: it ensures rows exist (or do not exist) in the requested shape,
/// so callers may safely reissue an operation after a failure. ACL rows are keyed by their `id`;
/// rows that are no longer attached to any enforcement point are garbage the store may reclaim.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Creates the address set or replaces its addresses with exactly `row.addresses`.
    async fn ensure_address_set(&self, row: AddressSetRow) -> Result<(), StoreError>;

    async fn add_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError>;

    async fn remove_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError>;

    /// Deletes the address set. Deleting a missing set succeeds.
    async fn destroy_address_set(&self, name: &str) -> Result<(), StoreError>;

    /// Lists the address sets whose owner-type external id matches `owner_type`.
    async fn list_address_sets(&self, owner_type: &str) -> Result<Vec<AddressSetRow>, StoreError>;

    /// Creates or updates ACL rows by id.
    async fn ensure_acls(&self, acls: &[Acl]) -> Result<(), StoreError>;

    async fn list_acls(&self) -> Result<Vec<Acl>, StoreError>;

    /// Adds ACLs to an enforcement point, creating the point if needed.
    async fn attach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError>;

    /// Removes ACLs from an enforcement point. Ids that are not attached are ignored.
    async fn detach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError>;
}
