use crate::{
    ids::{DbObjectIds, IdsType, ObjectKind},
    store::{AddressSetRow, Store, StoreError},
};
use ahash::AHashSet as HashSet;
use std::{fmt, net::IpAddr, sync::Arc};
use tracing::debug;

/// External-id key recording which address family an address set row holds.
pub const IP_FAMILY_KEY: &str = "ip-family";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

/// Creates, finds and destroys address sets.
///
/// Each address set is backed by one row per enabled address family. Row names are derived from
/// the set's `DbObjectIds`, so the same descriptor always refers to the same rows.
#[derive(Clone)]
pub struct AddressSetFactory {
    store: Arc<dyn Store>,
    ipv4: bool,
    ipv6: bool,
}

/// A handle to a named set of IP addresses.
///
/// Clones share the same underlying set.
#[derive(Clone)]
pub struct AddressSet(Arc<Inner>);

struct Inner {
    ids: DbObjectIds,
    v4: Option<String>,
    v6: Option<String>,
    store: Arc<dyn Store>,
}

// === impl IpFamily ===

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V4 => "v4",
            Self::V6 => "v6",
        }
    }
}

/// Hashes `<base>_<family>` into a row name that is safe to use in match expressions.
pub fn hashed_name(base: &str, family: IpFamily) -> String {
    format!("a{}", fnv1a_64(&format!("{}_{}", base, family.as_str())))
}

/// 64-bit FNV-1a.
fn fnv1a_64(s: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    s.bytes().fold(OFFSET_BASIS, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

// === impl AddressSetFactory ===

impl AddressSetFactory {
    pub fn new(store: Arc<dyn Store>, ipv4: bool, ipv6: bool) -> Self {
        Self { store, ipv4, ipv6 }
    }

    /// Returns the row names for `ids`, using the empty string for disabled families.
    pub fn hash_names(&self, ids: &DbObjectIds) -> (String, String) {
        let (v4, v6) = self.row_names(ids);
        (v4.unwrap_or_default(), v6.unwrap_or_default())
    }

    fn row_names(&self, ids: &DbObjectIds) -> (Option<String>, Option<String>) {
        let base = ids.address_set_base_name();
        (
            self.ipv4.then(|| hashed_name(&base, IpFamily::V4)),
            self.ipv6.then(|| hashed_name(&base, IpFamily::V6)),
        )
    }

    /// Creates the address set, replacing any existing membership with exactly `ips`.
    pub async fn new_address_set(
        &self,
        ids: DbObjectIds,
        ips: &[IpAddr],
    ) -> Result<AddressSet, StoreError> {
        let (v4, v6) = self.row_names(&ids);
        let set = AddressSet(Arc::new(Inner {
            ids,
            v4,
            v6,
            store: self.store.clone(),
        }));
        set.set_ips(ips).await?;
        debug!(ids = %set.ids().primary_key(), "Created address set");
        Ok(set)
    }

    pub async fn destroy_address_set(&self, ids: &DbObjectIds) -> Result<(), StoreError> {
        let (v4, v6) = self.row_names(ids);
        for name in v4.iter().chain(v6.iter()) {
            self.store.destroy_address_set(name).await?;
        }
        Ok(())
    }

    /// Lists the descriptors of every address set of the given type owned by `owner_controller`.
    ///
    /// Rows of both families collapse into a single descriptor.
    pub async fn list_address_sets(
        &self,
        owner_controller: &str,
        ids_type: IdsType,
    ) -> Result<Vec<DbObjectIds>, StoreError> {
        let rows = self.store.list_address_sets(ids_type.owner_type()).await?;
        let mut seen = HashSet::new();
        let mut sets = Vec::new();
        for row in rows {
            let ids = match DbObjectIds::from_external_ids(ObjectKind::AddressSet, &row.external_ids)
            {
                Some(ids) if ids.is_owned_by(ids_type, owner_controller) => ids,
                _ => continue,
            };
            if seen.insert(ids.primary_key()) {
                sets.push(ids);
            }
        }
        Ok(sets)
    }
}

// === impl AddressSet ===

impl AddressSet {
    pub fn ids(&self) -> &DbObjectIds {
        &self.0.ids
    }

    /// Returns the IPv4 and IPv6 row names, using the empty string for disabled families.
    pub fn hash_names(&self) -> (&str, &str) {
        (
            self.0.v4.as_deref().unwrap_or_default(),
            self.0.v6.as_deref().unwrap_or_default(),
        )
    }

    /// Replaces the set's membership with exactly `ips`.
    pub async fn set_ips(&self, ips: &[IpAddr]) -> Result<(), StoreError> {
        for (family, name) in self.rows() {
            let row = AddressSetRow {
                name: name.to_string(),
                external_ids: self.row_external_ids(family),
                addresses: ips
                    .iter()
                    .filter(|ip| IpFamily::of(ip) == family)
                    .copied()
                    .collect(),
            };
            self.0.store.ensure_address_set(row).await?;
        }
        Ok(())
    }

    pub async fn add_ips(&self, ips: &[IpAddr]) -> Result<(), StoreError> {
        for (family, name) in self.rows() {
            let ips = Self::of_family(ips, family);
            if !ips.is_empty() {
                self.0.store.add_addresses(name, &ips).await?;
            }
        }
        Ok(())
    }

    pub async fn delete_ips(&self, ips: &[IpAddr]) -> Result<(), StoreError> {
        for (family, name) in self.rows() {
            let ips = Self::of_family(ips, family);
            if !ips.is_empty() {
                self.0.store.remove_addresses(name, &ips).await?;
            }
        }
        Ok(())
    }

    pub async fn destroy(&self) -> Result<(), StoreError> {
        for (_, name) in self.rows() {
            self.0.store.destroy_address_set(name).await?;
        }
        debug!(ids = %self.ids().primary_key(), "Destroyed address set");
        Ok(())
    }

    fn rows(&self) -> impl Iterator<Item = (IpFamily, &str)> {
        let v4 = self.0.v4.as_deref().map(|n| (IpFamily::V4, n));
        let v6 = self.0.v6.as_deref().map(|n| (IpFamily::V6, n));
        v4.into_iter().chain(v6)
    }

    fn row_external_ids(&self, family: IpFamily) -> std::collections::BTreeMap<String, String> {
        let mut ext = self.0.ids.external_ids();
        ext.insert(IP_FAMILY_KEY.to_string(), family.as_str().to_string());
        ext
    }

    fn of_family(ips: &[IpAddr], family: IpFamily) -> Vec<IpAddr> {
        ips.iter()
            .filter(|ip| IpFamily::of(ip) == family)
            .copied()
            .collect()
    }
}

impl fmt::Debug for AddressSetFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSetFactory")
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSet")
            .field("ids", &self.0.ids)
            .field("v4", &self.0.v4)
            .field("v6", &self.0.v6)
            .finish()
    }
}
