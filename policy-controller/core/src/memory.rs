//! An in-process `Store`.
//!
//! Rows live in ordered maps so that inspection is deterministic. Failures may be injected per
//! operation to exercise error paths.

use crate::{
    acl::Acl,
    ids::OWNER_TYPE_KEY,
    store::{AddressSetRow, Store, StoreError},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    address_sets: BTreeMap<String, AddressSetRow>,
    acls: BTreeMap<String, Acl>,
    points: BTreeMap<String, BTreeSet<String>>,
    fail: Vec<&'static str>,
    calls: BTreeMap<&'static str, usize>,
}

// === impl MemoryStore ===

impl MemoryStore {
    /// Causes the next invocation of `op` (e.g. `"ensure_acls"`) to fail.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().fail.push(op);
    }

    /// Returns the number of times `op` has been invoked, including failed invocations.
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn address_set(&self, name: &str) -> Option<AddressSetRow> {
        self.state.lock().address_sets.get(name).cloned()
    }

    pub fn address_sets(&self) -> Vec<AddressSetRow> {
        self.state.lock().address_sets.values().cloned().collect()
    }

    pub fn acl(&self, id: &str) -> Option<Acl> {
        self.state.lock().acls.get(id).cloned()
    }

    pub fn acls(&self) -> Vec<Acl> {
        self.state.lock().acls.values().cloned().collect()
    }

    /// Inserts an ACL row directly, as if it had been left behind by an earlier run.
    pub fn insert_acl(&self, acl: Acl) {
        self.state.lock().acls.insert(acl.id.clone(), acl);
    }

    /// Returns the ids of the ACLs attached to an enforcement point.
    pub fn attached(&self, point: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .points
            .get(point)
            .cloned()
            .unwrap_or_default()
    }

    /// Attaches ACL ids to a point without validation, as if left behind by an earlier run.
    pub fn insert_attached(&self, point: &str, acl_ids: impl IntoIterator<Item = String>) {
        self.state
            .lock()
            .points
            .entry(point.to_string())
            .or_default()
            .extend(acl_ids);
    }

    /// Deletes every ACL that is not attached to any enforcement point, returning the number of
    /// rows removed.
    pub fn collect_garbage(&self) -> usize {
        let mut state = self.state.lock();
        let referenced = state
            .points
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>();
        let before = state.acls.len();
        state.acls.retain(|id, _| referenced.contains(id));
        before - state.acls.len()
    }
}

impl State {
    fn check(&mut self, op: &'static str) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(i) = self.fail.iter().position(|f| *f == op) {
            self.fail.remove(i);
            return Err(StoreError::Operation {
                op,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn address_set_mut(&mut self, name: &str) -> Result<&mut AddressSetRow, StoreError> {
        self.address_sets
            .get_mut(name)
            .ok_or_else(|| StoreError::AddressSetNotFound(name.to_string()))
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn ensure_address_set(&self, row: AddressSetRow) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("ensure_address_set")?;
        state.address_sets.insert(row.name.clone(), row);
        Ok(())
    }

    async fn add_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("add_addresses")?;
        state
            .address_set_mut(name)?
            .addresses
            .extend(addresses.iter().copied());
        Ok(())
    }

    async fn remove_addresses(&self, name: &str, addresses: &[IpAddr]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("remove_addresses")?;
        let row = state.address_set_mut(name)?;
        for addr in addresses {
            row.addresses.remove(addr);
        }
        Ok(())
    }

    async fn destroy_address_set(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("destroy_address_set")?;
        state.address_sets.remove(name);
        Ok(())
    }

    async fn list_address_sets(&self, owner_type: &str) -> Result<Vec<AddressSetRow>, StoreError> {
        let mut state = self.state.lock();
        state.check("list_address_sets")?;
        Ok(state
            .address_sets
            .values()
            .filter(|row| row.external_ids.get(OWNER_TYPE_KEY).map(String::as_str) == Some(owner_type))
            .cloned()
            .collect())
    }

    async fn ensure_acls(&self, acls: &[Acl]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("ensure_acls")?;
        for acl in acls {
            state.acls.insert(acl.id.clone(), acl.clone());
        }
        Ok(())
    }

    async fn list_acls(&self) -> Result<Vec<Acl>, StoreError> {
        let mut state = self.state.lock();
        state.check("list_acls")?;
        Ok(state.acls.values().cloned().collect())
    }

    async fn attach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("attach")?;
        if let Some(missing) = acl_ids.iter().find(|id| !state.acls.contains_key(*id)) {
            return Err(StoreError::AclNotFound(missing.clone()));
        }
        state
            .points
            .entry(point.to_string())
            .or_default()
            .extend(acl_ids.iter().cloned());
        Ok(())
    }

    async fn detach(&self, point: &str, acl_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check("detach")?;
        if let Some(attached) = state.points.get_mut(point) {
            for id in acl_ids {
                attached.remove(id);
            }
        }
        Ok(())
    }
}
