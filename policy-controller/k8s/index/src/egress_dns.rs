//! Address sets holding the resolved IPs of DNS names used as egress firewall destinations.
//!
//! A DNS name may be referenced by egress firewalls in several namespaces; they share one address
//! set, which is destroyed when the last namespace stops referencing the name.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_controller_core::{
    AddressSet, AddressSetFactory, DbObjectIds, IdsType, ObjectIdKey, StoreError,
};
use std::net::IpAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
pub struct EgressDns {
    controller_name: String,
    factory: AddressSetFactory,
    names: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    set: AddressSet,
    namespaces: HashSet<String>,
    ips: Vec<IpAddr>,
}

// === impl EgressDns ===

impl EgressDns {
    pub fn new(controller_name: impl Into<String>, factory: AddressSetFactory) -> Self {
        Self {
            controller_name: controller_name.into(),
            factory,
            names: Mutex::default(),
        }
    }

    fn ids(&self, dns_name: &str) -> DbObjectIds {
        DbObjectIds::new(IdsType::AddressSetEgressFirewallDns, &self.controller_name)
            .with(ObjectIdKey::ObjectName, dns_name)
    }

    /// Registers `namespace` as a user of `dns_name`, creating the name's address set if needed.
    pub async fn add(&self, namespace: &str, dns_name: &str) -> Result<AddressSet, StoreError> {
        let mut names = self.names.lock().await;
        if let Some(entry) = names.get_mut(dns_name) {
            entry.namespaces.insert(namespace.to_string());
            return Ok(entry.set.clone());
        }

        let set = self.factory.new_address_set(self.ids(dns_name), &[]).await?;
        debug!(%dns_name, %namespace, "Created DNS address set");
        names.insert(
            dns_name.to_string(),
            Entry {
                set: set.clone(),
                namespaces: Some(namespace.to_string()).into_iter().collect(),
                ips: vec![],
            },
        );
        Ok(set)
    }

    /// Drops `namespace`'s reference to `dns_name`, destroying the address set when no namespace
    /// references it anymore.
    pub async fn remove(&self, namespace: &str, dns_name: &str) -> Result<(), StoreError> {
        let mut names = self.names.lock().await;
        let Some(entry) = names.get_mut(dns_name) else {
            return Ok(());
        };
        if !entry.namespaces.remove(namespace) || !entry.namespaces.is_empty() {
            return Ok(());
        }

        if let Err(error) = entry.set.destroy().await {
            entry.namespaces.insert(namespace.to_string());
            return Err(error);
        }
        names.remove(dns_name);
        debug!(%dns_name, "Destroyed DNS address set");
        Ok(())
    }

    /// Replaces the resolved IPs of a DNS name. Returns false if no egress firewall uses the name.
    pub async fn update(&self, dns_name: &str, mut ips: Vec<IpAddr>) -> Result<bool, StoreError> {
        ips.sort();
        ips.dedup();

        let mut names = self.names.lock().await;
        let Some(entry) = names.get_mut(dns_name) else {
            return Ok(false);
        };
        if entry.ips == ips {
            return Ok(true);
        }
        entry.set.set_ips(&ips).await?;
        debug!(%dns_name, ?ips, "Updated DNS address set");
        entry.ips = ips;
        Ok(true)
    }

    /// Returns every DNS name currently referenced by at least one namespace.
    pub async fn names(&self) -> Vec<String> {
        let mut names = self.names.lock().await.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Destroys the stored DNS address sets that are neither referenced by `declared` names nor
    /// currently in use.
    pub async fn sync(&self, declared: &HashSet<String>) -> Result<usize, StoreError> {
        let names = self.names.lock().await;
        let existing = self
            .factory
            .list_address_sets(&self.controller_name, IdsType::AddressSetEgressFirewallDns)
            .await?;

        let mut destroyed = 0;
        for ids in existing {
            let Some(name) = ids.get(ObjectIdKey::ObjectName) else {
                continue;
            };
            if declared.contains(name) || names.contains_key(name) {
                continue;
            }
            self.factory.destroy_address_set(&ids).await?;
            destroyed += 1;
        }
        if destroyed > 0 {
            info!(destroyed, "Removed stale DNS address sets");
        }
        Ok(destroyed)
    }
}
