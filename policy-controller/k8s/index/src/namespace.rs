//! Per-namespace state and the locking protocol that guards it.
//!
//! Each namespace's state lives behind its own reader-writer lock in a shared table. The table
//! itself is guarded by a coarse lock that is only held to insert or remove entries (and, for a
//! freshly inserted entry, until that entry's own lock is acquired). Callers never see an unlocked
//! `NamespaceState`: every accessor returns an owned guard whose drop releases the lock.
//!
//! Because a pre-existing entry is locked after the table lock is released, the entry may have
//! been removed from the table by a concurrent deletion in the meantime. Every acquisition of a
//! pre-existing entry is therefore re-validated against the table once its lock is held.

use crate::{
    acl_logging,
    cluster_info::ClusterInfo,
    lookup::{NamespaceSource, PodLister},
    multicast::{self, MulticastPolicy},
    pod,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_controller_core::{
    AclLoggingLevels, AddressSet, AddressSetFactory, DbObjectIds, IdsType, ObjectIdKey, Store,
    StoreError,
};
use netpol_controller_k8s_api::{annotations, labels::Map, Namespace, ResourceExt};
use std::{collections::BTreeSet, future::Future, net::IpAddr, sync::Arc};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, instrument, warn};

/// Exclusive access to a namespace's state.
pub type NamespaceWriteGuard = OwnedRwLockWriteGuard<NamespaceState>;

/// Shared access to a namespace's state.
pub type NamespaceReadGuard = OwnedRwLockReadGuard<NamespaceState>;

type Entry = Arc<RwLock<NamespaceState>>;

pub struct NamespaceStateManager {
    cluster: Arc<ClusterInfo>,
    namespaces: Mutex<HashMap<String, Entry>>,
    address_sets: AddressSetFactory,
    multicast: MulticastPolicy,
    source: Arc<dyn NamespaceSource>,
    pods: Arc<dyn PodLister>,
}

/// The state derived from a namespace and the pods in it.
#[derive(Debug)]
pub struct NamespaceState {
    name: String,

    /// Holds the IPs of every pod in the namespace.
    address_set: AddressSet,

    /// Keys of the policies that must be notified when the namespace changes. A policy registers
    /// only after it has been installed and unregisters before it is torn down.
    dependent_policies: BTreeSet<String>,

    external_gateways: GatewayInfo,

    /// Gateways served by pods, keyed by `<namespace>_<pod>`.
    pod_gateways: HashMap<String, GatewayInfo>,

    multicast_enabled: bool,

    acl_logging: AclLoggingLevels,
}

/// External gateways that route a namespace's egress traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayInfo {
    pub gateways: BTreeSet<IpAddr>,
    pub bfd_enabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create address set for namespace {ns}: {source}")]
    CreateAddressSet {
        ns: String,
        #[source]
        source: StoreError,
    },

    #[error("namespace {0} was removed during ensure")]
    RemovedDuringEnsure(String),

    #[error("failed to configure namespace {ns}: failed to update multicast: {source}")]
    Multicast {
        ns: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to delete namespace {ns}: {source}")]
    Delete {
        ns: String,
        #[source]
        source: StoreError,
    },

    #[error("error in syncing namespaces: {0}")]
    SyncFailed(#[source] StoreError),
}

// === impl NamespaceStateManager ===

impl NamespaceStateManager {
    pub fn new(
        cluster: Arc<ClusterInfo>,
        store: Arc<dyn Store>,
        source: Arc<dyn NamespaceSource>,
        pods: Arc<dyn PodLister>,
    ) -> Self {
        let address_sets =
            AddressSetFactory::new(store.clone(), cluster.ipv4_mode, cluster.ipv6_mode);
        let multicast = MulticastPolicy::new(
            store,
            &cluster.controller_name,
            cluster.ipv4_mode,
            cluster.ipv6_mode,
        );
        Self {
            cluster,
            namespaces: Mutex::default(),
            address_sets,
            multicast,
            source,
            pods,
        }
    }

    /// Identifies the address set holding a namespace's pod IPs.
    pub fn address_set_ids(&self, namespace: &str) -> DbObjectIds {
        DbObjectIds::new(IdsType::AddressSetNamespace, &self.cluster.controller_name)
            .with(ObjectIdKey::ObjectName, namespace)
    }

    /// Returns the namespace's state, exclusively locked, creating it if it does not exist.
    ///
    /// When the namespace object is not provided it is looked up in the local cache and then in
    /// the API server once the lock is held. If it is found, its annotations are applied to the
    /// state; otherwise configuration is deferred until a later namespace event.
    #[instrument(skip(self, namespace))]
    pub async fn ensure_locked(
        &self,
        name: &str,
        namespace: Option<&Namespace>,
    ) -> Result<NamespaceWriteGuard, Error> {
        let mut state = self.ensure_entry(name, RwLock::write_owned).await?;
        if let Some(ns) = self.resolve(name, namespace).await {
            self.configure(&mut state, &ns).await?;
        }
        Ok(state)
    }

    /// Like `ensure_locked`, but returns a shared guard.
    ///
    /// Configuration mutates the state, so the lock is first taken exclusively and downgraded
    /// once the state is configured.
    #[instrument(skip(self, namespace))]
    pub async fn ensure_locked_read(
        &self,
        name: &str,
        namespace: Option<&Namespace>,
    ) -> Result<NamespaceReadGuard, Error> {
        self.ensure_locked(name, namespace)
            .await
            .map(OwnedRwLockWriteGuard::downgrade)
    }

    /// Returns the namespace's state, exclusively locked, if it exists.
    pub async fn get_locked(&self, name: &str) -> Option<NamespaceWriteGuard> {
        self.get_entry(name, RwLock::write_owned).await
    }

    /// Returns the namespace's state, locked for reading, if it exists.
    pub async fn get_locked_read(&self, name: &str) -> Option<NamespaceReadGuard> {
        self.get_entry(name, RwLock::read_owned).await
    }

    /// Tears down a namespace's state and removes it from the table.
    ///
    /// The multicast policy is removed and the address set destroyed before the entry is removed,
    /// so a store failure leaves the state in place for a retry. The table lock is not held while
    /// the store is updated; holding the entry's write lock is enough, since only a deletion
    /// removes entries and it must take that lock first. On success the removed state is
    /// returned, still locked, so that the caller may finish its own cleanup before any waiter
    /// observes the removal.
    #[instrument(skip(self))]
    pub async fn delete_locked(&self, name: &str) -> Result<Option<NamespaceWriteGuard>, Error> {
        let Some(mut state) = self.get_locked(name).await else {
            return Ok(None);
        };

        let delete_err = |source| Error::Delete {
            ns: name.to_string(),
            source,
        };
        if state.multicast_enabled {
            self.multicast.disable(name).await.map_err(delete_err)?;
            state.multicast_enabled = false;
        }
        state.address_set.destroy().await.map_err(delete_err)?;

        self.namespaces.lock().await.remove(name);
        info!(ns = %name, "Deleted namespace");
        Ok(Some(state))
    }

    /// Returns the namespace's ACL logging levels, or disabled levels if the namespace is unknown.
    pub async fn acl_logging(&self, name: &str) -> AclLoggingLevels {
        self.get_locked_read(name)
            .await
            .map(|state| state.acl_logging)
            .unwrap_or_default()
    }

    /// Applies the namespace object's annotations to its state.
    ///
    /// Returns true if the namespace's ACL logging levels changed. Malformed ACL logging
    /// annotations are logged and disable logging; multicast failures are returned, in which case
    /// the multicast state is left unchanged.
    pub async fn configure(&self, state: &mut NamespaceState, ns: &Namespace) -> Result<bool, Error> {
        let previous = state.acl_logging;
        let annotation = ns
            .annotations()
            .get(annotations::ACL_LOGGING)
            .map(String::as_str);
        if let Err(error) = acl_logging::update_levels(
            &mut state.acl_logging,
            annotation,
            self.cluster.acl_logging_enabled,
        ) {
            warn!(ns = %state.name, %error, levels = %state.acl_logging, "ACL logging contained malformed annotation");
        }
        let changed = state.acl_logging != previous;
        if changed {
            info!(ns = %state.name, levels = %state.acl_logging, "ACL logging updated");
        }

        state.external_gateways = GatewayInfo::from_annotations(ns.annotations());

        self.update_multicast(state, multicast::is_enabled(ns)).await?;
        Ok(changed)
    }

    /// Removes the state, address sets and multicast policies of every namespace that no longer
    /// exists.
    ///
    /// Safe to re-run after a failure.
    #[instrument(skip_all, fields(namespaces = namespaces.len()))]
    pub async fn sync_all(&self, namespaces: &[Namespace]) -> Result<(), Error> {
        let expected = namespaces
            .iter()
            .map(|ns| ns.name_unchecked())
            .collect::<HashSet<_>>();

        let stale = self
            .namespaces
            .lock()
            .await
            .keys()
            .filter(|name| !expected.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        for name in stale {
            self.delete_locked(&name).await?;
        }

        let existing = self
            .address_sets
            .list_address_sets(&self.cluster.controller_name, IdsType::AddressSetNamespace)
            .await
            .map_err(Error::SyncFailed)?;
        let mut removed = 0;
        for ids in existing {
            if ids
                .get(ObjectIdKey::ObjectName)
                .is_some_and(|ns| expected.contains(ns))
            {
                continue;
            }
            self.address_sets
                .destroy_address_set(&ids)
                .await
                .map_err(Error::SyncFailed)?;
            removed += 1;
        }

        if self.cluster.multicast_support {
            let with_multicast = namespaces
                .iter()
                .filter(|ns| multicast::is_enabled(ns))
                .map(|ns| ns.name_unchecked())
                .collect::<HashSet<_>>();
            self.multicast
                .sync(&with_multicast)
                .await
                .map_err(Error::SyncFailed)?;
        }

        info!(removed, "Synced namespaces");
        Ok(())
    }

    async fn resolve(&self, name: &str, namespace: Option<&Namespace>) -> Option<Namespace> {
        if let Some(ns) = namespace {
            return Some(ns.clone());
        }
        if let Some(ns) = self.source.cached(name) {
            return Some(ns);
        }
        match self.source.fetch(name).await {
            Ok(Some(ns)) => Some(ns),
            Ok(None) => {
                debug!(ns = %name, "Namespace not found; deferring configuration");
                None
            }
            Err(error) => {
                warn!(ns = %name, %error, "Unable to find namespace; deferring configuration");
                None
            }
        }
    }

    /// Locks the named entry, creating it if needed.
    async fn ensure_entry<G, F, Fut>(&self, name: &str, lock: F) -> Result<G, Error>
    where
        F: FnOnce(Entry) -> Fut,
        Fut: Future<Output = G>,
    {
        let mut table = self.namespaces.lock().await;
        if let Some(entry) = table.get(name).cloned() {
            drop(table);
            let guard = lock(entry.clone()).await;
            if !self.is_current(name, &entry).await {
                return Err(Error::RemovedDuringEnsure(name.to_string()));
            }
            return Ok(guard);
        }

        // No other task can reach the new entry before the table lock is released, so acquiring
        // its lock while holding the table lock cannot block.
        let ips = pod::namespace_ips(&self.pods.pods(name));
        let address_set = self
            .address_sets
            .new_address_set(self.address_set_ids(name), &ips)
            .await
            .map_err(|source| Error::CreateAddressSet {
                ns: name.to_string(),
                source,
            })?;
        let entry = Arc::new(RwLock::new(NamespaceState::new(name, address_set)));
        table.insert(name.to_string(), entry.clone());
        let guard = lock(entry).await;
        drop(table);
        debug!(ns = %name, ips = ips.len(), "Created namespace state");
        Ok(guard)
    }

    async fn get_entry<G, F, Fut>(&self, name: &str, lock: F) -> Option<G>
    where
        F: FnOnce(Entry) -> Fut,
        Fut: Future<Output = G>,
    {
        let entry = self.namespaces.lock().await.get(name).cloned()?;
        let guard = lock(entry.clone()).await;
        self.is_current(name, &entry).await.then_some(guard)
    }

    async fn is_current(&self, name: &str, entry: &Entry) -> bool {
        self.namespaces
            .lock()
            .await
            .get(name)
            .is_some_and(|cur| Arc::ptr_eq(cur, entry))
    }

    async fn update_multicast(&self, state: &mut NamespaceState, enabled: bool) -> Result<(), Error> {
        if !self.cluster.multicast_support || state.multicast_enabled == enabled {
            return Ok(());
        }

        let res = if enabled {
            self.multicast.enable(&state.name, &state.address_set).await
        } else {
            self.multicast.disable(&state.name).await
        };
        res.map_err(|source| Error::Multicast {
            ns: state.name.clone(),
            source,
        })?;
        state.multicast_enabled = enabled;
        Ok(())
    }
}

// === impl NamespaceState ===

impl NamespaceState {
    fn new(name: &str, address_set: AddressSet) -> Self {
        Self {
            name: name.to_string(),
            address_set,
            dependent_policies: BTreeSet::new(),
            external_gateways: GatewayInfo::default(),
            pod_gateways: HashMap::new(),
            multicast_enabled: false,
            acl_logging: AclLoggingLevels::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_set(&self) -> &AddressSet {
        &self.address_set
    }

    pub fn acl_logging(&self) -> AclLoggingLevels {
        self.acl_logging
    }

    pub fn multicast_enabled(&self) -> bool {
        self.multicast_enabled
    }

    pub fn external_gateways(&self) -> &GatewayInfo {
        &self.external_gateways
    }

    /// Returns true if the policy was not already registered.
    pub fn add_dependent(&mut self, key: impl Into<String>) -> bool {
        self.dependent_policies.insert(key.into())
    }

    pub fn remove_dependent(&mut self, key: &str) -> bool {
        self.dependent_policies.remove(key)
    }

    pub fn has_dependent(&self, key: &str) -> bool {
        self.dependent_policies.contains(key)
    }

    pub fn dependents(&self) -> impl Iterator<Item = &str> + '_ {
        self.dependent_policies.iter().map(String::as_str)
    }

    pub fn set_pod_gateway(&mut self, namespace: &str, pod: &str, info: GatewayInfo) {
        self.pod_gateways.insert(pod_gateway_key(namespace, pod), info);
    }

    pub fn remove_pod_gateway(&mut self, namespace: &str, pod: &str) -> Option<GatewayInfo> {
        self.pod_gateways.remove(&pod_gateway_key(namespace, pod))
    }

    pub fn pod_gateway(&self, namespace: &str, pod: &str) -> Option<&GatewayInfo> {
        self.pod_gateways.get(&pod_gateway_key(namespace, pod))
    }
}

fn pod_gateway_key(namespace: &str, pod: &str) -> String {
    format!("{namespace}_{pod}")
}

// === impl GatewayInfo ===

impl GatewayInfo {
    /// Parses the namespace's external gateway annotations. Invalid IPs are logged and skipped.
    pub fn from_annotations(map: &Map) -> Self {
        let gateways = map
            .get(annotations::ROUTING_EXTERNAL_GWS)
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|gw| !gw.is_empty())
            .filter_map(|gw| match gw.parse() {
                Ok(ip) => Some(ip),
                Err(error) => {
                    warn!(%error, %gw, "Ignoring invalid external gateway");
                    None
                }
            })
            .collect();
        Self {
            gateways,
            bfd_enabled: map.contains_key(annotations::BFD_ENABLED),
        }
    }
}
