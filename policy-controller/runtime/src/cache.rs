//! Local copies of watched objects.
//!
//! The namespace cache backs the controller's namespace lookups, falling back to the API server on
//! a miss. The pod cache backs pod listing when a namespace's address set is first created. Every
//! cache also tells the watch handlers whether an object is new, and which objects disappeared
//! across a relist.

use ahash::AHashMap as HashMap;
use netpol_controller_k8s_api::{Api, Namespace, Pod, ResourceExt};
use netpol_controller_k8s_index::{NamespaceSource, PodLister};
use parking_lot::RwLock;
use std::sync::Arc;

/// Objects indexed by namespace and name. Cluster-scoped objects are stored under the empty
/// namespace.
#[derive(Debug)]
pub struct ObjectCache<T> {
    by_ns: RwLock<HashMap<String, HashMap<String, T>>>,
}

/// Resolves namespaces from the watch cache and then from the API server.
#[derive(Clone)]
pub struct NamespaceLookup {
    cache: Arc<ObjectCache<Namespace>>,
    api: Api<Namespace>,
}

// === impl ObjectCache ===

impl<T> Default for ObjectCache<T> {
    fn default() -> Self {
        Self {
            by_ns: RwLock::new(HashMap::default()),
        }
    }
}

impl<T: ResourceExt + Clone> ObjectCache<T> {
    /// Stores the object, returning the version it replaces.
    pub fn apply(&self, obj: T) -> Option<T> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        self.by_ns.write().entry(ns).or_default().insert(name, obj)
    }

    pub fn delete(&self, obj: &T) -> Option<T> {
        let ns = obj.namespace().unwrap_or_default();
        let mut by_ns = self.by_ns.write();
        let objs = by_ns.get_mut(&ns)?;
        let removed = objs.remove(&obj.name_any());
        if objs.is_empty() {
            by_ns.remove(&ns);
        }
        removed
    }

    /// Replaces the cache's contents, returning the objects that are no longer present.
    pub fn reset(&self, objs: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut next = HashMap::<String, HashMap<String, T>>::default();
        for obj in objs {
            next.entry(obj.namespace().unwrap_or_default())
                .or_default()
                .insert(obj.name_any(), obj);
        }

        let prior = std::mem::replace(&mut *self.by_ns.write(), next.clone());
        prior
            .into_iter()
            .flat_map(|(ns, objs)| {
                let current = next.remove(&ns).unwrap_or_default();
                objs.into_iter()
                    .filter(move |(name, _)| !current.contains_key(name))
                    .map(|(_, obj)| obj)
            })
            .collect()
    }

    pub fn get(&self, ns: Option<&str>, name: &str) -> Option<T> {
        self.by_ns
            .read()
            .get(ns.unwrap_or_default())?
            .get(name)
            .cloned()
    }

    pub fn list(&self, ns: &str) -> Vec<T> {
        self.by_ns
            .read()
            .get(ns)
            .map(|objs| objs.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl PodLister for ObjectCache<Pod> {
    fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.list(namespace)
    }
}

// === impl NamespaceLookup ===

impl NamespaceLookup {
    pub fn new(cache: Arc<ObjectCache<Namespace>>, api: Api<Namespace>) -> Self {
        Self { cache, api }
    }
}

#[async_trait::async_trait]
impl NamespaceSource for NamespaceLookup {
    fn cached(&self, name: &str) -> Option<Namespace> {
        self.cache.get(None, name)
    }

    async fn fetch(&self, name: &str) -> anyhow::Result<Option<Namespace>> {
        tracing::debug!(ns = %name, "Namespace not cached; querying the API server");
        Ok(self.api.get_opt(name).await?)
    }
}
