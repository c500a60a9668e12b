//! Per-namespace multicast allow policies.
//!
//! Multicast traffic is dropped by a cluster-wide default deny. A namespace annotated with
//! `k8s.ovn.org/multicast-enabled: "true"` gets a pair of allow ACLs attached to its multicast port
//! group: one permitting its pods to send multicast traffic and one permitting them to receive
//! multicast traffic sent from within the namespace.

use ahash::AHashSet as HashSet;
use netpol_controller_core::{
    Acl, Action, AddressSet, DbObjectIds, Direction, IdsType, ObjectIdKey, Store, StoreError,
};
use netpol_controller_k8s_api::{annotations, Namespace, ResourceExt};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};

/// Sits above the default multicast deny ACLs.
pub const MULTICAST_ALLOW_PRIORITY: u16 = 1012;

const IPV6_MCAST: &str = "(mldv1 || mldv2 || (ip6.dst[120..127] == 0xff && ip6.dst[116] == 1))";

#[derive(Clone)]
pub struct MulticastPolicy {
    store: Arc<dyn Store>,
    controller_name: String,
    ipv4: bool,
    ipv6: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PolicyDirection {
    Egress,
    Ingress,
}

pub fn is_enabled(ns: &Namespace) -> bool {
    ns.annotations()
        .get(annotations::MULTICAST_ENABLED)
        .is_some_and(|v| v == "true")
}

/// Names the port group holding the logical ports of a namespace's pods.
pub fn port_group_name(namespace: &str) -> String {
    format!("mcast_{namespace}")
}

// === impl MulticastPolicy ===

impl MulticastPolicy {
    pub fn new(
        store: Arc<dyn Store>,
        controller_name: impl Into<String>,
        ipv4: bool,
        ipv6: bool,
    ) -> Self {
        Self {
            store,
            controller_name: controller_name.into(),
            ipv4,
            ipv6,
        }
    }

    fn ids(&self, namespace: &str, direction: PolicyDirection) -> DbObjectIds {
        DbObjectIds::new(IdsType::AclMulticastNamespace, &self.controller_name)
            .with(ObjectIdKey::ObjectName, namespace)
            .with(ObjectIdKey::PolicyDirection, direction.as_str())
    }

    fn acl_ids(&self, namespace: &str) -> Vec<String> {
        [PolicyDirection::Egress, PolicyDirection::Ingress]
            .into_iter()
            .map(|d| self.ids(namespace, d).primary_key())
            .collect()
    }

    /// Installs the namespace's allow ACLs and attaches them to its multicast port group.
    pub async fn enable(&self, namespace: &str, address_set: &AddressSet) -> Result<(), StoreError> {
        let pg = port_group_name(namespace);
        let acls = [
            Acl::new(
                &self.ids(namespace, PolicyDirection::Egress),
                self.egress_match(&pg),
                Action::Allow,
                MULTICAST_ALLOW_PRIORITY,
                Direction::FromLport,
                None,
            ),
            Acl::new(
                &self.ids(namespace, PolicyDirection::Ingress),
                self.ingress_match(&pg, address_set),
                Action::Allow,
                MULTICAST_ALLOW_PRIORITY,
                Direction::ToLport,
                None,
            ),
        ];
        self.store.ensure_acls(&acls).await?;
        let ids = acls.iter().map(|acl| acl.id.clone()).collect::<Vec<_>>();
        self.store.attach(&pg, &ids).await?;
        info!(%namespace, "Allowed multicast traffic");
        Ok(())
    }

    /// Detaches the namespace's allow ACLs from its multicast port group.
    pub async fn disable(&self, namespace: &str) -> Result<(), StoreError> {
        self.store
            .detach(&port_group_name(namespace), &self.acl_ids(namespace))
            .await?;
        info!(%namespace, "Disallowed multicast traffic");
        Ok(())
    }

    /// Detaches the allow ACLs of every namespace that is not in `enabled`.
    pub async fn sync(&self, enabled: &HashSet<String>) -> Result<(), StoreError> {
        let mut stale = BTreeMap::<String, Vec<String>>::new();
        for acl in self.store.list_acls().await? {
            let Some(ids) = acl.ids() else { continue };
            if !ids.is_owned_by(IdsType::AclMulticastNamespace, &self.controller_name) {
                continue;
            }
            let Some(ns) = ids.get(ObjectIdKey::ObjectName) else {
                continue;
            };
            if !enabled.contains(ns) {
                stale.entry(ns.to_string()).or_default().push(acl.id);
            }
        }

        for (ns, acl_ids) in stale {
            debug!(%ns, "Removing stale multicast policy");
            self.store.detach(&port_group_name(&ns), &acl_ids).await?;
        }
        Ok(())
    }

    fn egress_match(&self, pg: &str) -> String {
        let mcast = [
            self.ipv4.then_some("ip4.mcast"),
            self.ipv6.then_some(IPV6_MCAST),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" || ");
        format!("inport == @{pg} && ({mcast})")
    }

    fn ingress_match(&self, pg: &str, address_set: &AddressSet) -> String {
        let (v4, v6) = address_set.hash_names();
        let sources = [
            (self.ipv4 && !v4.is_empty()).then(|| format!("(ip4.src == ${v4} && ip4.mcast)")),
            (self.ipv6 && !v6.is_empty()).then(|| format!("(ip6.src == ${v6} && {IPV6_MCAST})")),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" || ");
        format!("outport == @{pg} && ({sources})")
    }
}

impl std::fmt::Debug for MulticastPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastPolicy")
            .field("controller_name", &self.controller_name)
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .finish_non_exhaustive()
    }
}

// === impl PolicyDirection ===

impl PolicyDirection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Egress => "Egress",
            Self::Ingress => "Ingress",
        }
    }
}
