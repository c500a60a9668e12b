//! Compiles egress firewalls into ACLs and keeps the installed ACLs in sync with them.
//!
//! A namespace has at most one egress firewall, named `default`. Its rules are evaluated in
//! declaration order, which is expressed by giving each rule's ACL a priority one lower than the
//! previous rule's, starting at `EGRESS_FIREWALL_START_PRIORITY`. Every ACL is attached to the
//! cluster-wide port group so that it applies to all pods; the match expression restricts it to
//! traffic sourced from the namespace's address set.
//!
//! Policies are replaced wholesale: an update detaches every previously installed ACL before the
//! new rules are installed. Detached ACLs are reclaimed by the store once nothing references them.

use crate::{
    cluster_info::ClusterInfo, egress_dns::EgressDns, namespace::NamespaceState, node::NodeIndex,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_controller_core::{
    egress_match::{InvalidProtocol, MatchCompiler, MatchKind, MatchTarget, PortMatch},
    Acl, Action, DbObjectIds, Direction, IdsType, IpNet, ObjectIdKey, Store, StoreError,
};
use netpol_controller_k8s_api::{
    EgressFirewall, EgressFirewallRule, EgressFirewallSpec, EgressFirewallStatus, ResourceExt,
    RuleType, Selector,
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, fmt, net::IpAddr, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// The priority of a policy's first rule.
pub const EGRESS_FIREWALL_START_PRIORITY: u16 = 10_000;

/// The lowest priority reserved for egress firewall rules.
pub const MINIMUM_RESERVED_EGRESS_FIREWALL_PRIORITY: u16 = 2_000;

/// The most rules a single policy may declare.
pub const MAX_RULES: usize =
    (EGRESS_FIREWALL_START_PRIORITY - MINIMUM_RESERVED_EGRESS_FIREWALL_PRIORITY) as usize;

/// The only supported egress firewall name.
pub const POLICY_NAME: &str = "default";

pub const STATUS_APPLIED: &str = "EgressFirewall Rules applied";
pub const STATUS_FAILED: &str = "EgressFirewall Rules not correctly added";

/// A validated egress firewall rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub priority: u16,
    pub action: Action,
    pub destination: Destination,
    pub ports: Vec<PortMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Cidr(IpNet),
    DnsName(String),
    Nodes(Selector),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid CIDR address: {0}")]
pub struct CidrParseError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("only one egress firewall per namespace is supported and it must be named \"default\"; {0:?} is ignored")]
    InvalidName(String),

    #[error("egress firewall for namespace {namespace} has too many rules ({rules}), max allowed number is 8000")]
    TooManyRules { namespace: String, rules: usize },

    #[error(transparent)]
    Cidr(#[from] CidrParseError),

    #[error("rule {index} must set exactly one of cidrSelector, dnsName and nodeSelector")]
    Destination { index: usize },

    #[error("rule {index}: {source}")]
    Protocol {
        index: usize,
        #[source]
        source: InvalidProtocol,
    },

    #[error("rule {index}: invalid port {port}")]
    Port { index: usize, port: i32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct EgressFirewallReconciler {
    cluster: Arc<ClusterInfo>,
    store: Arc<dyn Store>,
    compiler: MatchCompiler,
    dns: Arc<EgressDns>,
    nodes: Arc<NodeIndex>,
    policies: Mutex<HashMap<String, Arc<AsyncMutex<PolicyState>>>>,

    /// Namespaces whose policy has a `nodeSelector` destination.
    node_policies: Mutex<BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct PolicyState {
    /// The most recently declared rules, whether or not they were installed successfully.
    rules: Vec<Rule>,

    /// The ACLs the store has confirmed as installed.
    acls: Vec<Acl>,

    /// DNS names this namespace holds a reference to.
    dns_names: BTreeSet<String>,
}

/// Validates a policy's rules. Any invalid rule rejects the whole policy.
pub fn parse_rules(namespace: &str, spec: &EgressFirewallSpec) -> Result<Vec<Rule>, Error> {
    if spec.egress.len() > MAX_RULES {
        return Err(Error::TooManyRules {
            namespace: namespace.to_string(),
            rules: spec.egress.len(),
        });
    }
    spec.egress
        .iter()
        .enumerate()
        .map(|(index, rule)| Rule::parse(index, rule))
        .collect()
}

/// The priority of the rule at `index`. Callers must ensure that `index < MAX_RULES`.
pub fn priority(index: usize) -> u16 {
    EGRESS_FIREWALL_START_PRIORITY - index as u16
}

/// The key under which a namespace's egress firewall registers as a dependent policy.
pub fn dependent_key(namespace: &str) -> String {
    format!("EgressFirewall/{namespace}/{POLICY_NAME}")
}

/// Describes the outcome of installing a policy, for the egress firewall's status.
pub fn status<E: fmt::Display>(result: &Result<(), E>) -> EgressFirewallStatus {
    match result {
        Ok(()) => EgressFirewallStatus {
            status: Some(STATUS_APPLIED.to_string()),
            messages: vec![],
        },
        Err(error) => EgressFirewallStatus {
            status: Some(STATUS_FAILED.to_string()),
            messages: vec![format!("{error:#}")],
        },
    }
}

// === impl Rule ===

impl Rule {
    fn parse(index: usize, rule: &EgressFirewallRule) -> Result<Self, Error> {
        let action = match rule.rule_type {
            RuleType::Allow => Action::Allow,
            RuleType::Deny => Action::Drop,
        };

        let to = &rule.to;
        let cidr = to.cidr_selector.as_deref().filter(|s| !s.is_empty());
        let dns_name = to.dns_name.as_deref().filter(|s| !s.is_empty());
        let destination = match (cidr, dns_name, to.node_selector.as_ref()) {
            (Some(cidr), None, None) => Destination::Cidr(
                cidr.parse()
                    .map_err(|_| CidrParseError(cidr.to_string()))?,
            ),
            (None, Some(name), None) => Destination::DnsName(name.to_string()),
            (None, None, Some(selector)) => Destination::Nodes(selector.clone()),
            _ => return Err(Error::Destination { index }),
        };

        let ports = rule
            .ports
            .iter()
            .flatten()
            .map(|p| {
                let protocol = p
                    .protocol
                    .parse()
                    .map_err(|source| Error::Protocol { index, source })?;
                let port = match p.port {
                    None | Some(0) => None,
                    Some(port) => Some(
                        u16::try_from(port)
                            .map_err(|_| Error::Port { index, port })?,
                    ),
                };
                Ok(PortMatch { protocol, port })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            priority: priority(index),
            action,
            destination,
            ports,
        })
    }
}

// === impl PolicyState ===

impl PolicyState {
    fn acl_ids(&self) -> Vec<String> {
        self.acls.iter().map(|acl| acl.id.clone()).collect()
    }

    fn selects_nodes(&self) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r.destination, Destination::Nodes(_)))
    }
}

// === impl EgressFirewallReconciler ===

impl EgressFirewallReconciler {
    pub fn new(
        cluster: Arc<ClusterInfo>,
        store: Arc<dyn Store>,
        dns: Arc<EgressDns>,
        nodes: Arc<NodeIndex>,
    ) -> Self {
        let compiler = MatchCompiler::new(cluster.cluster_subnets.iter().copied());
        Self {
            cluster,
            store,
            compiler,
            dns,
            nodes,
            policies: Mutex::default(),
            node_policies: Mutex::default(),
        }
    }

    fn acl_ids(&self, namespace: &str, priority: u16) -> DbObjectIds {
        DbObjectIds::new(IdsType::AclEgressFirewall, &self.cluster.controller_name)
            .with(ObjectIdKey::ObjectName, namespace)
            .with(ObjectIdKey::Priority, priority)
    }

    /// Installs a namespace's egress firewall, replacing any rules installed before.
    ///
    /// Nothing is installed if any rule is invalid; previously installed rules are removed all the
    /// same. A policy with an unsupported name is rejected without touching the installed one.
    #[instrument(skip_all, fields(ns = %ns.name()))]
    pub async fn add(&self, ns: &NamespaceState, ef: &EgressFirewall) -> Result<(), Error> {
        let name = ef.name_any();
        if name != POLICY_NAME {
            return Err(Error::InvalidName(name));
        }

        let mut policy = self.lock_policy(ns.name()).await;
        let rules = match parse_rules(ns.name(), &ef.spec) {
            Ok(rules) => rules,
            Err(error) => {
                self.replace(ns, &mut policy, Vec::new()).await?;
                return Err(error);
            }
        };
        self.replace(ns, &mut policy, rules).await?;
        info!(acls = policy.acls.len(), "Egress firewall applied");
        Ok(())
    }

    /// Replaces a namespace's egress firewall. Every previously installed ACL is detached before
    /// the new rules are installed.
    pub async fn update(&self, ns: &NamespaceState, ef: &EgressFirewall) -> Result<(), Error> {
        self.add(ns, ef).await
    }

    /// Detaches every ACL installed for the namespace's egress firewall.
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str) -> Result<(), Error> {
        let Some(entry) = self.existing(namespace) else {
            return Ok(());
        };
        let mut policy = entry.clone().lock_owned().await;
        if !policy.acls.is_empty() {
            self.store
                .detach(&self.cluster.cluster_port_group, &policy.acl_ids())
                .await?;
            policy.acls.clear();
        }
        let dns_names = std::mem::take(&mut policy.dns_names);
        self.release_dns(namespace, dns_names.iter()).await;
        policy.rules.clear();

        let mut policies = self.policies.lock();
        if policies
            .get(namespace)
            .is_some_and(|cur| Arc::ptr_eq(cur, &entry))
        {
            policies.remove(namespace);
        }
        self.node_policies.lock().remove(namespace);
        info!("Egress firewall deleted");
        Ok(())
    }

    /// Re-ensures the installed ACLs with the namespace's current ACL logging levels.
    #[instrument(skip_all, fields(ns = %ns.name()))]
    pub async fn update_acl_logging(&self, ns: &NamespaceState) -> Result<(), Error> {
        let Some(entry) = self.existing(ns.name()) else {
            return Ok(());
        };
        let mut policy = entry.lock_owned().await;

        let levels = ns.acl_logging();
        let mut acls = policy.acls.clone();
        let mut changed = false;
        for acl in &mut acls {
            let severity = acl.action.log_severity(&levels);
            if acl.severity != severity {
                acl.set_logging(severity);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        self.store.ensure_acls(&acls).await?;
        policy.acls = acls;
        info!(%levels, "Egress firewall ACL logging updated");
        Ok(())
    }

    /// Recompiles a namespace's policy from its last declared rules, e.g. after the nodes selected
    /// by one of its rules changed.
    #[instrument(skip_all, fields(ns = %ns.name()))]
    pub async fn resync(&self, ns: &NamespaceState) -> Result<(), Error> {
        let Some(entry) = self.existing(ns.name()) else {
            return Ok(());
        };
        let mut policy = entry.lock_owned().await;
        let rules = policy.rules.clone();
        self.replace(ns, &mut policy, rules).await
    }

    /// Returns the namespaces whose policy selects destinations by node labels.
    pub fn node_selector_namespaces(&self) -> Vec<String> {
        self.node_policies.lock().iter().cloned().collect()
    }

    /// Removes the state left behind by policies that no longer exist.
    ///
    /// Detaches every ACL in the reserved egress firewall priority range that does not correspond
    /// to a rule of a declared policy, and destroys DNS address sets that no declared policy
    /// references. ACLs outside the reserved range are never touched.
    #[instrument(skip_all, fields(policies = declared.len()))]
    pub async fn sync(&self, declared: &[EgressFirewall]) -> Result<(), Error> {
        let mut expected = HashSet::new();
        let mut dns_names = HashSet::new();
        for ef in declared {
            let Some(namespace) = ef.namespace() else {
                continue;
            };
            if ef.name_any() != POLICY_NAME || ef.spec.egress.len() > MAX_RULES {
                continue;
            }
            for (index, rule) in ef.spec.egress.iter().enumerate() {
                expected.insert(self.acl_ids(&namespace, priority(index)).primary_key());
                if let Some(name) = rule.to.dns_name.as_deref().filter(|n| !n.is_empty()) {
                    dns_names.insert(name.to_string());
                }
            }
        }

        let reserved =
            MINIMUM_RESERVED_EGRESS_FIREWALL_PRIORITY..=EGRESS_FIREWALL_START_PRIORITY;
        let stale = self
            .store
            .list_acls()
            .await?
            .into_iter()
            .filter(|acl| reserved.contains(&acl.priority) && !expected.contains(&acl.id))
            .map(|acl| acl.id)
            .collect::<Vec<_>>();
        if !stale.is_empty() {
            self.store
                .detach(&self.cluster.cluster_port_group, &stale)
                .await?;
            info!(acls = stale.len(), "Detached stale egress firewall ACLs");
        }

        self.dns.sync(&dns_names).await?;
        Ok(())
    }

    fn existing(&self, namespace: &str) -> Option<Arc<AsyncMutex<PolicyState>>> {
        self.policies.lock().get(namespace).cloned()
    }

    /// Locks the namespace's policy, creating it if needed. Retries if the policy was removed
    /// while waiting for its lock.
    async fn lock_policy(&self, namespace: &str) -> OwnedMutexGuard<PolicyState> {
        loop {
            let entry = self
                .policies
                .lock()
                .entry(namespace.to_string())
                .or_default()
                .clone();
            let policy = entry.clone().lock_owned().await;
            let current = self
                .policies
                .lock()
                .get(namespace)
                .is_some_and(|cur| Arc::ptr_eq(cur, &entry));
            if current {
                return policy;
            }
        }
    }

    async fn replace(
        &self,
        ns: &NamespaceState,
        policy: &mut PolicyState,
        rules: Vec<Rule>,
    ) -> Result<(), Error> {
        let namespace = ns.name();
        if !policy.acls.is_empty() {
            let ids = policy.acl_ids();
            self.store
                .detach(&self.cluster.cluster_port_group, &ids)
                .await?;
            policy.acls.clear();
            debug!(acls = ids.len(), "Detached previous rules");
        }

        policy.rules = rules;
        {
            let mut node_policies = self.node_policies.lock();
            if policy.selects_nodes() {
                node_policies.insert(namespace.to_string());
            } else {
                node_policies.remove(namespace);
            }
        }

        let previous_dns = std::mem::take(&mut policy.dns_names);
        let mut dns_names = BTreeSet::new();
        let result = self.install(ns, &policy.rules, &mut dns_names).await;

        let keep = match result {
            Ok(_) => dns_names.clone(),
            Err(_) => BTreeSet::new(),
        };
        let released = previous_dns
            .union(&dns_names)
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        self.release_dns(namespace, released.iter()).await;

        policy.acls = result?;
        policy.dns_names = dns_names;
        Ok(())
    }

    async fn install(
        &self,
        ns: &NamespaceState,
        rules: &[Rule],
        dns_names: &mut BTreeSet<String>,
    ) -> Result<Vec<Acl>, Error> {
        let (v4_source, v6_source) = ns.address_set().hash_names();
        let levels = ns.acl_logging();

        let mut acls = Vec::with_capacity(rules.len());
        for rule in rules {
            let targets = match &rule.destination {
                Destination::Cidr(net) => vec![cidr_target(net)],
                Destination::DnsName(name) => {
                    let set = self.dns.add(ns.name(), name).await?;
                    dns_names.insert(name.clone());
                    let (v4, v6) = set.hash_names();
                    vec![
                        MatchTarget::new(MatchKind::V4AddressSet, v4),
                        MatchTarget::new(MatchKind::V6AddressSet, v6),
                    ]
                }
                Destination::Nodes(selector) => self
                    .nodes
                    .matching_ips(selector)
                    .into_iter()
                    .map(ip_target)
                    .collect(),
            };
            if targets.iter().all(|t| t.value.is_empty()) {
                warn!(
                    priority = rule.priority,
                    "Skipping egress firewall rule without destinations"
                );
                continue;
            }

            let match_expr = self
                .compiler
                .generate_match(v4_source, v6_source, &targets, &rule.ports);
            acls.push(Acl::new(
                &self.acl_ids(ns.name(), rule.priority),
                match_expr,
                rule.action,
                rule.priority,
                Direction::ToLport,
                rule.action.log_severity(&levels),
            ));
        }

        self.store.ensure_acls(&acls).await?;
        let ids = acls.iter().map(|acl| acl.id.clone()).collect::<Vec<_>>();
        self.store
            .attach(&self.cluster.cluster_port_group, &ids)
            .await?;
        Ok(acls)
    }

    /// Drops DNS references. Failures are logged; unreferenced sets are removed on the next
    /// startup sync.
    async fn release_dns(&self, namespace: &str, names: impl Iterator<Item = &String>) {
        for name in names {
            if let Err(error) = self.dns.remove(namespace, name).await {
                warn!(%namespace, dns_name = %name, %error, "Failed to release DNS address set");
            }
        }
    }
}

fn cidr_target(net: &IpNet) -> MatchTarget {
    match net {
        IpNet::V4(_) => MatchTarget::new(MatchKind::V4Cidr, net.to_string()),
        IpNet::V6(_) => MatchTarget::new(MatchKind::V6Cidr, net.to_string()),
    }
}

fn ip_target(ip: IpAddr) -> MatchTarget {
    match ip {
        IpAddr::V4(_) => MatchTarget::new(MatchKind::V4Cidr, ip.to_string()),
        IpAddr::V6(_) => MatchTarget::new(MatchKind::V6Cidr, ip.to_string()),
    }
}
