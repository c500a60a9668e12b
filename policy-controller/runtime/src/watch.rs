//! Dispatches watch events to the controller.
//!
//! A watch delivers a complete list of objects when it starts and whenever it restarts. Each handler
//! reconciles that list against what it has already seen so that objects deleted while the watch
//! was down are cleaned up; afterwards individual events are applied as they arrive.

use crate::{cache::ObjectCache, status};
use anyhow::{bail, Result};
use futures::prelude::*;
use kube::runtime::watcher;
use netpol_controller_k8s_api::{EgressFirewall, Namespace, Node, Pod, ResourceExt};
use netpol_controller_k8s_index::{egress_firewall, metrics::Op, Controller, EventMetrics};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[async_trait::async_trait]
pub trait Handle<T: Send + 'static>: Send + Sync {
    async fn apply(&self, obj: T) -> Result<()>;

    async fn delete(&self, obj: T) -> Result<()>;

    /// Handles the complete list of objects returned when a watch (re)starts.
    async fn reset(&self, objs: Vec<T>) -> Result<()>;
}

pub struct Namespaces {
    controller: Arc<Controller>,
    cache: Arc<ObjectCache<Namespace>>,
}

pub struct Pods {
    controller: Arc<Controller>,
    cache: Arc<ObjectCache<Pod>>,
}

pub struct Nodes {
    controller: Arc<Controller>,
}

pub struct EgressFirewalls {
    controller: Arc<Controller>,
    cache: ObjectCache<EgressFirewall>,
    status: status::Updates,
}

/// Feeds a watch's events to `handler` until the watch ends.
pub async fn run<T, H>(
    kind: &'static str,
    handler: H,
    metrics: EventMetrics,
    events: impl Stream<Item = watcher::Event<T>>,
) where
    T: Send + 'static,
    H: Handle<T>,
{
    let mut events = std::pin::pin!(events);
    let mut listing = None;
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => listing = Some(Vec::new()),
            watcher::Event::InitApply(obj) => listing.get_or_insert_with(Vec::new).push(obj),
            watcher::Event::InitDone => {
                let objs = listing.take().unwrap_or_default();
                debug!(kind, objects = objs.len(), "Reconciling listed objects");
                let res = handler.reset(objs).await;
                if let Err(error) = &res {
                    error!(kind, %error, "Failed to reconcile listed objects");
                }
                metrics.record(kind, Op::sync, &res);
                metrics.reset(kind);
            }
            watcher::Event::Apply(obj) => {
                let res = handler.apply(obj).await;
                if let Err(error) = &res {
                    warn!(kind, %error, "Failed to handle update");
                }
                metrics.record(kind, Op::apply, &res);
            }
            watcher::Event::Delete(obj) => {
                let res = handler.delete(obj).await;
                if let Err(error) = &res {
                    warn!(kind, %error, "Failed to handle deletion");
                }
                metrics.record(kind, Op::delete, &res);
            }
        }
    }
    debug!(kind, "Watch ended");
}

fn check(failed: usize, what: &str) -> Result<()> {
    if failed > 0 {
        bail!("failed to handle {failed} {what}");
    }
    Ok(())
}

// === impl Namespaces ===

impl Namespaces {
    pub fn new(controller: Arc<Controller>, cache: Arc<ObjectCache<Namespace>>) -> Self {
        Self { controller, cache }
    }
}

#[async_trait::async_trait]
impl Handle<Namespace> for Namespaces {
    async fn apply(&self, ns: Namespace) -> Result<()> {
        match self.cache.apply(ns.clone()) {
            None => self.controller.add_namespace(&ns).await,
            Some(_) => self.controller.update_namespace(&ns).await,
        }
    }

    async fn delete(&self, ns: Namespace) -> Result<()> {
        self.cache.delete(&ns);
        self.controller.delete_namespace(&ns.name_any()).await
    }

    async fn reset(&self, namespaces: Vec<Namespace>) -> Result<()> {
        let mut failed = 0;
        for ns in self.cache.reset(namespaces.iter().cloned()) {
            if let Err(error) = self.controller.delete_namespace(&ns.name_any()).await {
                warn!(ns = %ns.name_any(), %error, "Failed to remove namespace");
                failed += 1;
            }
        }

        self.controller.sync_namespaces(&namespaces).await?;

        for ns in &namespaces {
            if let Err(error) = self.controller.add_namespace(ns).await {
                warn!(ns = %ns.name_any(), %error, "Failed to configure namespace");
                failed += 1;
            }
        }
        check(failed, "namespaces")
    }
}

// === impl Pods ===

impl Pods {
    pub fn new(controller: Arc<Controller>, cache: Arc<ObjectCache<Pod>>) -> Self {
        Self { controller, cache }
    }
}

#[async_trait::async_trait]
impl Handle<Pod> for Pods {
    async fn apply(&self, pod: Pod) -> Result<()> {
        self.cache.apply(pod.clone());
        self.controller.add_pod(&pod).await
    }

    async fn delete(&self, pod: Pod) -> Result<()> {
        self.cache.delete(&pod);
        self.controller.delete_pod(&pod).await
    }

    async fn reset(&self, pods: Vec<Pod>) -> Result<()> {
        let removed = self.cache.reset(pods.iter().cloned());

        let mut failed = 0;
        for pod in removed.iter() {
            if let Err(error) = self.controller.delete_pod(pod).await {
                warn!(ns = ?pod.namespace(), pod = %pod.name_any(), %error, "Failed to remove pod");
                failed += 1;
            }
        }
        for pod in pods.iter() {
            if let Err(error) = self.controller.add_pod(pod).await {
                warn!(ns = ?pod.namespace(), pod = %pod.name_any(), %error, "Failed to add pod");
                failed += 1;
            }
        }
        check(failed, "pods")
    }
}

// === impl Nodes ===

impl Nodes {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait::async_trait]
impl Handle<Node> for Nodes {
    async fn apply(&self, node: Node) -> Result<()> {
        self.controller.apply_node(&node).await
    }

    async fn delete(&self, node: Node) -> Result<()> {
        self.controller.delete_node(&node.name_any()).await
    }

    async fn reset(&self, nodes: Vec<Node>) -> Result<()> {
        self.controller.sync_nodes(&nodes).await
    }
}

// === impl EgressFirewalls ===

impl EgressFirewalls {
    pub fn new(controller: Arc<Controller>, status: status::Updates) -> Self {
        Self {
            controller,
            cache: ObjectCache::default(),
            status,
        }
    }

    async fn install(&self, ef: &EgressFirewall, known: bool) -> Result<()> {
        let res = if known {
            self.controller.update_egress_firewall(ef).await
        } else {
            self.controller.add_egress_firewall(ef).await
        };
        self.status.report(ef, egress_firewall::status(&res));
        res
    }
}

#[async_trait::async_trait]
impl Handle<EgressFirewall> for EgressFirewalls {
    async fn apply(&self, ef: EgressFirewall) -> Result<()> {
        let Some(prior) = self.cache.apply(ef.clone()) else {
            return self.install(&ef, false).await;
        };

        // Patching the status produces an event of its own; there is nothing to reinstall.
        let applied = ef.status.as_ref().and_then(|s| s.status.as_deref())
            == Some(egress_firewall::STATUS_APPLIED);
        if applied && prior.spec == ef.spec {
            debug!(ns = ?ef.namespace(), name = %ef.name_any(), "Egress firewall is unchanged");
            return Ok(());
        }
        self.install(&ef, true).await
    }

    async fn delete(&self, ef: EgressFirewall) -> Result<()> {
        self.cache.delete(&ef);
        self.controller.delete_egress_firewall(&ef).await
    }

    async fn reset(&self, firewalls: Vec<EgressFirewall>) -> Result<()> {
        let mut failed = 0;
        for ef in self.cache.reset(firewalls.iter().cloned()) {
            if let Err(error) = self.controller.delete_egress_firewall(&ef).await {
                warn!(ns = ?ef.namespace(), %error, "Failed to remove egress firewall");
                failed += 1;
            }
        }

        self.controller.sync_egress_firewalls(&firewalls).await?;

        for ef in firewalls.iter() {
            if let Err(error) = self.install(ef, false).await {
                warn!(ns = ?ef.namespace(), %error, "Failed to install egress firewall");
                failed += 1;
            }
        }
        check(failed, "egress firewalls")
    }
}
