use crate::{
    cache::{NamespaceLookup, ObjectCache},
    core::{memory::MemoryStore, IpNet},
    dns,
    index::{ClusterInfo, Controller, EventMetrics},
    k8s::{self, EgressFirewall},
    status, watch,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "netpol",
    about = "Compiles namespaces and egress firewalls into network policy"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol=info,warn",
        env = "NETPOL_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Recorded as the owner of every address set and ACL the controller writes.
    #[clap(long, default_value = "default-network-controller")]
    controller_name: String,

    /// Network CIDRs of pod IPs. The address families present determine whether IPv4 and IPv6
    /// address sets are maintained.
    #[clap(long, default_value = "10.128.0.0/14")]
    cluster_subnets: IpNets,

    /// Honors the ACL-logging annotation on namespaces.
    #[clap(long)]
    enable_acl_logging: bool,

    /// Honors the multicast annotation on namespaces.
    #[clap(long)]
    enable_multicast: bool,

    /// Disables the EgressFirewall watch.
    #[clap(long)]
    disable_egress_firewall: bool,

    /// The port group that every pod's logical port belongs to.
    #[clap(long, default_value = "clusterPortGroup")]
    cluster_port_group: String,

    /// How often the DNS names referenced by egress firewalls are re-resolved.
    #[clap(long, default_value = "30")]
    dns_refresh_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            controller_name,
            cluster_subnets: IpNets(cluster_subnets),
            enable_acl_logging,
            enable_multicast,
            disable_egress_firewall,
            cluster_port_group,
            dns_refresh_secs,
        } = self;

        if cluster_subnets.is_empty() {
            bail!("at least one cluster subnet must be configured");
        }
        let mut cluster = ClusterInfo::new(controller_name, cluster_subnets);
        cluster.acl_logging_enabled = enable_acl_logging;
        cluster.multicast_support = enable_multicast;
        cluster.egress_firewall_enabled = !disable_egress_firewall;
        cluster.cluster_port_group = cluster_port_group;

        let mut prom = <Registry>::default();
        let metrics = EventMetrics::register(prom.sub_registry_with_prefix("netpol"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(
            controller = %cluster.controller_name,
            ipv4 = cluster.ipv4_mode,
            ipv6 = cluster.ipv6_mode,
            "Using the in-memory northbound store"
        );
        let store = Arc::new(MemoryStore::default());
        let namespaces = Arc::new(ObjectCache::<k8s::Namespace>::default());
        let pods = Arc::new(ObjectCache::<k8s::Pod>::default());
        let lookup = NamespaceLookup::new(
            namespaces.clone(),
            k8s::Api::all(runtime.client()),
        );
        let egress_firewall_enabled = cluster.egress_firewall_enabled;
        let controller = Arc::new(Controller::new(
            cluster,
            store,
            Arc::new(lookup),
            pods.clone(),
        ));

        // Spawn resource watches.

        let ns_events = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            watch::run(
                "Namespace",
                watch::Namespaces::new(controller.clone(), namespaces),
                metrics.clone(),
                ns_events,
            )
            .instrument(info_span!("namespaces")),
        );

        let pod_events = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            watch::run(
                "Pod",
                watch::Pods::new(controller.clone(), pods),
                metrics.clone(),
                pod_events,
            )
            .instrument(info_span!("pods")),
        );

        let node_events = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(
            watch::run(
                "Node",
                watch::Nodes::new(controller.clone()),
                metrics.clone(),
                node_events,
            )
            .instrument(info_span!("nodes")),
        );

        if egress_firewall_enabled {
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            let ef_events = runtime.watch_all::<EgressFirewall>(watcher::Config::default());
            tokio::spawn(
                watch::run(
                    "EgressFirewall",
                    watch::EgressFirewalls::new(
                        controller.clone(),
                        status::Updates::new(updates_tx),
                    ),
                    metrics,
                    ef_events,
                )
                .instrument(info_span!("egressfirewalls")),
            );

            tokio::spawn(
                status::Controller::new(runtime.client(), updates_rx)
                    .process_updates()
                    .instrument(info_span!("status_controller")),
            );

            tokio::spawn(
                dns::refresh(controller, Duration::from_secs(dns_refresh_secs.max(1)))
                    .instrument(info_span!("dns")),
            );
        } else {
            info!("EgressFirewall support is disabled");
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct IpNets(Vec<IpNet>);

impl std::str::FromStr for IpNets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| n.parse().map_err(Into::into))
            .collect::<Result<Vec<IpNet>>>()
            .map(Self)
    }
}
