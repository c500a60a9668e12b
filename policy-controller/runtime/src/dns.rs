use netpol_controller_k8s_index::Controller;
use std::{io, net::IpAddr, sync::Arc};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodically re-resolves every DNS name referenced by an installed egress firewall and
/// publishes the results to the controller.
pub async fn refresh(controller: Arc<Controller>, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for name in controller.dns_names().await {
            let ips = match resolve(&name).await {
                Ok(ips) => ips,
                Err(error) => {
                    debug!(%name, %error, "Failed to resolve DNS name");
                    continue;
                }
            };
            match controller.update_dns(&name, ips).await {
                Ok(true) => {}
                Ok(false) => debug!(%name, "DNS name is no longer referenced"),
                Err(error) => warn!(%name, %error, "Failed to update DNS address set"),
            }
        }
    }
}

async fn resolve(name: &str) -> io::Result<Vec<IpAddr>> {
    let mut ips = tokio::net::lookup_host((name.trim_end_matches('.'), 0))
        .await?
        .map(|addr| addr.ip())
        .collect::<Vec<_>>();
    ips.sort();
    ips.dedup();
    Ok(ips)
}
