#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use augmented_policy_controller::{
    controller, ControllerMetrics, DnsResolver, FilteredResolver, IpFilter, KubeNodes, KubeStore,
    PodNetworks, Reconciler, ResolverMetrics,
};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{sync::Arc, time::Duration};
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "augmented-policy",
    version,
    about = "Maintains NetworkPolicies for hostname-based egress policies"
)]
struct Args {
    /// The tracing filter used for logs
    #[clap(
        long,
        env = "AUGMENTED_POLICY_CONTROLLER_LOG",
        default_value = "augmented_policy_controller=info,warn"
    )]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Networks that resolved addresses may never fall within.
    ///
    /// The default covers the cloud metadata endpoint and loopback.
    #[clap(long, default_value = "169.254.169.254/32,127.0.0.0/8")]
    deny_networks: Networks,

    /// Networks that resolved addresses must fall within.
    ///
    /// When empty, every address that is not denied is allowed.
    #[clap(long, default_value = "")]
    allow_networks: Networks,

    /// Denies the pod networks assigned to the cluster's nodes.
    #[clap(long)]
    detect_pod_networks: bool,

    /// How often node pod networks are refreshed.
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pod_network_refresh: Duration,

    /// The time allowed to resolve all of a policy's hostnames.
    #[clap(long, default_value = "30s", value_parser = humantime::parse_duration)]
    resolve_timeout: Duration,
}

/// A comma-separated list of networks.
#[derive(Clone, Debug)]
struct Networks(Vec<String>);

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        deny_networks: Networks(deny_networks),
        allow_networks: Networks(allow_networks),
        detect_pod_networks,
        pod_network_refresh,
        resolve_timeout,
    } = Args::parse();

    let filter = Arc::new(IpFilter::new(&allow_networks, &deny_networks)?);

    let mut prom = <Registry>::default();
    let reg = prom.sub_registry_with_prefix("augmented_policy");
    let controller_metrics = ControllerMetrics::register(reg);
    let resolver_metrics = ResolverMetrics::register(reg);

    let runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin.into_builder().with_prometheus(prom))
        .with_client(client)
        .build()
        .await?;

    tracing::info!(
        allow = ?filter.allow_networks(),
        deny = ?filter.deny_networks(),
        detect_pod_networks,
        "configured address filter"
    );

    if detect_pod_networks {
        PodNetworks::new(
            KubeNodes::new(runtime.client()),
            filter.clone(),
            pod_network_refresh,
        )
        .spawn(runtime.shutdown_handle());
    }

    let dns = DnsResolver::from_system_config()?;
    let resolver = FilteredResolver::new(dns, filter, resolver_metrics);
    let reconciler = Reconciler::new(
        Arc::new(KubeStore::new(runtime.client())),
        Arc::new(resolver),
        controller_metrics,
        resolve_timeout,
    );
    tokio::spawn(
        controller::run(runtime.client(), reconciler, runtime.shutdown_handle())
            .instrument(info_span!("controller")),
    );

    // Block the main thread on the shutdown signal. Once it fires, wait for the
    // background tasks to complete before exiting.
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }

    Ok(())
}

// === impl Networks ===

impl std::str::FromStr for Networks {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Each network is validated when the filter is built.
        let nets = s
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        Ok(Self(nets))
    }
}
