use crate::{
    k8s::{
        gateway::{Gateway, TCPRoute, UDPRoute},
        Client, Resource,
    },
    controllers::{self, Context},
    reconcile::{Config, Driver, DriverMetrics, KubeStore, ResourceId},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::time::Duration;

#[derive(Debug, Parser)]
#[clap(
    name = "gateway-controller",
    about = "Allocates Gateway addresses and exposes TCP and UDP routes on them"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gateway_controller=info,warn",
        env = "GATEWAY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The GatewayClass controller name served by this controller.
    #[clap(long, default_value = "kube-vip.io/gateway-controller")]
    controller_name: String,

    /// Identifies the objects whose addresses are allocated from the same
    /// pools.
    #[clap(long, default_value = "kube-vip")]
    implementation: String,

    #[clap(long, default_value = "kubevip")]
    config_map_name: String,

    #[clap(long, default_value = "kube-system")]
    config_map_namespace: String,

    /// The ConfigMap, in the pool ConfigMap's namespace, that records
    /// allocated addresses.
    #[clap(long, default_value = "gateway-api-ipam-ledger")]
    ledger_name: String,

    #[clap(long, default_value = "5000")]
    store_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    requeue_delay_ms: u64,
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
            implementation,
            config_map_name,
            config_map_namespace,
            ledger_name,
            store_timeout_ms,
            requeue_delay_ms,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = DriverMetrics::register(prom.sub_registry_with_prefix("gateway_controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let config = Config {
            controller_name,
            implementation,
            pool_config: ResourceId::new(&config_map_namespace, &config_map_name),
            ledger: ResourceId::new(&config_map_namespace, &ledger_name),
        };
        tracing::info!(
            controller = %config.controller_name,
            implementation = %config.implementation,
            pools = %config.pool_config,
            ledger = %config.ledger,
            "Starting"
        );
        let store = KubeStore::new(runtime.client(), Duration::from_millis(store_timeout_ms));
        let controller_name = config.controller_name.clone();
        let implementation = config.implementation.clone();
        let ledger = config.ledger.clone();
        let driver = Driver::new(store, config, metrics);
        let ctx = Context::new(driver, controller_name, Duration::from_millis(requeue_delay_ms));
        let client = runtime.client();

        if !api_resource_exists::<Gateway>(&client).await {
            bail!("gateways.gateway.networking.k8s.io resource kind not found");
        }
        let gateways = controllers::gateways(&client, ctx.clone(), runtime.shutdown_handle());
        controllers::ledger(
            &client,
            &ledger,
            gateways,
            ctx.clone(),
            runtime.shutdown_handle(),
        );

        let tcp_routes = if api_resource_exists::<TCPRoute>(&client).await {
            Some(controllers::routes::<TCPRoute>(
                &client,
                ctx.clone(),
                runtime.shutdown_handle(),
            ))
        } else {
            tracing::warn!(
                "tcproutes.gateway.networking.k8s.io resource kind not found, skipping watches"
            );
            None
        };

        let udp_routes = if api_resource_exists::<UDPRoute>(&client).await {
            Some(controllers::routes::<UDPRoute>(
                &client,
                ctx.clone(),
                runtime.shutdown_handle(),
            ))
        } else {
            tracing::warn!(
                "udproutes.gateway.networking.k8s.io resource kind not found, skipping watches"
            );
            None
        };

        controllers::endpoints(
            &client,
            &implementation,
            tcp_routes,
            udp_routes,
            ctx,
            runtime.shutdown_handle(),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
