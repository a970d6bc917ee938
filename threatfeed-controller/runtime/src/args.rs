use crate::Elastic;
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use threatfeed_controller_feeds::{PullClients, Reconcilers, Stores, Watcher};
use threatfeed_controller_k8s_api::{
    global_network_set::creator_selector, Api, ConfigMaps, GlobalNetworkSet, GlobalThreatFeed,
    K8sDuration, Secrets,
};
use threatfeed_controller_k8s_sync::{
    DomainNameSetController, GlobalNetworkSetController, IpSetController,
};
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[clap(name = "threatfeed", about = "A global threat feed controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "threatfeed=info,warn",
        env = "THREATFEED_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace holding the ConfigMaps and Secrets referenced by feed headers.
    #[clap(long, env = "FEEDS_NAMESPACE", default_value = "tigera-intrusion-detection")]
    feeds_namespace: String,

    /// Suffix of every Elasticsearch index the controller reads or writes.
    #[clap(long, env = "CLUSTER_NAME", default_value = "cluster")]
    cluster_name: String,

    #[clap(long, env = "ELASTIC_URL", default_value = "http://localhost:9200")]
    elastic_url: reqwest::Url,

    #[clap(long, env = "ELASTIC_USERNAME")]
    elastic_username: Option<String>,

    #[clap(long, env = "ELASTIC_PASSWORD", hide_env_values = true)]
    elastic_password: Option<String>,

    /// How often stored sets are compared against the desired sets.
    #[clap(long, default_value = "15s")]
    set_reconcile_period: K8sDuration,

    #[clap(long, default_value = "5m")]
    search_period: K8sDuration,

    /// How long a reported event is remembered to suppress duplicates.
    #[clap(long, default_value = "1h")]
    event_cache_ttl: K8sDuration,

    /// Timeout applied to every feed download and Elasticsearch request.
    #[clap(long, default_value = "60s")]
    http_timeout: K8sDuration,
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
            feeds_namespace,
            cluster_name,
            elastic_url,
            elastic_username,
            elastic_password,
            set_reconcile_period,
            search_period,
            event_cache_ttl,
            http_timeout,
        } = self;

        let set_reconcile_period = positive("set-reconcile-period", set_reconcile_period)?;
        let search_period = positive("search-period", search_period)?;
        let event_cache_ttl = positive("event-cache-ttl", event_cache_ttl)?;
        let http_timeout = positive("http-timeout", http_timeout)?;

        let mut prom = <Registry>::default();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Bridge the runtime's graceful shutdown into the token every actor
        // observes.
        let token = CancellationToken::new();
        tokio::spawn({
            let shutdown = runtime.shutdown_handle();
            let token = token.clone();
            async move {
                let _release = shutdown.signaled().await;
                info!("Shutting down");
                token.cancel();
            }
        });

        let http = reqwest::Client::builder().timeout(http_timeout).build()?;
        let elastic = Elastic::new(
            http.clone(),
            elastic_url,
            elastic_username,
            elastic_password,
            &cluster_name,
        );

        let k8s = runtime.client();
        let pull = PullClients {
            http: Arc::new(http),
            config_maps: Arc::new(ConfigMaps(Api::namespaced(k8s.clone(), &feeds_namespace))),
            secrets: Arc::new(Secrets(Api::namespaced(k8s.clone(), &feeds_namespace))),
        };
        let stores = Stores {
            ip_sets: Arc::new(elastic.clone()),
            domain_name_sets: Arc::new(elastic.clone()),
            events: Arc::new(elastic.clone()),
            suspicious: Arc::new(elastic.clone()),
        };

        let reconcilers = Reconcilers {
            ip_sets: IpSetController::new(Arc::new(elastic.clone()), set_reconcile_period),
            domain_name_sets: DomainNameSetController::new(
                Arc::new(elastic),
                set_reconcile_period,
            ),
            global_network_sets: GlobalNetworkSetController::new(Arc::new(
                Api::<GlobalNetworkSet>::all(k8s.clone()),
            )),
        };
        tokio::spawn(
            reconcilers
                .ip_sets
                .clone()
                .run(token.clone())
                .instrument(info_span!("ipsets")),
        );
        tokio::spawn(
            reconcilers
                .domain_name_sets
                .clone()
                .run(token.clone())
                .instrument(info_span!("domainnamesets")),
        );

        // Only the sets this controller created are observed.
        let selector = creator_selector();
        let global_network_sets = runtime.watch_all::<GlobalNetworkSet>(
            watcher::Config::default().labels(&selector),
        );
        tokio::spawn(
            reconcilers
                .global_network_sets
                .clone()
                .run(global_network_sets, token.clone())
                .instrument(info_span!("globalnetworksets")),
        );

        let feeds_watcher = Watcher::new(
            Arc::new(Api::<GlobalThreatFeed>::all(k8s)),
            pull,
            stores,
            reconcilers,
            search_period,
            event_cache_ttl,
        );
        let feeds = runtime.watch_all::<GlobalThreatFeed>(watcher::Config::default());
        tokio::spawn(
            feeds_watcher
                .clone()
                .run(feeds, token.clone())
                .instrument(info_span!("watcher")),
        );
        tokio::spawn(liveness(feeds_watcher, token).instrument(info_span!("liveness")));

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn positive(flag: &str, duration: K8sDuration) -> Result<Duration> {
    match duration.positive() {
        Some(d) => Ok(d),
        None => bail!("--{flag} must be positive, got {duration}"),
    }
}

/// Periodically checks that the watcher is still draining its queue.
async fn liveness(watcher: Watcher, token: CancellationToken) {
    let mut interval = time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        match time::timeout(PING_TIMEOUT, watcher.ping()).await {
            Ok(Ok(())) => debug!("Watcher is responsive"),
            Ok(Err(error)) => error!(%error, "Watcher is not running"),
            Err(_) => error!(timeout = ?PING_TIMEOUT, "Watcher did not answer ping"),
        }
    }
}
