//! Periodically pulls a feed's contents over HTTP.
//!
//! A [`Puller`] resolves the feed's URL and headers, fetches and parses the
//! body, normalizes the entries and declares the resulting snapshot to the
//! set controllers. Pulls that partially fail are rescheduled after
//! [`RESCHEDULE_DELAY`].

pub mod headers;
pub mod http;
pub mod normalize;
pub mod parse;


use self::{headers::HeaderError, http::PullFetchError, parse::ParseError};
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{header::HeaderMap, Url};
use std::sync::Arc;
use threatfeed_controller_core::{
    runloop, status, DomainNameSet, ErrorType, FeedCacher, IpSet, SetStore, StoreError,
};
use threatfeed_controller_k8s_api::{
    duration, threat_feed::ThreatFeedFormat, GlobalNetworkSet, GlobalThreatFeed, KeyValues,
};
use threatfeed_controller_k8s_sync::{
    DomainNameSetController, FailFn, GlobalNetworkSetController, IpSetController,
};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

pub use self::http::{FetchError, HttpClient, Response};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
pub const ATTEMPTS: usize = 3;
pub const BACKOFF: Duration = Duration::from_secs(5);
pub const RESCHEDULE_DELAY: Duration = Duration::from_secs(60);

/// The clients a puller reads from.
#[derive(Clone)]
pub struct PullClients {
    pub http: Arc<dyn HttpClient>,
    pub config_maps: Arc<dyn KeyValues>,
    pub secrets: Arc<dyn KeyValues>,
}

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("feed {0} has no HTTP pull configuration")]
    NotConfigured(String),

    #[error("invalid pull URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to resolve headers: {0}")]
    Headers(#[from] HeaderError),

    #[error(transparent)]
    Fetch(#[from] PullFetchError),

    #[error("failed to parse feed: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Clone)]
pub struct Puller {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    period: Duration,
    clients: PullClients,
    target: Target,
    state: Mutex<State>,
    token: Mutex<Option<CancellationToken>>,
}

enum Target {
    IpSet {
        store: Arc<dyn SetStore<IpSet>>,
        sets: IpSetController,
        gns: GlobalNetworkSetController,
    },
    DomainNameSet {
        store: Arc<dyn SetStore<DomainNameSet>>,
        sets: DomainNameSetController,
    },
}

struct State {
    feed: GlobalThreatFeed,
    generation: u64,
    needs_update: bool,
    url: Option<Url>,
    headers: HeaderMap,
}

/// The pull period configured on `feed`.
pub fn period(feed: &GlobalThreatFeed) -> Duration {
    feed.spec
        .pull
        .as_ref()
        .and_then(|p| p.period.as_deref())
        .and_then(duration::parse_period)
        .unwrap_or(DEFAULT_PERIOD)
}

// === impl Puller ===

impl Puller {
    pub fn ip_set(
        feed: &GlobalThreatFeed,
        clients: PullClients,
        store: Arc<dyn SetStore<IpSet>>,
        sets: IpSetController,
        gns: GlobalNetworkSetController,
    ) -> Self {
        Self::new(feed, clients, Target::IpSet { store, sets, gns })
    }

    pub fn domain_name_set(
        feed: &GlobalThreatFeed,
        clients: PullClients,
        store: Arc<dyn SetStore<DomainNameSet>>,
        sets: DomainNameSetController,
    ) -> Self {
        Self::new(feed, clients, Target::DomainNameSet { store, sets })
    }

    fn new(feed: &GlobalThreatFeed, clients: PullClients, target: Target) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: feed.metadata.name.clone().unwrap_or_default(),
                period: period(feed),
                clients,
                target,
                state: Mutex::new(State {
                    feed: feed.clone(),
                    generation: 0,
                    needs_update: true,
                    url: None,
                    headers: HeaderMap::new(),
                }),
                token: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Replaces the feed. The URL and headers are resolved again on the next
    /// pull.
    pub fn set_feed(&self, feed: GlobalThreatFeed) {
        let mut state = self.inner.state.lock();
        state.feed = feed;
        state.generation += 1;
        state.needs_update = true;
    }

    pub fn needs_update(&self) -> bool {
        self.inner.state.lock().needs_update
    }

    /// Spawns the pull loop. Only the first call has an effect, and none
    /// after [`Puller::close`].
    pub fn run(&self, parent: &CancellationToken, cacher: FeedCacher) {
        let token = {
            let mut slot = self.inner.token.lock();
            if slot.is_some() {
                return;
            }
            slot.insert(parent.child_token()).clone()
        };
        let puller = self.clone();
        let span = info_span!("puller", feed = %self.inner.name);
        tokio::spawn(async move { puller.pull_loop(cacher, token).await }.instrument(span));
    }

    pub fn close(&self) {
        self.inner
            .token
            .lock()
            .get_or_insert_with(CancellationToken::new)
            .cancel();
    }

    async fn pull_loop(self, cacher: FeedCacher, token: CancellationToken) {
        let (mut run_loop, rescheduler) =
            runloop::with_reschedule(self.inner.period, RESCHEDULE_DELAY);
        let fail: FailFn = Arc::new(move || {
            if let Err(error) = rescheduler.reschedule() {
                debug!(%error, "Pull not rescheduled");
            }
        });

        let delay = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            delay = async {
                self.sync_from_store(&cacher, &fail).await;
                self.startup_delay().await
            } => delay,
        };
        if !delay.is_zero() {
            debug!(?delay, "Delaying first pull");
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }

        while run_loop.tick(&token).await.is_ok() {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                res = self.query(&cacher, &fail, ATTEMPTS, BACKOFF) => {
                    if let Err(error) = res {
                        warn!(%error, "Pull failed");
                    }
                }
            }
        }
        debug!("Stopped");
    }

    /// The time remaining in the current period since the stored set was
    /// last written.
    async fn startup_delay(&self) -> Duration {
        let name = &self.inner.name;
        let modified = match &self.inner.target {
            Target::IpSet { store, .. } => store.get_modified(name).await,
            Target::DomainNameSet { store, .. } => store.get_modified(name).await,
        };
        match modified {
            Ok(Some(modified)) => {
                let since = (Utc::now() - modified).to_std().unwrap_or_default();
                self.inner.period.saturating_sub(since)
            }
            Ok(None) => Duration::ZERO,
            Err(error) => {
                warn!(%error, "Failed to read last modified time");
                Duration::ZERO
            }
        }
    }

    /// Declares the stored IP set to the GlobalNetworkSet controller so that
    /// it is not collected before the first pull completes.
    async fn sync_from_store(&self, cacher: &FeedCacher, fail: &FailFn) {
        let Target::IpSet { store, gns, .. } = &self.inner.target else {
            return;
        };
        let Some(labels) = self.gns_labels() else {
            return;
        };
        let name = &self.inner.name;
        match store.get(name).await {
            Ok(IpSet(nets)) => {
                gns.add(
                    GlobalNetworkSet::for_feed(name, &labels, nets),
                    fail.clone(),
                    cacher.clone(),
                );
            }
            Err(StoreError::NotFound(_)) => debug!("No stored set"),
            Err(error) => {
                status::add_error_condition(
                    cacher,
                    ErrorType::GlobalNetworkSetSyncFailed,
                    format!("failed to read stored set: {error}"),
                )
                .await
            }
        }
    }

    async fn query(
        &self,
        cacher: &FeedCacher,
        fail: &FailFn,
        attempts: usize,
        backoff: Duration,
    ) -> Result<(), PullError> {
        let res = self.pull(cacher, fail, attempts, backoff).await;
        if let Err(error) = &res {
            status::add_error_condition(cacher, ErrorType::PullFailed, error).await;
        }
        res
    }

    async fn pull(
        &self,
        cacher: &FeedCacher,
        fail: &FailFn,
        attempts: usize,
        backoff: Duration,
    ) -> Result<(), PullError> {
        let (url, headers, format) = self.resolve().await?;
        let client = &*self.inner.clients.http;
        let body = http::fetch(client, &url, &headers, attempts, backoff).await?;
        let entries = parse::parse(&format, &body)?;

        let name = &self.inner.name;
        match &self.inner.target {
            Target::IpSet { sets, gns, .. } => {
                let nets = normalize::normalize_ips(name, entries);
                debug!(entries = nets.len(), "Pulled IP set");
                sets.add(name.clone(), IpSet(nets.clone()), fail.clone(), cacher.clone());
                if let Some(labels) = self.gns_labels() {
                    gns.add(
                        GlobalNetworkSet::for_feed(name, &labels, nets),
                        fail.clone(),
                        cacher.clone(),
                    );
                }
            }
            Target::DomainNameSet { sets, .. } => {
                let domains = normalize::canonicalize_domains(entries);
                debug!(entries = domains.len(), "Pulled domain name set");
                sets.add(name.clone(), DomainNameSet(domains), fail.clone(), cacher.clone());
                if self.gns_labels().is_some() {
                    status::add_error_condition(
                        cacher,
                        ErrorType::GlobalNetworkSetSyncFailed,
                        "GlobalNetworkSet sync is not supported for domain name sets",
                    )
                    .await;
                }
            }
        }

        status::record_successful_sync(cacher, Utc::now()).await;
        Ok(())
    }

    /// Returns the URL, headers and format for the next pull, resolving them
    /// if the feed has changed since the last pull.
    async fn resolve(&self) -> Result<(Url, HeaderMap, ThreatFeedFormat), PullError> {
        let (feed, generation) = {
            let state = self.inner.state.lock();
            if let (false, Some(url), Some(http)) =
                (state.needs_update, &state.url, state.feed.http_pull())
            {
                return Ok((url.clone(), state.headers.clone(), http.format.clone()));
            }
            (state.feed.clone(), state.generation)
        };

        let http = feed
            .http_pull()
            .ok_or_else(|| PullError::NotConfigured(self.inner.name.clone()))?;
        let url = Url::parse(&http.url).map_err(|error| PullError::InvalidUrl {
            url: http.url.clone(),
            reason: error.to_string(),
        })?;
        let headers = headers::resolve(
            &http.headers,
            &*self.inner.clients.config_maps,
            &*self.inner.clients.secrets,
        )
        .await?;

        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.url = Some(url.clone());
            state.headers = headers.clone();
            state.needs_update = false;
        }
        Ok((url, headers, http.format.clone()))
    }

    fn gns_labels(&self) -> Option<std::collections::BTreeMap<String, String>> {
        self.inner
            .state
            .lock()
            .feed
            .global_network_set_labels()
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    fn resolved(&self) -> (Option<Url>, HeaderMap) {
        let state = self.inner.state.lock();
        (state.url.clone(), state.headers.clone())
    }
}
