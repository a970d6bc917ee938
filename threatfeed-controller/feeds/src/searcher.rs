//! Periodically searches stored logs for traffic matching a feed and
//! persists the resulting security events.
//!
//! Events are identified by id. Ids persisted within the last `ttl` are
//! remembered so that overlapping searches do not raise duplicate events.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use threatfeed_controller_core::{
    runloop, status, CacheError, ErrorType, EventSink, FeedCacher, SecurityEvent, StoreError,
    SuspiciousSet,
};
use threatfeed_controller_k8s_api::{
    threat_feed::{ThreatFeedContent, ThreatFeedMode, DOMAIN_NAME_SET_HASH_KEY, IP_SET_HASH_KEY},
    GlobalThreatFeed,
};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("failed to query suspicious set: {0}")]
    Query(#[source] StoreError),

    #[error("failed to store events: {0}")]
    Persist(#[source] StoreError),

    #[error("failed to update feed: {0}")]
    Feed(#[from] CacheError),
}

#[derive(Clone)]
pub struct Searcher {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    period: Duration,
    ttl: Duration,
    suspicious: Arc<dyn SuspiciousSet>,
    events: Arc<dyn EventSink>,
    seen: Mutex<HashMap<String, Instant>>,
    token: Mutex<Option<CancellationToken>>,
}

// === impl Searcher ===

impl Searcher {
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        ttl: Duration,
        suspicious: Arc<dyn SuspiciousSet>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                period,
                ttl,
                suspicious,
                events,
                seen: Default::default(),
                token: Default::default(),
            }),
        }
    }

    /// Spawns the search loop. Only the first call has an effect, and none
    /// after [`Searcher::close`].
    pub fn run(&self, parent: &CancellationToken, cacher: FeedCacher) {
        let token = {
            let mut slot = self.inner.token.lock();
            if slot.is_some() {
                return;
            }
            slot.insert(parent.child_token()).clone()
        };
        let searcher = self.clone();
        let span = info_span!("searcher", feed = %self.inner.name);
        tokio::spawn(
            async move {
                runloop::run(token, searcher.inner.period, || {
                    let searcher = searcher.clone();
                    let cacher = cacher.clone();
                    async move {
                        if let Err(error) = searcher.search(&cacher).await {
                            warn!(%error, "Search failed");
                        }
                    }
                })
                .await;
                debug!("Stopped");
            }
            .instrument(span),
        );
    }

    pub fn close(&self) {
        self.inner
            .token
            .lock()
            .get_or_insert_with(CancellationToken::new)
            .cancel();
    }

    /// Runs one search. Failures are recorded as a `SearchFailed` condition
    /// on the feed.
    pub async fn search(&self, cacher: &FeedCacher) -> Result<(), SearchError> {
        self.purge();

        let feed = cacher.get().await?;
        if feed.mode() != ThreatFeedMode::Enabled {
            debug!("Feed disabled");
            return Ok(());
        }

        let res = self.search_feed(cacher, &feed).await;
        if let Err(error) = &res {
            status::add_error_condition(cacher, ErrorType::SearchFailed, error).await;
        }
        res
    }

    async fn search_feed(
        &self,
        cacher: &FeedCacher,
        feed: &GlobalThreatFeed,
    ) -> Result<(), SearchError> {
        let result = self
            .inner
            .suspicious
            .query_set(feed)
            .await
            .map_err(SearchError::Query)?;

        let unseen = self.unseen(result.events);
        if !unseen.is_empty() {
            debug!(events = unseen.len(), "Storing events");
            self.inner
                .events
                .put_with_id(&unseen)
                .await
                .map_err(SearchError::Persist)?;
            let now = Instant::now();
            let mut seen = self.inner.seen.lock();
            for event in unseen {
                seen.insert(event.id, now);
            }
        }

        if !result.set_hash.is_empty() {
            let key = match feed.content() {
                ThreatFeedContent::IPSet => IP_SET_HASH_KEY,
                ThreatFeedContent::DomainNameSet => DOMAIN_NAME_SET_HASH_KEY,
            };
            let hash = result.set_hash;
            status::update_with(cacher, |feed| {
                let annotations = feed.metadata.annotations.get_or_insert_with(Default::default);
                if annotations.get(key) == Some(&hash) {
                    return false;
                }
                annotations.insert(key.to_string(), hash.clone());
                true
            })
            .await?;
        }

        status::record_successful_search(cacher, result.last_search).await?;
        Ok(())
    }

    /// Returns the events whose ids have not been seen, without repeats.
    fn unseen(&self, events: Vec<SecurityEvent>) -> Vec<SecurityEvent> {
        let seen = self.inner.seen.lock();
        let mut ids = std::collections::HashSet::new();
        events
            .into_iter()
            .filter(|e| !seen.contains_key(&e.id) && ids.insert(e.id.clone()))
            .collect()
    }

    fn purge(&self) {
        let ttl = self.inner.ttl;
        let now = Instant::now();
        self.inner
            .seen
            .lock()
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }
}
