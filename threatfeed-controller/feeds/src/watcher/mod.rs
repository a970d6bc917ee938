//! Starts, updates and stops the actors serving each `GlobalThreatFeed`.
//!
//! Feed events are consumed from a single queue so that they are applied in
//! order. The same queue carries pings, which are answered once every event
//! queued before them has been applied.


use crate::{
    puller::{self, PullClients, Puller},
    searcher::Searcher,
};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use threatfeed_controller_core::{
    DomainNameSet, EventSink, FeedCacher, IpSet, SetStore, SuspiciousSet, ThreatFeeds,
};
use threatfeed_controller_k8s_api::{
    global_network_set::global_network_set_name,
    threat_feed::{ThreatFeedContent, ThreatFeedFormat},
    watcher, GlobalThreatFeed, ResourceExt,
};
use threatfeed_controller_k8s_sync::{
    DomainNameSetController, GlobalNetworkSetController, IpSetController,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// The backing stores shared by all feeds.
#[derive(Clone)]
pub struct Stores {
    pub ip_sets: Arc<dyn SetStore<IpSet>>,
    pub domain_name_sets: Arc<dyn SetStore<DomainNameSet>>,
    pub events: Arc<dyn EventSink>,
    pub suspicious: Arc<dyn SuspiciousSet>,
}

/// The controllers converging feed contents into the stores and cluster.
#[derive(Clone)]
pub struct Reconcilers {
    pub ip_sets: IpSetController,
    pub domain_name_sets: DomainNameSetController,
    pub global_network_sets: GlobalNetworkSetController,
}

#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("feed watcher is not running")]
pub struct PingError;

#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn ThreatFeeds>,
    pull: PullClients,
    stores: Stores,
    reconcilers: Reconcilers,
    search_period: Duration,
    event_ttl: Duration,
    bundles: Mutex<HashMap<String, Bundle>>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

/// The actors serving one feed.
struct Bundle {
    feed: GlobalThreatFeed,
    cacher: FeedCacher,
    puller: Option<Puller>,
    searcher: Searcher,
}

enum Message {
    Event(watcher::Event<GlobalThreatFeed>),
    Ping(oneshot::Sender<()>),
}

/// Tracks the feeds listed since the watch last (re)started.
#[derive(Default)]
struct InitState {
    listing: Option<Vec<String>>,
    synced: bool,
}

/// Returns true if the change from `old` to `new` cannot be applied to a
/// running puller. An unset format is equivalent to newline-delimited.
pub fn feed_needs_restart(old: &GlobalThreatFeed, new: &GlobalThreatFeed) -> bool {
    match (old.http_pull(), new.http_pull()) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(o), Some(n)) => {
            puller::period(old) != puller::period(new)
                || effective_format(&o.format) != effective_format(&n.format)
        }
    }
}

fn effective_format(format: &ThreatFeedFormat) -> ThreatFeedFormat {
    if format.is_unset() {
        return ThreatFeedFormat {
            newline_delimited: Some(Default::default()),
            ..Default::default()
        };
    }
    format.clone()
}

fn syncs_global_network_set(feed: &GlobalThreatFeed) -> bool {
    feed.content() == ThreatFeedContent::IPSet && feed.global_network_set_labels().is_some()
}

// === impl Watcher ===

impl Watcher {
    pub fn new(
        client: Arc<dyn ThreatFeeds>,
        pull: PullClients,
        stores: Stores,
        reconcilers: Reconcilers,
        search_period: Duration,
        event_ttl: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            inner: Arc::new(Inner {
                client,
                pull,
                stores,
                reconcilers,
                search_period,
                event_ttl,
                bundles: Default::default(),
                tx,
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Applies feed events until `token` is cancelled. Only the first call
    /// has an effect.
    pub async fn run<S>(self, events: S, token: CancellationToken)
    where
        S: Stream<Item = watcher::Event<GlobalThreatFeed>> + Send + 'static,
    {
        let Some(mut rx) = self.inner.rx.lock().take() else {
            return;
        };

        let tx = self.inner.tx.clone();
        let forward = tokio::spawn(
            async move {
                tokio::pin!(events);
                while let Some(event) = events.next().await {
                    if tx.send(Message::Event(event)).await.is_err() {
                        return;
                    }
                }
            }
            .instrument(info_span!("feeds")),
        );

        let mut init = InitState::default();
        loop {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                Message::Event(event) => self.handle(event, &mut init, &token),
                Message::Ping(rsp) => {
                    let _ = rsp.send(());
                }
            }
        }

        forward.abort();
        debug!("Stopped");
    }

    /// Resolves once every event received before the call has been applied.
    pub async fn ping(&self) -> Result<(), PingError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Message::Ping(tx))
            .await
            .map_err(|_| PingError)?;
        rx.await.map_err(|_| PingError)
    }

    /// The names of the feeds being served.
    pub fn feeds(&self) -> Vec<String> {
        let mut names = self.inner.bundles.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn handle(
        &self,
        event: watcher::Event<GlobalThreatFeed>,
        init: &mut InitState,
        token: &CancellationToken,
    ) {
        match event {
            watcher::Event::Init => init.listing = Some(Vec::new()),
            watcher::Event::InitApply(feed) => {
                if let Some(listing) = init.listing.as_mut() {
                    listing.push(feed.name_unchecked());
                }
                self.apply(feed, token);
            }
            watcher::Event::InitDone => {
                let listed = init.listing.take().unwrap_or_default();
                let stale = self
                    .feeds()
                    .into_iter()
                    .filter(|name| !listed.contains(name))
                    .collect::<Vec<_>>();
                for name in stale {
                    info!(feed = %name, "Feed no longer exists");
                    self.stop_feed(&name);
                }
                if !init.synced {
                    init.synced = true;
                    info!(feeds = listed.len(), "Initial feeds synced");
                    self.inner.reconcilers.ip_sets.start_reconciliation();
                    self.inner.reconcilers.domain_name_sets.start_reconciliation();
                    self.inner.reconcilers.global_network_sets.start_reconciliation();
                }
            }
            watcher::Event::Apply(feed) => self.apply(feed, token),
            watcher::Event::Delete(feed) => {
                let name = feed.name_unchecked();
                if self.inner.bundles.lock().contains_key(&name) {
                    info!(feed = %name, "Feed deleted");
                    self.stop_feed(&name);
                }
            }
        }
    }

    fn apply(&self, feed: GlobalThreatFeed, token: &CancellationToken) {
        let name = feed.name_unchecked();
        if self.inner.bundles.lock().contains_key(&name) {
            self.update_feed(feed, token);
        } else {
            info!(feed = %name, "Starting feed");
            self.start_feed(feed, token);
        }
    }

    /// Starts the actors for a new feed.
    ///
    /// # Panics
    ///
    /// If the feed has already been started.
    fn start_feed(&self, feed: GlobalThreatFeed, token: &CancellationToken) {
        let name = feed.name_unchecked();
        let mut bundles = self.inner.bundles.lock();
        assert!(!bundles.contains_key(&name), "feed {name} already started");

        let cacher = FeedCacher::new(name.as_str(), self.inner.client.clone());
        cacher.run(token);

        let searcher = Searcher::new(
            name.as_str(),
            self.inner.search_period,
            self.inner.event_ttl,
            self.inner.stores.suspicious.clone(),
            self.inner.stores.events.clone(),
        );
        searcher.run(token, cacher.clone());

        let puller = self.start_puller(&feed, &cacher, token);
        bundles.insert(
            name,
            Bundle {
                feed,
                cacher,
                puller,
                searcher,
            },
        );
    }

    /// Applies a change to a running feed.
    ///
    /// # Panics
    ///
    /// If the feed has not been started.
    fn update_feed(&self, feed: GlobalThreatFeed, token: &CancellationToken) {
        let name = feed.name_unchecked();
        let old = match self.inner.bundles.lock().get(&name) {
            Some(bundle) => bundle.feed.clone(),
            None => panic!("feed {name} not started"),
        };

        if old.content() != feed.content() {
            info!(feed = %name, "Feed content changed");
            self.stop_feed(&name);
            self.start_feed(feed, token);
            return;
        }

        let gns = &self.inner.reconcilers.global_network_sets;
        let gns_name = global_network_set_name(&name);
        let was_syncing = syncs_global_network_set(&old);
        let syncing = syncs_global_network_set(&feed);

        if feed_needs_restart(&old, &feed) || (syncing && !was_syncing) {
            if syncing {
                gns.no_gc(gns_name.clone());
            }
            info!(feed = %name, "Restarting puller");
            self.restart_puller(&feed, token);
        } else if let Some(puller) = self.puller(&name) {
            puller.set_feed(feed.clone());
        }

        if was_syncing && !syncing {
            debug!(feed = %name, "GlobalNetworkSet sync disabled");
            gns.delete(&gns_name);
        }

        if let Some(bundle) = self.inner.bundles.lock().get_mut(&name) {
            bundle.feed = feed;
        }
    }

    /// Stops a feed's actors and withdraws its contents.
    ///
    /// # Panics
    ///
    /// If the feed has not been started.
    fn stop_feed(&self, name: &str) {
        let Some(bundle) = self.inner.bundles.lock().remove(name) else {
            panic!("feed {name} not started");
        };

        if let Some(puller) = &bundle.puller {
            puller.close();
        }
        let reconcilers = &self.inner.reconcilers;
        reconcilers
            .global_network_sets
            .delete(&global_network_set_name(name));
        reconcilers.ip_sets.delete(name);
        reconcilers.domain_name_sets.delete(name);
        bundle.searcher.close();
        bundle.cacher.close();
    }

    /// Replaces a feed's puller.
    ///
    /// # Panics
    ///
    /// If the feed has not been started.
    fn restart_puller(&self, feed: &GlobalThreatFeed, token: &CancellationToken) {
        let name = feed.name_unchecked();
        let mut bundles = self.inner.bundles.lock();
        let Some(bundle) = bundles.get_mut(&name) else {
            panic!("feed {name} not started");
        };
        if let Some(puller) = bundle.puller.take() {
            puller.close();
        }
        bundle.puller = self.start_puller(feed, &bundle.cacher, token);
    }

    /// Starts a puller if the feed is pulled over HTTP. Its stored contents
    /// are exempted from collection until the puller declares them.
    fn start_puller(
        &self,
        feed: &GlobalThreatFeed,
        cacher: &FeedCacher,
        token: &CancellationToken,
    ) -> Option<Puller> {
        feed.http_pull()?;
        let name = feed.name_unchecked();
        let reconcilers = &self.inner.reconcilers;
        let puller = match feed.content() {
            ThreatFeedContent::IPSet => {
                reconcilers.ip_sets.no_gc(name.as_str());
                if syncs_global_network_set(feed) {
                    reconcilers
                        .global_network_sets
                        .no_gc(global_network_set_name(&name));
                }
                Puller::ip_set(
                    feed,
                    self.inner.pull.clone(),
                    self.inner.stores.ip_sets.clone(),
                    reconcilers.ip_sets.clone(),
                    reconcilers.global_network_sets.clone(),
                )
            }
            ThreatFeedContent::DomainNameSet => {
                reconcilers.domain_name_sets.no_gc(name.as_str());
                Puller::domain_name_set(
                    feed,
                    self.inner.pull.clone(),
                    self.inner.stores.domain_name_sets.clone(),
                    reconcilers.domain_name_sets.clone(),
                )
            }
        };
        puller.run(token, cacher.clone());
        Some(puller)
    }

    fn puller(&self, name: &str) -> Option<Puller> {
        self.inner.bundles.lock().get(name)?.puller.clone()
    }
}
