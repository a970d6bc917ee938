//! Mirrors locally declared `GlobalNetworkSet`s into the cluster.
//!
//! Desired objects are declared with [`GlobalNetworkSetController::add`] and
//! compared against the labelled objects observed through a watch. Each
//! object name is reconciled independently through a rate-limited work
//! queue: a missing object is created, a differing one is updated, and an
//! undeclared one is deleted unless it has been exempted with
//! [`GlobalNetworkSetController::no_gc`].

use crate::{queue::WorkQueue, FailFn};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use threatfeed_controller_core::{status, ErrorType, FeedCacher};
use threatfeed_controller_k8s_api::{
    watcher, ClientError, GlobalNetworkSet, GlobalNetworkSets, ResourceExt,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The number of times a key is processed before it is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct GlobalNetworkSetController {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn GlobalNetworkSets>,
    local: Mutex<HashMap<String, GlobalNetworkSet>>,
    remote: Mutex<HashMap<String, GlobalNetworkSet>>,
    no_gc: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<String, (FailFn, FeedCacher)>>,
    queue: WorkQueue<String>,
    started: watch::Sender<bool>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// The result of reconciling one key.
#[derive(Debug)]
enum Outcome {
    Ok,
    /// The API call failed and may succeed on a later attempt.
    Retryable { op: Op, error: ClientError },
    /// The API call failed in a way that retrying cannot fix.
    Fatal { op: Op, error: ClientError },
}

// === impl GlobalNetworkSetController ===

impl GlobalNetworkSetController {
    pub fn new(client: Arc<dyn GlobalNetworkSets>) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client,
                local: Default::default(),
                remote: Default::default(),
                no_gc: Default::default(),
                failures: Default::default(),
                queue: WorkQueue::default(),
                started,
            }),
        }
    }

    /// Declares the desired object. `fail` is invoked, and an error
    /// condition recorded on the feed, if it cannot be created or updated.
    pub fn add(&self, gns: GlobalNetworkSet, fail: FailFn, cacher: FeedCacher) {
        let name = gns.name_any();
        self.inner.local.lock().insert(name.clone(), gns);
        self.inner
            .failures
            .lock()
            .insert(name.clone(), (fail, cacher));
        debug!(%name, "Added desired GlobalNetworkSet");
        self.inner.queue.add(name);
    }

    /// Removes the desired object and its GC exemption so that the object is
    /// deleted.
    pub fn delete(&self, name: &str) {
        self.inner.local.lock().remove(name);
        self.inner.no_gc.lock().remove(name);
        self.inner.failures.lock().remove(name);
        debug!(%name, "Deleted desired GlobalNetworkSet");
        self.inner.queue.add(name.to_string());
    }

    /// Exempts the named object from garbage collection.
    pub fn no_gc(&self, name: impl Into<String>) {
        self.inner.no_gc.lock().insert(name.into());
    }

    /// Allows the worker to begin processing keys.
    pub fn start_reconciliation(&self) {
        self.inner.started.send_replace(true);
    }

    /// Returns a copy of the desired objects by name.
    pub fn local(&self) -> HashMap<String, GlobalNetworkSet> {
        self.inner.local.lock().clone()
    }

    pub fn not_gcable(&self) -> HashSet<String> {
        self.inner.no_gc.lock().clone()
    }

    /// Tracks the cluster's objects from `events` and, once reconciliation
    /// has started, processes queued keys until the token is cancelled.
    pub async fn run<S>(self, events: S, token: CancellationToken)
    where
        S: Stream<Item = watcher::Event<GlobalNetworkSet>> + Send + 'static,
    {
        let informer = tokio::spawn({
            let this = self.clone();
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = this.observe(events) => {}
                    _ = token.cancelled() => {}
                }
            }
        });

        let mut started = self.inner.started.subscribe();
        let ready = tokio::select! {
            res = started.wait_for(|s| *s) => res.is_ok(),
            _ = token.cancelled() => false,
        };
        if ready {
            info!("Starting reconciliation");
            tokio::select! {
                _ = self.work() => {}
                _ = token.cancelled() => {}
            }
        }

        self.inner.queue.shutdown();
        let _ = informer.await;
        debug!("Stopped");
    }

    async fn observe<S>(&self, events: S)
    where
        S: Stream<Item = watcher::Event<GlobalNetworkSet>>,
    {
        tokio::pin!(events);
        let mut init = HashSet::new();
        while let Some(event) = events.next().await {
            match event {
                watcher::Event::Init => init.clear(),
                watcher::Event::InitApply(gns) => {
                    init.insert(gns.name_any());
                    self.apply_remote(gns);
                }
                watcher::Event::InitDone => {
                    let stale = self
                        .inner
                        .remote
                        .lock()
                        .keys()
                        .filter(|name| !init.contains(*name))
                        .cloned()
                        .collect::<Vec<_>>();
                    for name in stale {
                        self.inner.remote.lock().remove(&name);
                        self.inner.queue.add(name);
                    }
                    init.clear();
                }
                watcher::Event::Apply(gns) => self.apply_remote(gns),
                watcher::Event::Delete(gns) => {
                    let name = gns.name_any();
                    self.inner.remote.lock().remove(&name);
                    self.inner.queue.add(name);
                }
            }
        }
    }

    fn apply_remote(&self, gns: GlobalNetworkSet) {
        let name = gns.name_any();
        self.inner.remote.lock().insert(name.clone(), gns);
        self.inner.queue.add(name);
    }

    async fn work(&self) {
        while let Some(key) = self.inner.queue.get().await {
            self.process(&key).await;
            self.inner.queue.done(&key);
        }
    }

    async fn process(&self, key: &str) {
        let key = key.to_string();
        let (op, error, fatal) = match self.reconcile(&key).await {
            Outcome::Ok => {
                self.inner.queue.forget(&key);
                let cacher = self.cacher(&key);
                if let Some(cacher) = cacher {
                    status::clear_error_condition(&cacher, ErrorType::GlobalNetworkSetSyncFailed)
                        .await;
                }
                return;
            }
            Outcome::Retryable { op, error } => (op, error, false),
            Outcome::Fatal { op, error } => (op, error, true),
        };

        let attempts = self.inner.queue.num_requeues(&key) + 1;
        if !fatal && attempts < MAX_ATTEMPTS {
            warn!(name = %key, ?op, %error, attempts, "Retrying GlobalNetworkSet");
            self.inner.queue.add_rate_limited(key);
            return;
        }

        error!(name = %key, ?op, %error, attempts, "Dropping GlobalNetworkSet");
        self.inner.queue.forget(&key);
        if op == Op::Delete {
            return;
        }
        let failure = self.inner.failures.lock().get(&key).cloned();
        if let Some((fail, cacher)) = failure {
            fail();
            status::add_error_condition(&cacher, ErrorType::GlobalNetworkSetSyncFailed, &error)
                .await;
        }
    }

    fn cacher(&self, key: &str) -> Option<FeedCacher> {
        self.inner
            .failures
            .lock()
            .get(key)
            .map(|(_, cacher)| cacher.clone())
    }

    async fn reconcile(&self, key: &str) -> Outcome {
        let local = self.inner.local.lock().get(key).cloned();
        let remote = self.inner.remote.lock().get(key).cloned();

        match (local, remote) {
            (Some(local), Some(remote)) if local.same_labels_and_spec(&remote) => Outcome::Ok,

            (Some(local), Some(mut remote)) => {
                remote.metadata.labels = local.metadata.labels;
                remote.spec = local.spec;
                match self.inner.client.update(&remote).await {
                    Ok(updated) => {
                        info!(name = %key, "Updated GlobalNetworkSet");
                        self.inner.remote.lock().insert(key.to_string(), updated);
                        Outcome::Ok
                    }
                    Err(error) => Outcome::failed(Op::Update, error),
                }
            }

            (Some(local), None) => {
                let mut gns = local;
                gns.metadata.resource_version = None;
                match self.inner.client.create(&gns).await {
                    Ok(created) => {
                        info!(name = %key, "Created GlobalNetworkSet");
                        self.inner.remote.lock().insert(key.to_string(), created);
                        Outcome::Ok
                    }
                    Err(error) => Outcome::failed(Op::Create, error),
                }
            }

            (None, Some(_)) if self.inner.no_gc.lock().contains(key) => Outcome::Ok,

            (None, Some(_)) => match self.inner.client.delete(key).await {
                Ok(()) => {
                    info!(name = %key, "Deleted GlobalNetworkSet");
                    self.inner.remote.lock().remove(key);
                    Outcome::Ok
                }
                Err(error) if error.is_not_found() => {
                    self.inner.remote.lock().remove(key);
                    Outcome::Ok
                }
                Err(error) => Outcome::failed(Op::Delete, error),
            },

            (None, None) => Outcome::Ok,
        }
    }
}

impl fmt::Debug for GlobalNetworkSetController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalNetworkSetController")
            .field("local", &self.inner.local.lock().len())
            .field("remote", &self.inner.remote.lock().len())
            .finish()
    }
}

// === impl Outcome ===

impl Outcome {
    fn failed(op: Op, error: ClientError) -> Self {
        match error {
            ClientError::Invalid(_) => Self::Fatal { op, error },
            error => Self::Retryable { op, error },
        }
    }
}
