use crate::FailFn;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use threatfeed_controller_core::{
    runloop::{self, Rescheduler, RunLoop},
    status, DomainNameSet, ErrorType, FeedCacher, IpSet, Meta, SetStore,
};
use tokio::{sync::watch, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Converges a backing store of named sets to the desired state declared by
/// feeds.
pub struct SetController<V> {
    inner: Arc<Inner<V>>,
}

pub type IpSetController = SetController<IpSet>;
pub type DomainNameSetController = SetController<DomainNameSet>;

struct Inner<V> {
    store: Arc<dyn SetStore<V>>,
    state: Mutex<State<V>>,
    run_loop: Mutex<Option<RunLoop>>,
    rescheduler: Rescheduler,
    started: watch::Sender<bool>,
}

struct State<V> {
    desired: HashMap<String, Desired<V>>,
    no_gc: HashSet<String>,
    generation: u64,
}

struct Desired<V> {
    value: V,
    fail: FailFn,
    cacher: FeedCacher,
    dirty: bool,
    generation: u64,
}

struct Put<V> {
    name: String,
    value: V,
    generation: u64,
    fail: FailFn,
    cacher: FeedCacher,
}

// === impl SetController ===

impl<V> Clone for SetController<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> fmt::Debug for SetController<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SetController")
            .field("desired", &state.desired.len())
            .field("no_gc", &state.no_gc.len())
            .finish()
    }
}

impl<V> SetController<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn SetStore<V>>, period: Duration) -> Self {
        // Changes to desired state are reconciled right away.
        let (run_loop, rescheduler) = runloop::with_reschedule(period, Duration::ZERO);
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(State {
                    desired: HashMap::new(),
                    no_gc: HashSet::new(),
                    generation: 0,
                }),
                run_loop: Mutex::new(Some(run_loop)),
                rescheduler,
                started,
            }),
        }
    }

    /// Declares the desired contents of `name`. `fail` is invoked whenever
    /// writing the set fails.
    pub fn add(&self, name: impl Into<String>, value: V, fail: FailFn, cacher: FeedCacher) {
        let name = name.into();
        {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            let generation = state.generation;
            match state.desired.get_mut(&name) {
                Some(entry) => {
                    if entry.value != value {
                        entry.value = value;
                        entry.dirty = true;
                        entry.generation = generation;
                    }
                    entry.fail = fail;
                    entry.cacher = cacher;
                }
                None => {
                    state.desired.insert(
                        name.clone(),
                        Desired {
                            value,
                            fail,
                            cacher,
                            dirty: true,
                            generation,
                        },
                    );
                }
            }
        }
        debug!(%name, "Added desired set");
        self.trigger();
    }

    /// Removes `name` from the desired state and from GC exemption so that
    /// it is garbage collected.
    pub fn delete(&self, name: &str) {
        {
            let mut state = self.inner.state.lock();
            state.desired.remove(name);
            state.no_gc.remove(name);
        }
        debug!(%name, "Deleted desired set");
        self.trigger();
    }

    /// Exempts `name` from garbage collection without declaring contents.
    pub fn no_gc(&self, name: impl Into<String>) {
        self.inner.state.lock().no_gc.insert(name.into());
    }

    /// Allows the worker to begin reconciling. Must be called once the
    /// desired state of all known feeds has been declared.
    pub fn start_reconciliation(&self) {
        self.inner.started.send_replace(true);
    }

    /// Returns a copy of the desired contents by name.
    pub fn desired(&self) -> HashMap<String, V> {
        self.inner
            .state
            .lock()
            .desired
            .iter()
            .map(|(k, d)| (k.clone(), d.value.clone()))
            .collect()
    }

    pub fn not_gcable(&self) -> HashSet<String> {
        self.inner.state.lock().no_gc.clone()
    }

    /// Reconciles once per period, and whenever desired state changes, until
    /// the token is cancelled. Only the first call has any effect.
    pub async fn run(self, token: CancellationToken) {
        let Some(mut run_loop) = self.inner.run_loop.lock().take() else {
            return;
        };

        let mut started = self.inner.started.subscribe();
        tokio::select! {
            res = started.wait_for(|s| *s) => {
                if res.is_err() {
                    return;
                }
            }
            _ = token.cancelled() => return,
        }
        info!(period = ?run_loop.period(), "Starting reconciliation");

        while run_loop.tick(&token).await.is_ok() {
            self.reconcile().await;
        }
        debug!("Stopped");
    }

    fn trigger(&self) {
        // Ignored until the worker has started; its first pass picks up the
        // change.
        let _ = self.inner.rescheduler.reschedule();
    }

    async fn reconcile(&self) {
        let stored = match self.inner.store.list().await {
            Ok(metas) => metas,
            Err(error) => {
                error!(%error, "Failed to list stored sets");
                return;
            }
        };
        let stored_names = stored
            .iter()
            .map(|m| m.name.as_str())
            .collect::<HashSet<_>>();

        let (puts, deletes) = {
            let state = self.inner.state.lock();
            let puts = state
                .desired
                .iter()
                .filter(|(name, d)| d.dirty || !stored_names.contains(name.as_str()))
                .map(|(name, d)| Put {
                    name: name.clone(),
                    value: d.value.clone(),
                    generation: d.generation,
                    fail: d.fail.clone(),
                    cacher: d.cacher.clone(),
                })
                .collect::<Vec<_>>();
            let deletes = stored
                .iter()
                .filter(|m| !state.desired.contains_key(&m.name) && !state.no_gc.contains(&m.name))
                .cloned()
                .collect::<Vec<Meta>>();
            (puts, deletes)
        };

        for put in puts {
            self.put(put).await;
        }
        for meta in deletes {
            self.gc(meta).await;
        }
    }

    async fn put(&self, put: Put<V>) {
        match self.inner.store.put(&put.name, &put.value).await {
            Ok(()) => {
                debug!(name = %put.name, "Stored set");
                if let Some(entry) = self.inner.state.lock().desired.get_mut(&put.name) {
                    if entry.generation == put.generation {
                        entry.dirty = false;
                    }
                }
                status::clear_error_condition(&put.cacher, ErrorType::LinseedSyncFailed).await;
            }
            Err(error) => {
                error!(name = %put.name, %error, "Failed to store set");
                (put.fail)();
                status::add_error_condition(&put.cacher, ErrorType::LinseedSyncFailed, &error)
                    .await;
            }
        }
    }

    async fn gc(&self, meta: Meta) {
        match self.inner.store.delete(&meta).await {
            Ok(()) => info!(name = %meta.name, "Garbage collected set"),
            Err(error) if error.is_not_found() => {
                debug!(name = %meta.name, "Set already deleted")
            }
            Err(error) => error!(name = %meta.name, %error, "Failed to delete set"),
        }
    }
}
