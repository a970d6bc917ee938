//! In-memory implementations of the Kubernetes collaborators.

use crate::{
    ClientError, GlobalNetworkSet, GlobalNetworkSets, GlobalThreatFeed, KeyValues, ThreatFeeds,
};
use futures::prelude::*;
use kube::{runtime::watcher, ResourceExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Stores feeds by name and enforces resource-version preconditions.
#[derive(Clone, Default)]
pub struct FakeThreatFeeds {
    inner: Arc<Mutex<FeedsState>>,
}

#[derive(Default)]
struct FeedsState {
    feeds: HashMap<String, GlobalThreatFeed>,
    version: u64,
    gets: usize,
    updates: usize,
    status_updates: usize,
    get_errors: VecDeque<ClientError>,
    update_errors: VecDeque<ClientError>,
    status_errors: VecDeque<ClientError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GnsCall {
    Create(String),
    Update(String),
    Delete(String),
}

/// Stores `GlobalNetworkSet`s and publishes each mutation to its watches.
#[derive(Clone, Default)]
pub struct FakeGlobalNetworkSets {
    inner: Arc<Mutex<GnsState>>,
}

#[derive(Default)]
struct GnsState {
    sets: BTreeMap<String, GlobalNetworkSet>,
    version: u64,
    calls: Vec<GnsCall>,
    errors: VecDeque<(GnsOp, ClientError)>,
    watches: Vec<mpsc::UnboundedSender<watcher::Event<GlobalNetworkSet>>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GnsOp {
    Create,
    Update,
    Delete,
}

/// Serves ConfigMap or Secret data by name.
#[derive(Clone, Default)]
pub struct FakeKeyValues {
    inner: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
}

// === impl FakeThreatFeeds ===

impl FakeThreatFeeds {
    pub fn insert(&self, mut feed: GlobalThreatFeed) {
        let mut state = self.inner.lock();
        state.version += 1;
        feed.metadata.resource_version = Some(state.version.to_string());
        state.feeds.insert(feed.name_any(), feed);
    }

    /// Returns the stored copy of a feed.
    pub fn feed(&self, name: &str) -> Option<GlobalThreatFeed> {
        self.inner.lock().feeds.get(name).cloned()
    }

    /// Bumps a stored feed's resource version so cached copies become stale.
    pub fn touch(&self, name: &str, f: impl FnOnce(&mut GlobalThreatFeed)) {
        let mut state = self.inner.lock();
        state.version += 1;
        let version = state.version.to_string();
        if let Some(feed) = state.feeds.get_mut(name) {
            f(feed);
            feed.metadata.resource_version = Some(version);
        }
    }

    pub fn fail_next_get(&self, error: ClientError) {
        self.inner.lock().get_errors.push_back(error);
    }

    pub fn fail_next_update(&self, error: ClientError) {
        self.inner.lock().update_errors.push_back(error);
    }

    pub fn fail_next_update_status(&self, error: ClientError) {
        self.inner.lock().status_errors.push_back(error);
    }

    pub fn gets(&self) -> usize {
        self.inner.lock().gets
    }

    pub fn updates(&self) -> usize {
        self.inner.lock().updates
    }

    pub fn status_updates(&self) -> usize {
        self.inner.lock().status_updates
    }

    fn write(
        &self,
        feed: &GlobalThreatFeed,
        apply: impl FnOnce(&mut GlobalThreatFeed, &GlobalThreatFeed),
    ) -> Result<GlobalThreatFeed, ClientError> {
        let mut state = self.inner.lock();
        let name = feed.name_any();
        let current_version = match state.feeds.get(&name) {
            Some(current) => current.resource_version(),
            None => return Err(ClientError::NotFound(name)),
        };
        if feed.resource_version() != current_version {
            return Err(ClientError::Conflict(format!(
                "{name}: resource version {:?} is stale",
                feed.resource_version()
            )));
        }
        state.version += 1;
        let version = state.version.to_string();
        let stored = state
            .feeds
            .get_mut(&name)
            .ok_or_else(|| ClientError::NotFound(name.clone()))?;
        apply(stored, feed);
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

#[async_trait::async_trait]
impl ThreatFeeds for FakeThreatFeeds {
    async fn get(&self, name: &str) -> Result<GlobalThreatFeed, ClientError> {
        let mut state = self.inner.lock();
        state.gets += 1;
        if let Some(error) = state.get_errors.pop_front() {
            return Err(error);
        }
        state
            .feeds
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    async fn update(&self, feed: &GlobalThreatFeed) -> Result<GlobalThreatFeed, ClientError> {
        {
            let mut state = self.inner.lock();
            state.updates += 1;
            if let Some(error) = state.update_errors.pop_front() {
                return Err(error);
            }
        }
        self.write(feed, |stored, feed| {
            stored.metadata.labels = feed.metadata.labels.clone();
            stored.metadata.annotations = feed.metadata.annotations.clone();
            stored.spec = feed.spec.clone();
        })
    }

    async fn update_status(
        &self,
        feed: &GlobalThreatFeed,
    ) -> Result<GlobalThreatFeed, ClientError> {
        {
            let mut state = self.inner.lock();
            state.status_updates += 1;
            if let Some(error) = state.status_errors.pop_front() {
                return Err(error);
            }
        }
        self.write(feed, |stored, feed| stored.status = feed.status.clone())
    }
}

// === impl FakeGlobalNetworkSets ===

impl FakeGlobalNetworkSets {
    /// Returns a watch that starts with the current contents and then
    /// observes every mutation.
    pub fn watch(&self) -> impl Stream<Item = watcher::Event<GlobalNetworkSet>> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        let _ = tx.send(watcher::Event::Init);
        for gns in state.sets.values() {
            let _ = tx.send(watcher::Event::InitApply(gns.clone()));
        }
        let _ = tx.send(watcher::Event::InitDone);
        state.watches.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Stores a set without recording a call, as if created by a prior run.
    pub fn insert(&self, mut gns: GlobalNetworkSet) {
        let mut state = self.inner.lock();
        state.version += 1;
        gns.metadata.resource_version = Some(state.version.to_string());
        state.publish(watcher::Event::Apply(gns.clone()));
        state.sets.insert(gns.name_any(), gns);
    }

    /// Removes a set without recording a call, as if deleted by a user.
    pub fn delete_out_of_band(&self, name: &str) {
        let mut state = self.inner.lock();
        if let Some(gns) = state.sets.remove(name) {
            state.publish(watcher::Event::Delete(gns));
        }
    }

    pub fn get(&self, name: &str) -> Option<GlobalNetworkSet> {
        self.inner.lock().sets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().sets.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<GnsCall> {
        self.inner.lock().calls.clone()
    }

    /// Fails the next call of the given kind.
    pub fn fail_next(&self, op: GnsOp, error: ClientError) {
        self.inner.lock().errors.push_back((op, error));
    }

    fn take_error(state: &mut GnsState, op: GnsOp) -> Option<ClientError> {
        let idx = state.errors.iter().position(|(o, _)| *o == op)?;
        state.errors.remove(idx).map(|(_, e)| e)
    }
}

impl GnsState {
    fn publish(&mut self, event: watcher::Event<GlobalNetworkSet>) {
        self.watches.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait::async_trait]
impl GlobalNetworkSets for FakeGlobalNetworkSets {
    async fn create(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError> {
        let mut state = self.inner.lock();
        let name = gns.name_any();
        state.calls.push(GnsCall::Create(name.clone()));
        if let Some(error) = Self::take_error(&mut state, GnsOp::Create) {
            return Err(error);
        }
        if state.sets.contains_key(&name) {
            return Err(ClientError::Conflict(format!("{name} already exists")));
        }
        state.version += 1;
        let mut created = gns.clone();
        created.metadata.resource_version = Some(state.version.to_string());
        state.sets.insert(name, created.clone());
        state.publish(watcher::Event::Apply(created.clone()));
        Ok(created)
    }

    async fn update(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError> {
        let mut state = self.inner.lock();
        let name = gns.name_any();
        state.calls.push(GnsCall::Update(name.clone()));
        if let Some(error) = Self::take_error(&mut state, GnsOp::Update) {
            return Err(error);
        }
        if !state.sets.contains_key(&name) {
            return Err(ClientError::NotFound(name));
        }
        state.version += 1;
        let mut updated = gns.clone();
        updated.metadata.resource_version = Some(state.version.to_string());
        state.sets.insert(name, updated.clone());
        state.publish(watcher::Event::Apply(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        let mut state = self.inner.lock();
        state.calls.push(GnsCall::Delete(name.to_string()));
        if let Some(error) = Self::take_error(&mut state, GnsOp::Delete) {
            return Err(error);
        }
        match state.sets.remove(name) {
            Some(gns) => {
                state.publish(watcher::Event::Delete(gns));
                Ok(())
            }
            None => Err(ClientError::NotFound(name.to_string())),
        }
    }
}

// === impl FakeKeyValues ===

impl FakeKeyValues {
    pub fn insert(&self, name: impl Into<String>, data: BTreeMap<String, String>) {
        self.inner.lock().insert(name.into(), data);
    }
}

#[async_trait::async_trait]
impl KeyValues for FakeKeyValues {
    async fn get(&self, name: &str) -> Result<BTreeMap<String, String>, ClientError> {
        self.inner
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }
}
