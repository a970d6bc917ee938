//! In-memory implementations of the storage collaborators.

use crate::{
    EventSink, GlobalThreatFeed, Meta, SecurityEvent, SetQueryResult, SetStore, StoreError,
    SuspiciousSet,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

pub use threatfeed_controller_k8s_api::fake::*;

/// A set store recording every call.
pub struct FakeSetStore<V> {
    inner: Arc<Mutex<SetState<V>>>,
}

struct SetState<V> {
    sets: BTreeMap<String, Stored<V>>,
    seq_no: i64,
    puts: Vec<(String, V)>,
    deletes: Vec<String>,
    put_errors: VecDeque<StoreError>,
    delete_errors: VecDeque<StoreError>,
    get_errors: VecDeque<StoreError>,
    list_errors: VecDeque<StoreError>,
}

struct Stored<V> {
    value: V,
    seq_no: i64,
    modified: DateTime<Utc>,
}

/// Collects persisted events.
#[derive(Clone, Default)]
pub struct FakeEvents {
    inner: Arc<Mutex<EventsState>>,
}

#[derive(Default)]
struct EventsState {
    events: Vec<SecurityEvent>,
    errors: VecDeque<StoreError>,
}

/// Returns queued query results, or an empty result when none are queued.
#[derive(Clone, Default)]
pub struct FakeSuspicious {
    inner: Arc<Mutex<SuspiciousState>>,
}

#[derive(Default)]
struct SuspiciousState {
    results: VecDeque<Result<SetQueryResult, StoreError>>,
    queries: usize,
}

// === impl FakeSetStore ===

impl<V> Default for FakeSetStore<V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SetState {
                sets: BTreeMap::new(),
                seq_no: 0,
                puts: Vec::new(),
                deletes: Vec::new(),
                put_errors: VecDeque::new(),
                delete_errors: VecDeque::new(),
                get_errors: VecDeque::new(),
                list_errors: VecDeque::new(),
            })),
        }
    }
}

impl<V> Clone for FakeSetStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone> FakeSetStore<V> {
    /// Stores a set without recording a put.
    pub fn insert(&self, name: impl Into<String>, value: V, modified: DateTime<Utc>) {
        let mut state = self.inner.lock();
        state.seq_no += 1;
        let seq_no = state.seq_no;
        state.sets.insert(
            name.into(),
            Stored {
                value,
                seq_no,
                modified,
            },
        );
    }

    pub fn value(&self, name: &str) -> Option<V> {
        self.inner.lock().sets.get(name).map(|s| s.value.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().sets.keys().cloned().collect()
    }

    pub fn puts(&self) -> Vec<(String, V)> {
        self.inner.lock().puts.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.inner.lock().deletes.clone()
    }

    pub fn fail_next_put(&self, error: StoreError) {
        self.inner.lock().put_errors.push_back(error);
    }

    pub fn fail_next_delete(&self, error: StoreError) {
        self.inner.lock().delete_errors.push_back(error);
    }

    pub fn fail_next_get(&self, error: StoreError) {
        self.inner.lock().get_errors.push_back(error);
    }

    pub fn fail_next_list(&self, error: StoreError) {
        self.inner.lock().list_errors.push_back(error);
    }
}

#[async_trait::async_trait]
impl<V> SetStore<V> for FakeSetStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, name: &str, value: &V) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.puts.push((name.to_string(), value.clone()));
        if let Some(error) = state.put_errors.pop_front() {
            return Err(error);
        }
        state.seq_no += 1;
        let seq_no = state.seq_no;
        state.sets.insert(
            name.to_string(),
            Stored {
                value: value.clone(),
                seq_no,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Meta>, StoreError> {
        let mut state = self.inner.lock();
        if let Some(error) = state.list_errors.pop_front() {
            return Err(error);
        }
        Ok(state
            .sets
            .iter()
            .map(|(name, stored)| Meta {
                name: name.clone(),
                seq_no: Some(stored.seq_no),
                primary_term: Some(1),
            })
            .collect())
    }

    async fn delete(&self, meta: &Meta) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.deletes.push(meta.name.clone());
        if let Some(error) = state.delete_errors.pop_front() {
            return Err(error);
        }
        let current = state.sets.get(&meta.name).map(|s| s.seq_no);
        match current {
            None => Err(StoreError::NotFound(meta.name.clone())),
            Some(seq_no) if meta.seq_no.is_some_and(|s| s != seq_no) => Err(StoreError::other(
                format!("{}: version conflict", meta.name),
            )),
            Some(_) => {
                state.sets.remove(&meta.name);
                Ok(())
            }
        }
    }

    async fn get(&self, name: &str) -> Result<V, StoreError> {
        let mut state = self.inner.lock();
        if let Some(error) = state.get_errors.pop_front() {
            return Err(error);
        }
        state
            .sets
            .get(name)
            .map(|s| s.value.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn get_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().sets.get(name).map(|s| s.modified))
    }
}

// === impl FakeEvents ===

impl FakeEvents {
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.inner.lock().events.clone()
    }

    pub fn fail_next(&self, error: StoreError) {
        self.inner.lock().errors.push_back(error);
    }
}

#[async_trait::async_trait]
impl EventSink for FakeEvents {
    async fn put_with_id(&self, events: &[SecurityEvent]) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if let Some(error) = state.errors.pop_front() {
            return Err(error);
        }
        state.events.extend_from_slice(events);
        Ok(())
    }
}

// === impl FakeSuspicious ===

impl FakeSuspicious {
    pub fn push(&self, result: Result<SetQueryResult, StoreError>) {
        self.inner.lock().results.push_back(result);
    }

    pub fn queries(&self) -> usize {
        self.inner.lock().queries
    }
}

#[async_trait::async_trait]
impl SuspiciousSet for FakeSuspicious {
    async fn query_set(&self, _: &GlobalThreatFeed) -> Result<SetQueryResult, StoreError> {
        let mut state = self.inner.lock();
        state.queries += 1;
        state.results.pop_front().unwrap_or_else(|| {
            Ok(SetQueryResult {
                events: Vec::new(),
                last_search: Utc::now(),
                set_hash: String::new(),
            })
        })
    }
}
