use crate::GlobalThreatFeed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a stored set together with its optimistic-concurrency token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Meta {
    pub name: String,
    pub seq_no: Option<i64>,
    pub primary_term: Option<i64>,
}

/// The normalized contents of an IP-set feed: CIDR strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IpSet(pub Vec<String>);

/// The normalized contents of a domain-name-set feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DomainNameSet(pub Vec<String>);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Persists named sets of type `V`.
#[async_trait::async_trait]
pub trait SetStore<V>: Send + Sync + 'static {
    async fn put(&self, name: &str, value: &V) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Meta>, StoreError>;

    /// Deletes a set if its concurrency token still matches.
    async fn delete(&self, meta: &Meta) -> Result<(), StoreError>;

    async fn get(&self, name: &str) -> Result<V, StoreError>;

    /// Returns when the named set was last written, if it exists.
    async fn get_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// A security event raised for traffic matching a feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecurityEvent {
    /// Natural identity of the event; equal ids denote the same occurrence.
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub time: i64,
    pub description: String,
    pub severity: u32,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feeds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
}

/// Persists security events, keyed by their ids.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn put_with_id(&self, events: &[SecurityEvent]) -> Result<(), StoreError>;
}

/// The result of searching stored logs for a feed's contents.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetQueryResult {
    pub events: Vec<SecurityEvent>,
    /// The time up to which logs were searched.
    pub last_search: DateTime<Utc>,
    /// Hash of the set contents that were searched.
    pub set_hash: String,
}

/// Searches stored traffic logs for entries matching a feed's set.
#[async_trait::async_trait]
pub trait SuspiciousSet: Send + Sync + 'static {
    async fn query_set(&self, feed: &GlobalThreatFeed) -> Result<SetQueryResult, StoreError>;
}

// === impl StoreError ===

impl StoreError {
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::Other(error.into())
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// === impl IpSet ===

impl From<Vec<String>> for IpSet {
    fn from(nets: Vec<String>) -> Self {
        Self(nets)
    }
}

// === impl DomainNameSet ===

impl From<Vec<String>> for DomainNameSet {
    fn from(domains: Vec<String>) -> Self {
        Self(domains)
    }
}
