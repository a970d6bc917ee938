//! An Elasticsearch-backed implementation of the set, event, and search
//! stores.
//!
//! Feed snapshots are kept as one document per feed in
//! `.tigera.ipset.<cluster>` and `.tigera.domainnameset.<cluster>`. Matches
//! against flow and DNS logs are written as security events into
//! `tigera_secure_ee_events.<cluster>`, keyed by their natural ids so that
//! re-reporting the same occurrence overwrites rather than duplicates it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, future::Future, sync::Arc};
use threatfeed_controller_core::{
    DomainNameSet, EventSink, IpSet, Meta, SecurityEvent, SetQueryResult, SetStore, StoreError,
    SuspiciousSet,
};
use threatfeed_controller_k8s_api::{
    threat_feed::{DOMAIN_NAME_SET_HASH_KEY, IP_SET_HASH_KEY},
    GlobalThreatFeed, ResourceExt, ThreatFeedContent,
};
use tracing::debug;

#[cfg(test)]
mod tests;

/// The largest number of terms placed in a single query.
pub const MAX_CLAUSE_COUNT: usize = 1024;

/// Page size for log searches.
pub const QUERY_SIZE: usize = 1000;

// How long a scroll context is kept open between pages.
const SCROLL_KEEP_ALIVE: &str = "1m";
const SCROLL_PATH: &str = "_search/scroll";

const SEVERITY: u32 = 100;
const SUSPICIOUS_FLOW: &str = "gtf_suspicious_flow";
const SUSPICIOUS_DNS_QUERY: &str = "gtf_suspicious_dns_query";

#[derive(Clone)]
pub struct Elastic {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    url: Url,
    username: Option<String>,
    password: Option<String>,
    indices: Indices,
}

/// Names of every index the store touches for a single cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Indices {
    pub ip_sets: String,
    pub domain_name_sets: String,
    pub events: String,
    pub flow_logs: String,
    pub dns_logs: String,
}

/// A set type stored as a document holding a single list field.
pub trait SetDocument: Send + Sync + Sized + 'static {
    const FIELD: &'static str;

    fn index(indices: &Indices) -> &str;

    fn entries(&self) -> &[String];

    fn from_entries(entries: Vec<String>) -> Self;
}

#[derive(Debug, thiserror::Error)]
#[error("{method} {path} failed with status {status}: {body}")]
struct RequestError {
    method: Method,
    path: String,
    status: StatusCode,
    body: String,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to index {failed} of {total} events")]
struct BulkError {
    failed: usize,
    total: usize,
}

/// Which side of a flow matched the feed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FlowKey {
    SourceIp,
    DestIp,
}

/// Which part of a DNS log matched the feed. Variants are searched in
/// declaration order so that a direct query for a listed name is reported
/// ahead of the same name appearing in an answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DomainKey {
    QName,
    RRSetName,
    RRSetData,
}

#[derive(Debug, Deserialize)]
struct ScrollResponse<T> {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Hits<T> {
    #[serde(default)]
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_seq_no", default)]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term", default)]
    primary_term: Option<i64>,
    #[serde(rename = "_source")]
    source: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct FlowLog {
    start_time: i64,
    end_time: i64,
    source_ip: Option<String>,
    source_name: String,
    source_namespace: String,
    source_port: Option<i64>,
    source_type: String,
    dest_ip: Option<String>,
    dest_name: String,
    dest_namespace: String,
    dest_port: Option<i64>,
    dest_type: String,
    proto: String,
    action: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct DnsLog {
    start_time: DateTime<Utc>,
    client_ip: Option<String>,
    client_name: String,
    client_name_aggr: String,
    client_namespace: String,
    qname: String,
    rrsets: Vec<RRSet>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RRSet {
    name: String,
    rdata: Vec<String>,
}

// === impl Elastic ===

impl Elastic {
    pub fn new(
        client: reqwest::Client,
        url: Url,
        username: Option<String>,
        password: Option<String>,
        cluster: &str,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                url,
                username,
                password,
                indices: Indices::for_cluster(cluster),
            }),
        }
    }

    pub fn indices(&self) -> &Indices {
        &self.inner.indices
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{path}", self.inner.url.as_str().trim_end_matches('/'));
        let req = self.inner.client.request(method, url);
        match &self.inner.username {
            Some(username) => req.basic_auth(username, self.inner.password.as_ref()),
            None => req,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        req: RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let rsp = req.send().await.map_err(StoreError::other)?;
        debug!(%method, %path, status = %rsp.status(), "Elasticsearch request");
        Ok(rsp)
    }

    async fn get_document(
        &self,
        index: &str,
        name: &str,
        source_includes: Option<&str>,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let path = format!("{index}/_doc/{name}");
        let mut req = self.request(Method::GET, &path);
        if let Some(fields) = source_includes {
            req = req.query(&[("_source_includes", fields)]);
        }
        let rsp = self.send(Method::GET, &path, req).await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let rsp = check(Method::GET, &path, rsp).await?;
        let doc = rsp.json::<GetResponse>().await.map_err(StoreError::other)?;
        if !doc.found {
            return Ok(None);
        }
        Ok(Some(doc.source.unwrap_or_default()))
    }

    /// Runs the search `body` against `index`, scrolling until every hit has
    /// been read. A missing index yields no hits.
    async fn search<T: DeserializeOwned>(
        &self,
        index: &str,
        body: Value,
    ) -> Result<Vec<Hit<T>>, StoreError> {
        let path = format!("{index}/_search");
        let req = self
            .request(Method::POST, &path)
            .query(&[("scroll", SCROLL_KEEP_ALIVE)])
            .json(&body);
        let rsp = self.send(Method::POST, &path, req).await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let rsp = check(Method::POST, &path, rsp).await?;
        let first = rsp
            .json::<ScrollResponse<T>>()
            .await
            .map_err(StoreError::other)?;

        let (hits, scroll_id) = drain_scroll(first, |id| self.scroll(id)).await?;
        if let Some(id) = scroll_id {
            self.clear_scroll(id).await;
        }
        debug!(%index, hits = hits.len(), "Search complete");
        Ok(hits)
    }

    async fn scroll<T: DeserializeOwned>(
        &self,
        scroll_id: String,
    ) -> Result<ScrollResponse<T>, StoreError> {
        let body = json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id });
        let req = self.request(Method::POST, SCROLL_PATH).json(&body);
        let rsp = self.send(Method::POST, SCROLL_PATH, req).await?;
        let rsp = check(Method::POST, SCROLL_PATH, rsp).await?;
        rsp.json().await.map_err(StoreError::other)
    }

    /// Releases a scroll context. Failures only delay its expiry.
    async fn clear_scroll(&self, scroll_id: String) {
        let body = json!({ "scroll_id": scroll_id });
        let req = self.request(Method::DELETE, SCROLL_PATH).json(&body);
        let result = match self.send(Method::DELETE, SCROLL_PATH, req).await {
            Ok(rsp) => check(Method::DELETE, SCROLL_PATH, rsp).await.map(drop),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            debug!(%error, "Failed to clear scroll");
        }
    }

    async fn query_ips(
        &self,
        feed: &str,
        ips: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let mut events = Vec::new();
        for chunk in ips.chunks(MAX_CLAUSE_COUNT) {
            for key in [FlowKey::SourceIp, FlowKey::DestIp] {
                let body = search_body(flow_query(key, chunk, since, until));
                let hits = self
                    .search::<FlowLog>(&self.inner.indices.flow_logs, body)
                    .await?;
                events.extend(hits.into_iter().filter_map(|hit| {
                    let log = hit.source?;
                    Some(flow_event(&hit.id, &log, key, feed, until))
                }));
            }
        }
        Ok(events)
    }

    async fn query_domains(
        &self,
        feed: &str,
        domains: &[String],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        let mut events = Vec::new();
        for key in [DomainKey::QName, DomainKey::RRSetName, DomainKey::RRSetData] {
            for chunk in domains.chunks(MAX_CLAUSE_COUNT) {
                let body = search_body(dns_query(key, chunk, since, until));
                let hits = self
                    .search::<DnsLog>(&self.inner.indices.dns_logs, body)
                    .await?;
                events.extend(hits.into_iter().filter_map(|hit| {
                    let log = hit.source?;
                    Some(dns_event(&hit.id, &log, key, chunk, feed, until))
                }));
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl<V: SetDocument> SetStore<V> for Elastic {
    async fn put(&self, name: &str, value: &V) -> Result<(), StoreError> {
        let path = format!("{}/_doc/{name}", V::index(&self.inner.indices));
        let body = set_document::<V>(value, Utc::now());
        let req = self.request(Method::PUT, &path).json(&body);
        let rsp = self.send(Method::PUT, &path, req).await?;
        check(Method::PUT, &path, rsp).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Meta>, StoreError> {
        let body = json!({
            "query": { "match_all": {} },
            "_source": false,
            "seq_no_primary_term": true,
            "size": QUERY_SIZE,
            "sort": ["_doc"],
        });
        let hits = self
            .search::<Value>(V::index(&self.inner.indices), body)
            .await?;
        Ok(metas(hits))
    }

    async fn delete(&self, meta: &Meta) -> Result<(), StoreError> {
        let path = format!("{}/_doc/{}", V::index(&self.inner.indices), meta.name);
        let mut req = self.request(Method::DELETE, &path);
        if let (Some(seq_no), Some(primary_term)) = (meta.seq_no, meta.primary_term) {
            req = req.query(&[("if_seq_no", seq_no), ("if_primary_term", primary_term)]);
        }
        let rsp = self.send(Method::DELETE, &path, req).await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(meta.name.clone()));
        }
        check(Method::DELETE, &path, rsp).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<V, StoreError> {
        let source = self
            .get_document(V::index(&self.inner.indices), name, None)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let entries = set_entries(source, V::FIELD).map_err(StoreError::other)?;
        Ok(V::from_entries(entries))
    }

    async fn get_modified(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let source = self
            .get_document(V::index(&self.inner.indices), name, Some("created_at"))
            .await?;
        match source.and_then(|mut s| s.remove("created_at")) {
            Some(created_at) => serde_json::from_value(created_at).map_err(StoreError::other),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EventSink for Elastic {
    async fn put_with_id(&self, events: &[SecurityEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let body = bulk_body(&self.inner.indices.events, events).map_err(StoreError::other)?;
        let req = self
            .request(Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let rsp = self.send(Method::POST, "_bulk", req).await?;
        let rsp = check(Method::POST, "_bulk", rsp).await?;
        let rsp = rsp.json::<BulkResponse>().await.map_err(StoreError::other)?;
        if rsp.errors {
            return Err(StoreError::other(BulkError {
                failed: failed_items(&rsp),
                total: events.len(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl SuspiciousSet for Elastic {
    async fn query_set(&self, feed: &GlobalThreatFeed) -> Result<SetQueryResult, StoreError> {
        let name = feed.name_any();
        let until = Utc::now();
        let (events, set_hash) = match feed.content() {
            ThreatFeedContent::IPSet => {
                let stored = stored_set(SetStore::<IpSet>::get(self, &name).await)?;
                let Some(IpSet(ips)) = stored else {
                    debug!(feed = %name, "No stored set to search");
                    return Ok(unsearched(until));
                };
                let set_hash = set_hash(&ips);
                let since = search_start(feed, IP_SET_HASH_KEY, &set_hash);
                (self.query_ips(&name, &ips, since, until).await?, set_hash)
            }
            ThreatFeedContent::DomainNameSet => {
                let stored = stored_set(SetStore::<DomainNameSet>::get(self, &name).await)?;
                let Some(DomainNameSet(domains)) = stored else {
                    debug!(feed = %name, "No stored set to search");
                    return Ok(unsearched(until));
                };
                let set_hash = set_hash(&domains);
                let since = search_start(feed, DOMAIN_NAME_SET_HASH_KEY, &set_hash);
                (self.query_domains(&name, &domains, since, until).await?, set_hash)
            }
        };
        Ok(SetQueryResult {
            events,
            last_search: until,
            set_hash,
        })
    }
}

// === impl Indices ===

impl Indices {
    pub fn for_cluster(cluster: &str) -> Self {
        Self {
            ip_sets: format!(".tigera.ipset.{cluster}"),
            domain_name_sets: format!(".tigera.domainnameset.{cluster}"),
            events: format!("tigera_secure_ee_events.{cluster}"),
            flow_logs: format!("tigera_secure_ee_flows.{cluster}.*"),
            dns_logs: format!("tigera_secure_ee_dns.{cluster}.*"),
        }
    }
}

// === impl SetDocument ===

impl SetDocument for IpSet {
    const FIELD: &'static str = "ips";

    fn index(indices: &Indices) -> &str {
        &indices.ip_sets
    }

    fn entries(&self) -> &[String] {
        &self.0
    }

    fn from_entries(entries: Vec<String>) -> Self {
        Self(entries)
    }
}

impl SetDocument for DomainNameSet {
    const FIELD: &'static str = "domains";

    fn index(indices: &Indices) -> &str {
        &indices.domain_name_sets
    }

    fn entries(&self) -> &[String] {
        &self.0
    }

    fn from_entries(entries: Vec<String>) -> Self {
        Self(entries)
    }
}

// === impl DomainKey ===

impl DomainKey {
    fn field(self) -> &'static str {
        match self {
            Self::QName => "qname",
            Self::RRSetName => "rrsets.name",
            Self::RRSetData => "rrsets.rdata",
        }
    }
}

// === impl FlowKey ===

impl FlowKey {
    fn field(self) -> &'static str {
        match self {
            Self::SourceIp => "source_ip",
            Self::DestIp => "dest_ip",
        }
    }
}

async fn check(
    method: Method,
    path: &str,
    rsp: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(StoreError::other(RequestError {
        method,
        path: path.to_string(),
        status,
        body,
    }))
}

/// Collects every hit of a scroll, starting from its first page and asking
/// `next` for the following ones until an empty page is returned. Returns
/// the hits along with the scroll id that should be cleared, if any.
async fn drain_scroll<T, F, Fut>(
    first: ScrollResponse<T>,
    mut next: F,
) -> Result<(Vec<Hit<T>>, Option<String>), StoreError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<ScrollResponse<T>, StoreError>>,
{
    let mut hits = Vec::new();
    let mut scroll_id = None;
    let mut page = first;
    loop {
        if page.scroll_id.is_some() {
            scroll_id = page.scroll_id;
        }
        if page.hits.hits.is_empty() {
            return Ok((hits, scroll_id));
        }
        hits.extend(page.hits.hits);
        let Some(id) = scroll_id.clone() else {
            return Ok((hits, None));
        };
        page = next(id).await?;
    }
}

fn search_body(query: Value) -> Value {
    json!({
        "query": query,
        "size": QUERY_SIZE,
        "sort": ["_doc"],
    })
}

/// A feed whose set has not been stored yet has nothing to search.
fn stored_set<V>(result: Result<V, StoreError>) -> Result<Option<V>, StoreError> {
    match result {
        Ok(set) => Ok(Some(set)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(error) => Err(error),
    }
}

/// An empty result that leaves the feed's set hash untouched.
fn unsearched(until: DateTime<Utc>) -> SetQueryResult {
    SetQueryResult {
        events: Vec::new(),
        last_search: until,
        set_hash: String::new(),
    }
}

fn set_document<V: SetDocument>(value: &V, created_at: DateTime<Utc>) -> Value {
    let mut doc = Map::new();
    doc.insert("created_at".to_string(), json!(created_at));
    doc.insert(V::FIELD.to_string(), json!(value.entries()));
    Value::Object(doc)
}

fn set_entries(
    mut source: Map<String, Value>,
    field: &str,
) -> Result<Vec<String>, serde_json::Error> {
    match source.remove(field) {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(entries) => serde_json::from_value(entries),
    }
}

fn metas(hits: Vec<Hit<Value>>) -> Vec<Meta> {
    hits.into_iter()
        .map(|hit| Meta {
            name: hit.id,
            seq_no: hit.seq_no,
            primary_term: hit.primary_term,
        })
        .collect()
}

fn bulk_body(index: &str, events: &[SecurityEvent]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for event in events {
        let action = json!({ "index": { "_index": index, "_id": event.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(event)?);
        body.push('\n');
    }
    Ok(body)
}

fn failed_items(rsp: &BulkResponse) -> usize {
    rsp.items
        .iter()
        .filter(|item| {
            item.values()
                .any(|result| result.get("error").is_some_and(|e| !e.is_null()))
        })
        .count()
}

/// Hex-encoded SHA-256 over the set's entries, in order.
fn set_hash(entries: &[String]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Logs are searched from the last successful search, unless the set has
/// changed since then, in which case all stored logs are searched.
fn search_start(feed: &GlobalThreatFeed, key: &str, set_hash: &str) -> DateTime<Utc> {
    let unchanged = feed
        .annotations()
        .get(key)
        .is_some_and(|hash| hash == set_hash);
    match feed.status.as_ref().and_then(|s| s.last_successful_search) {
        Some(last) if unchanged => last,
        _ => DateTime::<Utc>::UNIX_EPOCH,
    }
}

fn flow_query(key: FlowKey, ips: &[String], since: DateTime<Utc>, until: DateTime<Utc>) -> Value {
    let mut terms = Map::new();
    terms.insert(key.field().to_string(), json!(ips));
    json!({
        "bool": {
            "filter": [
                { "range": { "end_time": { "gte": since.timestamp(), "lte": until.timestamp() } } },
                { "terms": terms },
            ]
        }
    })
}

fn dns_query(
    key: DomainKey,
    domains: &[String],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Value {
    let window = json!({ "gte": since.to_rfc3339(), "lte": until.to_rfc3339() });
    let mut terms = Map::new();
    terms.insert(key.field().to_string(), json!(domains));
    let matches = match key {
        DomainKey::QName => json!({ "terms": terms }),
        DomainKey::RRSetName | DomainKey::RRSetData => json!({
            "nested": { "path": "rrsets", "query": { "terms": terms } }
        }),
    };
    json!({
        "bool": {
            "filter": [
                { "range": { "end_time": window } },
                matches,
            ]
        }
    })
}

fn flow_event(
    log_id: &str,
    log: &FlowLog,
    key: FlowKey,
    feed: &str,
    now: DateTime<Utc>,
) -> SecurityEvent {
    let source_ip = log.source_ip.clone().unwrap_or_default();
    let dest_ip = log.dest_ip.clone().unwrap_or_default();
    let id = format!(
        "{feed}_{}_{}_{source_ip}_{}_{dest_ip}_{}",
        log.start_time,
        log.proto,
        port(log.source_port),
        port(log.dest_port),
    );
    let description = match key {
        FlowKey::SourceIp => format!(
            "suspicious IP {source_ip}, listed in Global Threat Feed {feed}, connected to {}/{}",
            log.dest_namespace, log.dest_name,
        ),
        FlowKey::DestIp => format!(
            "pod {}/{} connected to suspicious IP {dest_ip} which is listed in Global Threat Feed {feed}",
            log.source_namespace, log.source_name,
        ),
    };
    SecurityEvent {
        id,
        type_: SUSPICIOUS_FLOW.to_string(),
        time: now.timestamp(),
        description,
        severity: SEVERITY,
        origin: "Suspicious Flow".to_string(),
        source_ip: log.source_ip.clone(),
        source_port: log.source_port,
        dest_ip: log.dest_ip.clone(),
        dest_port: log.dest_port,
        dest_name: Some(log.dest_name.clone()).filter(|n| !n.is_empty()),
        feeds: vec![feed.to_string()],
        record: Some(json!({
            "flow_action": log.action,
            "flow_log_id": log_id,
            "protocol": log.proto,
            "feeds": [feed],
            "source_namespace": log.source_namespace,
            "source_name": log.source_name,
            "source_type": log.source_type,
            "dest_namespace": log.dest_namespace,
            "dest_type": log.dest_type,
            "end_time": log.end_time,
        })),
    }
}

fn dns_event(
    log_id: &str,
    log: &DnsLog,
    key: DomainKey,
    domains: &[String],
    feed: &str,
    now: DateTime<Utc>,
) -> SecurityEvent {
    let client_ip = log.client_ip.clone().unwrap_or_default();
    let suspicious = suspicious_domains(log, key, domains);
    let listed = suspicious.join(", ");
    let description = match key {
        DomainKey::QName => format!(
            "{}/{} queried the domain name {listed} from global threat feed(s) {feed}",
            log.client_namespace, log.client_name,
        ),
        DomainKey::RRSetName => format!(
            "A request originating from {}/{} queried the domain name {listed}, \
             which is listed in the threat feed {feed}",
            log.client_namespace, log.client_name_aggr,
        ),
        DomainKey::RRSetData => format!(
            "{}/{} got DNS query results including suspicious domain(s) {listed} \
             from global threat feed(s) {feed}",
            log.client_namespace, log.client_name_aggr,
        ),
    };
    let matched = if suspicious.is_empty() {
        "unknown".to_string()
    } else {
        suspicious.join("~")
    };
    SecurityEvent {
        id: format!(
            "{feed}_{}_{client_ip}_{matched}",
            log.start_time.timestamp(),
        ),
        type_: SUSPICIOUS_DNS_QUERY.to_string(),
        time: now.timestamp(),
        description,
        severity: SEVERITY,
        origin: "Suspicious DNS Query".to_string(),
        source_ip: log.client_ip.clone(),
        feeds: vec![feed.to_string()],
        record: Some(json!({
            "dns_log_id": log_id,
            "feeds": [feed],
            "suspicious_domains": suspicious,
        })),
        ..SecurityEvent::default()
    }
}

/// The listed names found in the part of `log` that `key` matched, sorted.
fn suspicious_domains(log: &DnsLog, key: DomainKey, domains: &[String]) -> Vec<String> {
    let listed = domains.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let found = match key {
        DomainKey::QName => vec![log.qname.as_str()],
        DomainKey::RRSetName => log.rrsets.iter().map(|rr| rr.name.as_str()).collect(),
        DomainKey::RRSetData => log
            .rrsets
            .iter()
            .flat_map(|rr| rr.rdata.iter().map(String::as_str))
            .collect(),
    };
    found
        .into_iter()
        .filter(|name| listed.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn port(port: Option<i64>) -> String {
    port.map(|p| p.to_string()).unwrap_or_default()
}
