use super::*;
use chrono::TimeZone;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use threatfeed_controller_k8s_api::{GlobalThreatFeedSpec, GlobalThreatFeedStatus};

fn mk_flow() -> FlowLog {
    FlowLog {
        start_time: 123,
        end_time: 456,
        source_ip: Some("1.2.3.4".to_string()),
        source_name: "source-foo".to_string(),
        source_namespace: "mock".to_string(),
        source_port: Some(443),
        source_type: "wep".to_string(),
        dest_ip: Some("2.3.4.5".to_string()),
        dest_name: "dest-foo".to_string(),
        dest_namespace: "internet".to_string(),
        dest_port: Some(80),
        dest_type: "net".to_string(),
        proto: "tcp".to_string(),
        action: "allow".to_string(),
    }
}

fn mk_feed(
    annotations: Option<(&str, &str)>,
    last_search: Option<DateTime<Utc>>,
) -> GlobalThreatFeed {
    let mut feed = GlobalThreatFeed::new("testfeed", GlobalThreatFeedSpec::default());
    if let Some((k, v)) = annotations {
        feed.metadata.annotations = Some(btreemap! { k.to_string() => v.to_string() });
    }
    feed.status = Some(GlobalThreatFeedStatus {
        last_successful_search: last_search,
        ..Default::default()
    });
    feed
}

fn mk_dns() -> DnsLog {
    DnsLog {
        start_time: Utc.timestamp_opt(1, 0).unwrap(),
        client_ip: Some("20.21.22.23".to_string()),
        client_name: "-".to_string(),
        client_name_aggr: "client-8888-*".to_string(),
        client_namespace: "default".to_string(),
        qname: "www.badguys.co.uk".to_string(),
        rrsets: vec![
            RRSet {
                name: "www.badguys.co.uk".to_string(),
                rdata: vec!["www1.badguys-backend.co.uk".to_string()],
            },
            RRSet {
                name: "www1.badguys-backend.co.uk".to_string(),
                rdata: vec!["uef0.malh0st.io".to_string()],
            },
        ],
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn mk_page(scroll_id: Option<&str>, ids: &[&str]) -> ScrollResponse<Value> {
    ScrollResponse {
        scroll_id: scroll_id.map(str::to_string),
        hits: Hits {
            hits: ids
                .iter()
                .map(|id| Hit {
                    id: id.to_string(),
                    seq_no: None,
                    primary_term: None,
                    source: None,
                })
                .collect(),
        },
    }
}

fn hit_ids(hits: &[Hit<Value>]) -> Vec<String> {
    hits.iter().map(|hit| hit.id.clone()).collect()
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

#[test]
fn indices_are_suffixed_with_the_cluster() {
    assert_eq!(
        Indices::for_cluster("east"),
        Indices {
            ip_sets: ".tigera.ipset.east".to_string(),
            domain_name_sets: ".tigera.domainnameset.east".to_string(),
            events: "tigera_secure_ee_events.east".to_string(),
            flow_logs: "tigera_secure_ee_flows.east.*".to_string(),
            dns_logs: "tigera_secure_ee_dns.east.*".to_string(),
        }
    );
}

#[test]
fn set_hash_tracks_contents_and_order() {
    let a = set_hash(&["1.2.3.4/32".to_string(), "5.6.7.8/32".to_string()]);
    let b = set_hash(&["1.2.3.4/32".to_string(), "5.6.7.8/32".to_string()]);
    let c = set_hash(&["5.6.7.8/32".to_string(), "1.2.3.4/32".to_string()]);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

    // Entries are delimited, so concatenations do not collide.
    assert_ne!(
        set_hash(&["ab".to_string(), "c".to_string()]),
        set_hash(&["a".to_string(), "bc".to_string()]),
    );
}

#[test]
fn search_resumes_only_when_the_set_is_unchanged() {
    let hash = set_hash(&["1.2.3.4/32".to_string()]);
    let last = now();

    let feed = mk_feed(Some((IP_SET_HASH_KEY, &hash)), Some(last));
    assert_eq!(search_start(&feed, IP_SET_HASH_KEY, &hash), last);

    let feed = mk_feed(Some((IP_SET_HASH_KEY, "stale")), Some(last));
    assert_eq!(
        search_start(&feed, IP_SET_HASH_KEY, &hash),
        DateTime::<Utc>::UNIX_EPOCH
    );

    // The hash is read from the annotation matching the content type.
    let feed = mk_feed(Some((IP_SET_HASH_KEY, &hash)), Some(last));
    assert_eq!(
        search_start(&feed, DOMAIN_NAME_SET_HASH_KEY, &hash),
        DateTime::<Utc>::UNIX_EPOCH
    );

    let feed = mk_feed(Some((IP_SET_HASH_KEY, &hash)), None);
    assert_eq!(
        search_start(&feed, IP_SET_HASH_KEY, &hash),
        DateTime::<Utc>::UNIX_EPOCH
    );
}

#[test]
fn flow_event_for_suspicious_source() {
    let event = flow_event("111-222-333", &mk_flow(), FlowKey::SourceIp, "testfeed", now());
    assert_eq!(event.id, "testfeed_123_tcp_1.2.3.4_443_2.3.4.5_80");
    assert_eq!(event.type_, "gtf_suspicious_flow");
    assert_eq!(event.origin, "Suspicious Flow");
    assert_eq!(event.severity, 100);
    assert_eq!(event.time, now().timestamp());
    assert_eq!(
        event.description,
        "suspicious IP 1.2.3.4, listed in Global Threat Feed testfeed, connected to internet/dest-foo"
    );
    assert_eq!(event.source_ip.as_deref(), Some("1.2.3.4"));
    assert_eq!(event.source_port, Some(443));
    assert_eq!(event.dest_ip.as_deref(), Some("2.3.4.5"));
    assert_eq!(event.dest_port, Some(80));
    assert_eq!(event.dest_name.as_deref(), Some("dest-foo"));
    assert_eq!(event.feeds, vec!["testfeed".to_string()]);

    let record = event.record.expect("flow events carry a record");
    assert_eq!(record["flow_log_id"], "111-222-333");
    assert_eq!(record["flow_action"], "allow");
    assert_eq!(record["protocol"], "tcp");
    assert_eq!(record["feeds"], json!(["testfeed"]));
}

#[test]
fn flow_event_for_suspicious_destination() {
    let event = flow_event("111-222-333", &mk_flow(), FlowKey::DestIp, "testfeed", now());
    // The id does not depend on which side matched.
    assert_eq!(event.id, "testfeed_123_tcp_1.2.3.4_443_2.3.4.5_80");
    assert_eq!(
        event.description,
        "pod mock/source-foo connected to suspicious IP 2.3.4.5 which is listed in Global Threat Feed testfeed"
    );
}

#[test]
fn flow_event_without_ports() {
    let log = FlowLog {
        source_port: None,
        dest_port: None,
        proto: "icmp".to_string(),
        ..mk_flow()
    };
    let event = flow_event("x", &log, FlowKey::SourceIp, "f", now());
    assert_eq!(event.id, "f_123_icmp_1.2.3.4__2.3.4.5_");
    assert_eq!(event.source_port, None);
}

#[test]
fn dns_event_for_suspicious_qname() {
    let log = DnsLog {
        client_name: "client-8888-34".to_string(),
        rrsets: vec![],
        ..mk_dns()
    };
    let domains = strings(&["www.badguys.co.uk"]);
    let event = dns_event("111-222-333", &log, DomainKey::QName, &domains, "test-feed", now());
    assert_eq!(
        event,
        SecurityEvent {
            id: "test-feed_1_20.21.22.23_www.badguys.co.uk".to_string(),
            type_: "gtf_suspicious_dns_query".to_string(),
            time: now().timestamp(),
            description: "default/client-8888-34 queried the domain name www.badguys.co.uk from global threat feed(s) test-feed".to_string(),
            severity: 100,
            origin: "Suspicious DNS Query".to_string(),
            source_ip: Some("20.21.22.23".to_string()),
            feeds: vec!["test-feed".to_string()],
            record: Some(json!({
                "dns_log_id": "111-222-333",
                "feeds": ["test-feed"],
                "suspicious_domains": ["www.badguys.co.uk"],
            })),
            ..SecurityEvent::default()
        }
    );
}

#[test]
fn dns_event_for_suspicious_answer_name() {
    let domains = strings(&["www1.badguys-backend.co.uk", "tigera.io"]);
    let event = dns_event(
        "111-222-333",
        &mk_dns(),
        DomainKey::RRSetName,
        &domains,
        "test-feed",
        now(),
    );
    assert_eq!(event.id, "test-feed_1_20.21.22.23_www1.badguys-backend.co.uk");
    assert_eq!(
        event.description,
        "A request originating from default/client-8888-* queried the domain name \
         www1.badguys-backend.co.uk, which is listed in the threat feed test-feed",
    );
    assert_eq!(event.origin, "Suspicious DNS Query");
    assert_eq!(
        event.record.as_ref().map(|r| r["suspicious_domains"].clone()),
        Some(json!(["www1.badguys-backend.co.uk"])),
    );

    // Several listed names are sorted and joined.
    let domains = strings(&["www1.badguys-backend.co.uk", "www.badguys.co.uk"]);
    let event = dns_event("x", &mk_dns(), DomainKey::RRSetName, &domains, "test-feed", now());
    assert_eq!(
        event.id,
        "test-feed_1_20.21.22.23_www.badguys.co.uk~www1.badguys-backend.co.uk"
    );

    let event = dns_event("x", &mk_dns(), DomainKey::RRSetName, &[], "test-feed", now());
    assert_eq!(event.id, "test-feed_1_20.21.22.23_unknown");
}

#[test]
fn dns_event_for_suspicious_answer_data() {
    let domains = strings(&["uef0.malh0st.io"]);
    let event = dns_event(
        "111-222-333",
        &mk_dns(),
        DomainKey::RRSetData,
        &domains,
        "test-feed",
        now(),
    );
    assert_eq!(event.id, "test-feed_1_20.21.22.23_uef0.malh0st.io");
    assert_eq!(
        event.description,
        "default/client-8888-* got DNS query results including suspicious domain(s) \
         uef0.malh0st.io from global threat feed(s) test-feed",
    );
    assert_eq!(event.source_ip.as_deref(), Some("20.21.22.23"));
}

#[test]
fn direct_queries_share_ids_with_their_answers() {
    // A query for a listed name also lists that name in its answer. Both
    // matches describe one occurrence, and the direct query is found first.
    let domains = strings(&["www.badguys.co.uk"]);
    let events = [DomainKey::QName, DomainKey::RRSetName, DomainKey::RRSetData]
        .into_iter()
        .map(|key| dns_event("x", &mk_dns(), key, &domains, "test-feed", now()))
        .collect::<Vec<_>>();
    assert_eq!(events[0].id, events[1].id);
    assert!(events[0].description.starts_with("default/- queried"));
    // The name is not in any answer data.
    assert_eq!(events[2].id, "test-feed_1_20.21.22.23_unknown");
}

#[test]
fn dns_logs_deserialize_answers() {
    let rsp: ScrollResponse<DnsLog> = serde_json::from_value(json!({
        "_scroll_id": "abc",
        "hits": {
            "hits": [{
                "_id": "a",
                "_source": {
                    "start_time": "2024-05-01T12:00:00Z",
                    "client_name_aggr": "client-*",
                    "qname": "tigera.io",
                    "rrsets": [
                        { "name": "tigera.io", "class": "IN", "type": "A", "rdata": ["1.2.3.4"] },
                    ],
                },
            }],
        },
    }))
    .unwrap();
    assert_eq!(rsp.scroll_id.as_deref(), Some("abc"));
    let log = rsp.hits.hits[0].source.as_ref().unwrap();
    assert_eq!(log.client_name_aggr, "client-*");
    assert_eq!(log.rrsets[0].name, "tigera.io");
    assert_eq!(log.rrsets[0].rdata, strings(&["1.2.3.4"]));
}

#[test]
fn flow_logs_deserialize_with_missing_fields() {
    let rsp: ScrollResponse<FlowLog> = serde_json::from_value(json!({
        "hits": {
            "hits": [{
                "_id": "a",
                "_source": {
                    "start_time": 10,
                    "source_ip": "1.2.3.4",
                    "dest_ip": "2.3.4.5",
                    "proto": "udp",
                },
            }],
        },
    }))
    .unwrap();
    let hit = &rsp.hits.hits[0];
    assert_eq!(hit.id, "a");
    let log = hit.source.as_ref().unwrap();
    assert_eq!(log.start_time, 10);
    assert_eq!(log.source_port, None);
    assert_eq!(log.dest_namespace, "");
}

#[test]
fn list_reads_concurrency_tokens() {
    let rsp: ScrollResponse<Value> = serde_json::from_value(json!({
        "took": 1,
        "hits": {
            "total": { "value": 2 },
            "hits": [
                { "_id": "feed-a", "_seq_no": 4, "_primary_term": 1 },
                { "_id": "feed-b" },
            ],
        },
    }))
    .unwrap();
    assert_eq!(
        metas(rsp.hits.hits),
        vec![
            Meta {
                name: "feed-a".to_string(),
                seq_no: Some(4),
                primary_term: Some(1),
            },
            Meta {
                name: "feed-b".to_string(),
                seq_no: None,
                primary_term: None,
            },
        ]
    );
}

#[test]
fn set_documents_use_the_content_field() {
    let doc = set_document(&IpSet(vec!["1.2.3.4/32".to_string()]), now());
    assert_eq!(
        doc,
        json!({ "created_at": "2024-05-01T12:00:00Z", "ips": ["1.2.3.4/32"] })
    );

    let doc = set_document(&DomainNameSet(vec!["tigera.io".to_string()]), now());
    assert_eq!(doc["domains"], json!(["tigera.io"]));
    assert!(doc.get("ips").is_none());
}

#[test]
fn set_entries_tolerates_missing_field() {
    let source = json!({ "created_at": "2024-05-01T12:00:00Z", "ips": ["1.2.3.4/32"] });
    let Value::Object(source) = source else {
        unreachable!()
    };
    assert_eq!(
        set_entries(source.clone(), IpSet::FIELD).unwrap(),
        vec!["1.2.3.4/32".to_string()]
    );
    assert_eq!(
        set_entries(source, DomainNameSet::FIELD).unwrap(),
        Vec::<String>::new()
    );

    let Value::Object(source) = json!({ "ips": null }) else {
        unreachable!()
    };
    assert!(set_entries(source, IpSet::FIELD).unwrap().is_empty());

    let Value::Object(source) = json!({ "ips": "not-a-list" }) else {
        unreachable!()
    };
    assert!(set_entries(source, IpSet::FIELD).is_err());
}

#[test]
fn bulk_body_indexes_events_by_id() {
    let events = vec![
        SecurityEvent {
            id: "e1".to_string(),
            ..SecurityEvent::default()
        },
        SecurityEvent {
            id: "e2".to_string(),
            ..SecurityEvent::default()
        },
    ];
    let body = bulk_body("tigera_secure_ee_events.cluster", &events).unwrap();
    let lines = body.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 4);
    assert!(body.ends_with('\n'));

    let action: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(
        action,
        json!({ "index": { "_index": "tigera_secure_ee_events.cluster", "_id": "e1" } })
    );
    let doc: SecurityEvent = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(doc.id, "e1");
    let action: Value = serde_json::from_str(lines[2]).unwrap();
    assert_eq!(action["index"]["_id"], "e2");
}

#[test]
fn bulk_failures_are_counted() {
    let rsp: BulkResponse = serde_json::from_value(json!({
        "errors": true,
        "items": [
            { "index": { "_id": "e1", "status": 201 } },
            { "index": { "_id": "e2", "status": 400, "error": { "type": "mapper_parsing_exception" } } },
            { "index": { "_id": "e3", "status": 200, "error": null } },
        ],
    }))
    .unwrap();
    assert!(rsp.errors);
    assert_eq!(failed_items(&rsp), 1);
}

#[test]
fn flow_query_filters_by_side_and_window() {
    let since = Utc.timestamp_opt(100, 0).unwrap();
    let until = Utc.timestamp_opt(200, 0).unwrap();
    let ips = vec!["1.2.3.4/32".to_string()];
    assert_eq!(
        flow_query(FlowKey::DestIp, &ips, since, until),
        json!({
            "bool": {
                "filter": [
                    { "range": { "end_time": { "gte": 100, "lte": 200 } } },
                    { "terms": { "dest_ip": ["1.2.3.4/32"] } },
                ]
            }
        })
    );
}

#[test]
fn dns_query_matches_qnames() {
    let since = DateTime::<Utc>::UNIX_EPOCH;
    let query = dns_query(DomainKey::QName, &strings(&["tigera.io"]), since, now());
    let filter = &query["bool"]["filter"];
    assert_eq!(filter[0]["range"]["end_time"]["gte"], "1970-01-01T00:00:00+00:00");
    assert_eq!(filter[0]["range"]["end_time"]["lte"], "2024-05-01T12:00:00+00:00");
    assert_eq!(filter[1], json!({ "terms": { "qname": ["tigera.io"] } }));
}

#[test]
fn dns_query_matches_answers_through_nested_records() {
    let since = DateTime::<Utc>::UNIX_EPOCH;
    let query = dns_query(DomainKey::RRSetName, &strings(&["tigera.io"]), since, now());
    assert_eq!(
        query["bool"]["filter"][1],
        json!({
            "nested": {
                "path": "rrsets",
                "query": { "terms": { "rrsets.name": ["tigera.io"] } },
            }
        })
    );

    let query = dns_query(DomainKey::RRSetData, &strings(&["tigera.io"]), since, now());
    assert_eq!(
        query["bool"]["filter"][1]["nested"]["query"],
        json!({ "terms": { "rrsets.rdata": ["tigera.io"] } })
    );
}

#[test]
fn search_bodies_page_in_index_order() {
    let body = search_body(json!({ "match_all": {} }));
    assert_eq!(
        body,
        json!({
            "query": { "match_all": {} },
            "size": 1000,
            "sort": ["_doc"],
        })
    );
}

#[tokio::test]
async fn scrolls_are_drained_past_the_result_window() {
    // Twelve full pages is more than a single from/size search may return.
    let mut pages = (0..12)
        .map(|p| {
            let ids = (0..QUERY_SIZE)
                .map(|i| format!("{p}-{i}"))
                .collect::<Vec<_>>();
            let ids = ids.iter().map(String::as_str).collect::<Vec<_>>();
            mk_page(Some("s1"), &ids)
        })
        .collect::<VecDeque<_>>();
    pages.push_back(mk_page(Some("s1"), &[]));
    let first = pages.pop_front().unwrap();

    let mut requested = Vec::new();
    let (hits, scroll_id) = drain_scroll(first, |id| {
        requested.push(id);
        let page = pages.pop_front().unwrap();
        async move { Ok(page) }
    })
    .await
    .unwrap();

    assert_eq!(hits.len(), 12 * QUERY_SIZE);
    assert_eq!(hits[QUERY_SIZE].id, "1-0");
    assert_eq!(requested.len(), 12);
    assert_eq!(scroll_id.as_deref(), Some("s1"));
    assert!(pages.is_empty());
}

#[tokio::test]
async fn scrolls_follow_updated_ids() {
    let mut pages = VecDeque::from([mk_page(Some("s2"), &["c"]), mk_page(None, &[])]);
    let mut requested = Vec::new();
    let (hits, scroll_id) = drain_scroll(mk_page(Some("s1"), &["a", "b"]), |id| {
        requested.push(id);
        let page = pages.pop_front().unwrap();
        async move { Ok(page) }
    })
    .await
    .unwrap();

    assert_eq!(hit_ids(&hits), strings(&["a", "b", "c"]));
    assert_eq!(requested, strings(&["s1", "s2"]));
    assert_eq!(scroll_id.as_deref(), Some("s2"));
}

#[tokio::test]
async fn scrolls_stop_without_an_id() {
    let (hits, scroll_id) = drain_scroll(mk_page(None, &["a"]), |_| async {
        Err::<ScrollResponse<Value>, _>(StoreError::NotFound("unexpected".to_string()))
    })
    .await
    .unwrap();
    assert_eq!(hit_ids(&hits), strings(&["a"]));
    assert_eq!(scroll_id, None);
}

#[tokio::test]
async fn scroll_failures_are_returned() {
    let result = drain_scroll(mk_page(Some("s1"), &["a"]), |_| async {
        Err::<ScrollResponse<Value>, _>(StoreError::NotFound("s1".to_string()))
    })
    .await;
    assert!(matches!(result, Err(StoreError::NotFound(id)) if id == "s1"));
}

#[test]
fn missing_sets_are_not_searched() {
    let missing = stored_set::<IpSet>(Err(StoreError::NotFound("f".to_string())));
    assert!(matches!(missing, Ok(None)));

    let stored = stored_set(Ok(IpSet(strings(&["1.2.3.4/32"]))));
    assert!(matches!(stored, Ok(Some(IpSet(ips))) if ips == strings(&["1.2.3.4/32"])));

    let result = unsearched(now());
    assert!(result.events.is_empty());
    assert_eq!(result.last_search, now());
    assert_eq!(result.set_hash, "", "an empty hash leaves the annotation alone");
}

#[test]
fn large_sets_are_queried_in_bounded_chunks() {
    let ips = (0..2500)
        .map(|i| format!("10.0.{}.{}/32", i / 256, i % 256))
        .collect::<Vec<_>>();
    let sizes = ips
        .chunks(MAX_CLAUSE_COUNT)
        .map(|chunk| {
            let query = flow_query(FlowKey::SourceIp, chunk, now(), now());
            query["bool"]["filter"][1]["terms"]["source_ip"]
                .as_array()
                .map(Vec::len)
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![1024, 1024, 452]);
}
