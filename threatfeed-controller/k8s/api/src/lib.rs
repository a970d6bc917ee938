#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
pub mod duration;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod global_network_set;
pub mod threat_feed;

pub use self::{
    client::{ClientError, ConfigMaps, GlobalNetworkSets, KeyValues, Secrets, ThreatFeeds},
    duration::K8sDuration,
    global_network_set::{GlobalNetworkSet, GlobalNetworkSetSpec},
    threat_feed::{
        GlobalThreatFeed, GlobalThreatFeedSpec, GlobalThreatFeedStatus, ThreatFeedContent,
        ThreatFeedMode,
    },
};
pub use k8s_openapi::api::core::v1::{ConfigMap, Secret};
pub use kube::{
    api::{Api, ObjectMeta},
    runtime::watcher,
    Client, ResourceExt,
};
