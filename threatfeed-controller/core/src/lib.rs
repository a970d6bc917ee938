#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cacher;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod runloop;
pub mod status;
mod store;


pub use self::{
    cacher::{CacheError, ErrorType, FeedCacher},
    store::{
        DomainNameSet, EventSink, IpSet, Meta, SecurityEvent, SetQueryResult, SetStore,
        StoreError, SuspiciousSet,
    },
};
pub use threatfeed_controller_k8s_api::{ClientError, GlobalThreatFeed, ThreatFeeds};
