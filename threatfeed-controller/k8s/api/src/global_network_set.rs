use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label key identifying objects managed by this controller.
pub const CREATOR_LABEL: &str = "tigera.io/creator";

/// Label value identifying objects managed by this controller.
pub const CREATOR_VALUE: &str = "intrusion-detection-controller";

const NAME_PREFIX: &str = "threatfeed.";

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "projectcalico.org", version = "v3", kind = "GlobalNetworkSet")]
#[serde(rename_all = "camelCase")]
pub struct GlobalNetworkSetSpec {
    #[serde(default)]
    pub nets: Vec<String>,
}

/// Label selector matching every managed `GlobalNetworkSet`.
pub fn creator_selector() -> String {
    format!("{CREATOR_LABEL}={CREATOR_VALUE}")
}

/// Returns the name of the `GlobalNetworkSet` mirroring the named feed.
pub fn global_network_set_name(feed: &str) -> String {
    format!("{NAME_PREFIX}{feed}")
}

// === impl GlobalNetworkSet ===

impl GlobalNetworkSet {
    /// Builds the desired set for a feed: the feed's sync labels plus the
    /// creator label, with the snapshot as its nets.
    pub fn for_feed(feed: &str, labels: &BTreeMap<String, String>, nets: Vec<String>) -> Self {
        let mut labels = labels.clone();
        labels.insert(CREATOR_LABEL.to_string(), CREATOR_VALUE.to_string());
        let mut gns = GlobalNetworkSet::new(
            &global_network_set_name(feed),
            GlobalNetworkSetSpec { nets },
        );
        gns.metadata.labels = Some(labels);
        gns
    }

    /// Compares only the fields this controller manages.
    pub fn same_labels_and_spec(&self, other: &Self) -> bool {
        let labels = |g: &Self| g.metadata.labels.clone().unwrap_or_default();
        labels(self) == labels(other) && self.spec == other.spec
    }
}
