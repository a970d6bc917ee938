use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The maximum number of error conditions retained on a feed's status.
pub const MAX_ERROR_CONDITIONS: usize = 10;

/// Annotation recording the content hash of the last searched IP set.
pub const IP_SET_HASH_KEY: &str = "projectcalico.org/ipSetHash";

/// Annotation recording the content hash of the last searched domain set.
pub const DOMAIN_NAME_SET_HASH_KEY: &str = "projectcalico.org/domainNameSetHash";

/// Describes an external source of threat intelligence.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "projectcalico.org",
    version = "v3",
    kind = "GlobalThreatFeed",
    status = "GlobalThreatFeedStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalThreatFeedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ThreatFeedContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ThreatFeedMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// When set, the feed's IP set is mirrored into a `GlobalNetworkSet`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_network_set: Option<GlobalNetworkSetSync>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<Pull>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ThreatFeedContent {
    #[default]
    IPSet,
    DomainNameSet,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ThreatFeedMode {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GlobalNetworkSetSync {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pull {
    /// A Go-style duration string. Unparsable values fall back to 24h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpPull>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpPull {
    #[serde(default)]
    pub format: ThreatFeedFormat,

    pub url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,
}

/// At most one of the formats is expected to be set; none means
/// newline-delimited.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFeedFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newline_delimited: Option<NewlineDelimitedFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv: Option<CsvFormat>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NewlineDelimitedFormat {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct JsonFormat {
    /// A JSONPath expression selecting an array of strings.
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsvFormat {
    /// Zero-based index of the column holding feed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_num: Option<u32>,

    /// Name of the column holding feed entries. Implies a header row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_delimiter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_delimiter: Option<String>,

    /// Expected number of fields per record. Zero means the first record
    /// decides.
    #[serde(default)]
    pub record_size: u32,

    #[serde(default)]
    pub disable_record_size_validation: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeader {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<HttpHeaderSource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHeaderSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
}

/// Selects a key of a ConfigMap or Secret in the feeds namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct KeyRef {
    pub name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalThreatFeedStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_search: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_conditions: Vec<ErrorCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ErrorCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

// === impl GlobalThreatFeed ===

impl GlobalThreatFeed {
    #[inline]
    pub fn content(&self) -> ThreatFeedContent {
        self.spec.content.unwrap_or_default()
    }

    #[inline]
    pub fn mode(&self) -> ThreatFeedMode {
        self.spec.mode.unwrap_or_default()
    }

    #[inline]
    pub fn http_pull(&self) -> Option<&HttpPull> {
        self.spec.pull.as_ref()?.http.as_ref()
    }

    /// Returns the labels to apply to the feed's `GlobalNetworkSet`, if
    /// syncing is enabled.
    #[inline]
    pub fn global_network_set_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.global_network_set.as_ref().map(|gns| &gns.labels)
    }

    pub fn status_mut(&mut self) -> &mut GlobalThreatFeedStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

// === impl GlobalThreatFeedStatus ===

impl GlobalThreatFeedStatus {
    /// Appends an error condition, evicting the oldest entries so that at
    /// most [`MAX_ERROR_CONDITIONS`] remain.
    pub fn add_error_condition(&mut self, type_: impl Into<String>, message: impl Into<String>) {
        self.error_conditions.push(ErrorCondition {
            type_: type_.into(),
            message: message.into(),
        });
        if self.error_conditions.len() > MAX_ERROR_CONDITIONS {
            let excess = self.error_conditions.len() - MAX_ERROR_CONDITIONS;
            self.error_conditions.drain(..excess);
        }
    }

    /// Removes all conditions of the given type. Returns true if any were
    /// removed.
    pub fn clear_error_conditions(&mut self, type_: &str) -> bool {
        let before = self.error_conditions.len();
        self.error_conditions.retain(|c| c.type_ != type_);
        self.error_conditions.len() != before
    }

    pub fn has_error_condition(&self, type_: &str) -> bool {
        self.error_conditions.iter().any(|c| c.type_ == type_)
    }
}

// === impl ThreatFeedFormat ===

impl ThreatFeedFormat {
    /// True if no format is configured, which is treated as newline-delimited.
    pub fn is_unset(&self) -> bool {
        self.newline_delimited.is_none() && self.json.is_none() && self.csv.is_none()
    }
}
