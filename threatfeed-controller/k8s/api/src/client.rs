use crate::{GlobalNetworkSet, GlobalThreatFeed};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    ResourceExt,
};
use std::collections::BTreeMap;

/// Errors returned by Kubernetes API collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The object was modified concurrently; the caller holds a stale copy.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Reads and writes `GlobalThreatFeed` resources.
#[async_trait::async_trait]
pub trait ThreatFeeds: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<GlobalThreatFeed, ClientError>;

    /// Replaces the feed's metadata and spec, failing with a conflict if the
    /// feed's resource version is stale.
    async fn update(&self, feed: &GlobalThreatFeed) -> Result<GlobalThreatFeed, ClientError>;

    /// Replaces the feed's status, failing with a conflict if the feed's
    /// resource version is stale.
    async fn update_status(&self, feed: &GlobalThreatFeed)
        -> Result<GlobalThreatFeed, ClientError>;
}

/// Mutates `GlobalNetworkSet` resources. Reads are served by a watch.
#[async_trait::async_trait]
pub trait GlobalNetworkSets: Send + Sync + 'static {
    async fn create(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError>;

    async fn update(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError>;

    async fn delete(&self, name: &str) -> Result<(), ClientError>;
}

/// Resolves the data of a named ConfigMap or Secret.
#[async_trait::async_trait]
pub trait KeyValues: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<BTreeMap<String, String>, ClientError>;
}

/// Reads ConfigMaps in the feeds namespace.
#[derive(Clone)]
pub struct ConfigMaps(pub Api<ConfigMap>);

/// Reads Secrets in the feeds namespace.
#[derive(Clone)]
pub struct Secrets(pub Api<Secret>);

// === impl ClientError ===

impl ClientError {
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self::Other(error.into())
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(rsp) if rsp.code == 409 => Self::Conflict(rsp.message),
            kube::Error::Api(rsp) if rsp.code == 404 => Self::NotFound(rsp.message),
            kube::Error::Api(rsp) if rsp.code == 422 => Self::Invalid(rsp.message),
            error => Self::Other(Box::new(error)),
        }
    }
}

// === impl Api<GlobalThreatFeed> ===

#[async_trait::async_trait]
impl ThreatFeeds for Api<GlobalThreatFeed> {
    async fn get(&self, name: &str) -> Result<GlobalThreatFeed, ClientError> {
        Ok(Api::get(self, name).await?)
    }

    async fn update(&self, feed: &GlobalThreatFeed) -> Result<GlobalThreatFeed, ClientError> {
        Ok(self
            .replace(&feed.name_any(), &PostParams::default(), feed)
            .await?)
    }

    async fn update_status(
        &self,
        feed: &GlobalThreatFeed,
    ) -> Result<GlobalThreatFeed, ClientError> {
        // Carrying the resource version makes the patch conditional.
        let patch = Patch::Merge(serde_json::json!({
            "metadata": { "resourceVersion": feed.resource_version() },
            "status": feed.status,
        }));
        Ok(self
            .patch_status(&feed.name_any(), &PatchParams::default(), &patch)
            .await?)
    }
}

// === impl Api<GlobalNetworkSet> ===

#[async_trait::async_trait]
impl GlobalNetworkSets for Api<GlobalNetworkSet> {
    async fn create(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError> {
        Ok(Api::create(self, &PostParams::default(), gns).await?)
    }

    async fn update(&self, gns: &GlobalNetworkSet) -> Result<GlobalNetworkSet, ClientError> {
        Ok(self
            .replace(&gns.name_any(), &PostParams::default(), gns)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<(), ClientError> {
        Api::delete(self, name, &DeleteParams::default()).await?;
        Ok(())
    }
}

// === impl ConfigMaps ===

#[async_trait::async_trait]
impl KeyValues for ConfigMaps {
    async fn get(&self, name: &str) -> Result<BTreeMap<String, String>, ClientError> {
        let cm = self.0.get(name).await?;
        Ok(cm.data.unwrap_or_default())
    }
}

// === impl Secrets ===

#[async_trait::async_trait]
impl KeyValues for Secrets {
    async fn get(&self, name: &str) -> Result<BTreeMap<String, String>, ClientError> {
        let secret = self.0.get(name).await?;
        let mut data = secret.string_data.unwrap_or_default();
        for (k, v) in secret.data.unwrap_or_default() {
            data.insert(k, String::from_utf8_lossy(&v.0).into_owned());
        }
        Ok(data)
    }
}
