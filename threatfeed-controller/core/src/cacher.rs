use crate::{ClientError, GlobalThreatFeed, ThreatFeeds};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Serializes all reads and writes of one feed through a single task.
///
/// The feed is loaded from the API on the first request and served from
/// memory afterwards. Writes replace the cached copy on success; a conflict
/// reloads the authoritative copy and hands it back with the error so that
/// the caller can merge and retry.
#[derive(Clone)]
pub struct FeedCacher {
    name: Arc<str>,
    tx: mpsc::Sender<Request>,
    rx: Arc<Mutex<Option<mpsc::Receiver<Request>>>>,
    client: Arc<dyn ThreatFeeds>,
    token: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The write lost an optimistic-concurrency race. `current` holds the
    /// reloaded feed.
    #[error("conflict: {source}")]
    Conflict {
        current: Box<GlobalThreatFeed>,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("feed cache is closed")]
    Closed,
}

/// Classifies the error conditions recorded on a feed's status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorType {
    PullFailed,
    SearchFailed,
    LinseedSyncFailed,
    GlobalNetworkSetSyncFailed,
}

struct Request {
    op: Op,
    rsp: oneshot::Sender<Result<GlobalThreatFeed, CacheError>>,
}

enum Op {
    Get,
    Update(GlobalThreatFeed),
    UpdateStatus(GlobalThreatFeed),
}

// === impl FeedCacher ===

impl FeedCacher {
    pub fn new(name: impl Into<Arc<str>>, client: Arc<dyn ThreatFeeds>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name: name.into(),
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            client,
            token: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the request consumer. Only the first call has any effect.
    pub fn run(&self, parent: &CancellationToken) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let token = self.token.clone();
        let parent = parent.clone();
        let this = self.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = this.serve(rx) => {}
                    _ = parent.cancelled() => token.cancel(),
                }
            }
            .instrument(info_span!("cacher", feed = %self.name)),
        );
    }

    /// Stops the consumer. Outstanding and future requests fail with
    /// [`CacheError::Closed`].
    pub fn close(&self) {
        self.token.cancel();
    }

    pub async fn get(&self) -> Result<GlobalThreatFeed, CacheError> {
        self.request(Op::Get).await
    }

    pub async fn update(&self, feed: GlobalThreatFeed) -> Result<GlobalThreatFeed, CacheError> {
        self.request(Op::Update(feed)).await
    }

    pub async fn update_status(
        &self,
        feed: GlobalThreatFeed,
    ) -> Result<GlobalThreatFeed, CacheError> {
        self.request(Op::UpdateStatus(feed)).await
    }

    async fn request(&self, op: Op) -> Result<GlobalThreatFeed, CacheError> {
        let (rsp, rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(CacheError::Closed),
            res = self.tx.send(Request { op, rsp }) => {
                if res.is_err() {
                    return Err(CacheError::Closed);
                }
            }
        }
        tokio::select! {
            biased;
            res = rx => res.unwrap_or(Err(CacheError::Closed)),
            _ = self.token.cancelled() => Err(CacheError::Closed),
        }
    }

    async fn serve(&self, mut rx: mpsc::Receiver<Request>) {
        let mut cached = None;
        loop {
            let Request { op, rsp } = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            let res = self.handle(&mut cached, op).await;
            let _ = rsp.send(res);
        }
        debug!("Stopped");
    }

    async fn handle(
        &self,
        cached: &mut Option<GlobalThreatFeed>,
        op: Op,
    ) -> Result<GlobalThreatFeed, CacheError> {
        let current = match cached {
            Some(feed) => feed.clone(),
            None => {
                let feed = self.client.get(&self.name).await?;
                debug!(resource_version = ?feed.metadata.resource_version, "Loaded");
                *cached = Some(feed.clone());
                feed
            }
        };

        let res = match op {
            Op::Get => return Ok(current),
            Op::Update(feed) => self.client.update(&feed).await,
            Op::UpdateStatus(feed) => self.client.update_status(&feed).await,
        };
        match res {
            Ok(feed) => {
                *cached = Some(feed.clone());
                Ok(feed)
            }
            Err(source) if source.is_conflict() => {
                let current = self.client.get(&self.name).await?;
                debug!(
                    resource_version = ?current.metadata.resource_version,
                    "Reloaded after conflict"
                );
                *cached = Some(current.clone());
                Err(CacheError::Conflict {
                    current: Box::new(current),
                    source,
                })
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl fmt::Debug for FeedCacher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCacher")
            .field("name", &self.name)
            .field("closed", &self.token.is_cancelled())
            .finish()
    }
}

// === impl ErrorType ===

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullFailed => "PullFailed",
            Self::SearchFailed => "SearchFailed",
            Self::LinseedSyncFailed => "LinseedSyncFailed",
            Self::GlobalNetworkSetSyncFailed => "GlobalNetworkSetSyncFailed",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
