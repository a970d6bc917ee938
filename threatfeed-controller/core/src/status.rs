//! Retrying read-modify-write helpers for a cached feed.

use crate::{CacheError, ErrorType, FeedCacher, GlobalThreatFeed};
use chrono::{DateTime, Utc};

/// The number of times a write is attempted before a conflict is surfaced.
pub const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Copy, Clone, Debug)]
enum Target {
    Object,
    Status,
}

/// Applies `f` to the cached feed and writes its status, reapplying `f` to
/// the reloaded feed on conflict. If `f` returns false nothing is written and
/// `Ok(None)` is returned.
pub async fn update_status_with<F>(
    cacher: &FeedCacher,
    f: F,
) -> Result<Option<GlobalThreatFeed>, CacheError>
where
    F: FnMut(&mut GlobalThreatFeed) -> bool,
{
    write_with(cacher, Target::Status, f).await
}

/// Like [`update_status_with`], for the feed's metadata and spec.
pub async fn update_with<F>(
    cacher: &FeedCacher,
    f: F,
) -> Result<Option<GlobalThreatFeed>, CacheError>
where
    F: FnMut(&mut GlobalThreatFeed) -> bool,
{
    write_with(cacher, Target::Object, f).await
}

async fn write_with<F>(
    cacher: &FeedCacher,
    target: Target,
    mut f: F,
) -> Result<Option<GlobalThreatFeed>, CacheError>
where
    F: FnMut(&mut GlobalThreatFeed) -> bool,
{
    let mut feed = cacher.get().await?;
    let mut attempt = 1;
    loop {
        if !f(&mut feed) {
            return Ok(None);
        }
        let res = match target {
            Target::Object => cacher.update(feed).await,
            Target::Status => cacher.update_status(feed).await,
        };
        match res {
            Ok(feed) => return Ok(Some(feed)),
            Err(CacheError::Conflict { current, .. }) if attempt < MAX_CONFLICT_RETRIES => {
                tracing::debug!(attempt, "Retrying conflicting feed update");
                attempt += 1;
                feed = *current;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Records an error condition on the feed's status.
pub async fn add_error_condition(cacher: &FeedCacher, type_: ErrorType, message: impl ToString) {
    let message = message.to_string();
    let res = update_status_with(cacher, |feed| {
        feed.status_mut()
            .add_error_condition(type_.as_str(), message.clone());
        true
    })
    .await;
    if let Err(error) = res {
        tracing::error!(feed = %cacher.name(), %type_, %error, "Failed to record error condition");
    }
}

/// Removes all error conditions of the given type, writing only if any exist.
pub async fn clear_error_condition(cacher: &FeedCacher, type_: ErrorType) {
    let res = update_status_with(cacher, |feed| {
        feed.status
            .as_mut()
            .map(|s| s.clear_error_conditions(type_.as_str()))
            .unwrap_or(false)
    })
    .await;
    if let Err(error) = res {
        tracing::error!(feed = %cacher.name(), %type_, %error, "Failed to clear error condition");
    }
}

/// Sets `LastSuccessfulSync` and clears pull failures, unless a newer sync
/// has already been recorded.
pub async fn record_successful_sync(cacher: &FeedCacher, at: DateTime<Utc>) {
    let res = update_status_with(cacher, |feed| {
        let status = feed.status_mut();
        if status.last_successful_sync.is_some_and(|t| t >= at) {
            return false;
        }
        status.last_successful_sync = Some(at);
        status.clear_error_conditions(ErrorType::PullFailed.as_str());
        true
    })
    .await;
    if let Err(error) = res {
        tracing::error!(feed = %cacher.name(), %error, "Failed to update last successful sync");
    }
}

/// Sets `LastSuccessfulSearch` and clears search failures, unless a newer
/// search has already been recorded.
pub async fn record_successful_search(
    cacher: &FeedCacher,
    at: DateTime<Utc>,
) -> Result<(), CacheError> {
    update_status_with(cacher, |feed| {
        let status = feed.status_mut();
        if status.last_successful_search.is_some_and(|t| t >= at) {
            return false;
        }
        status.last_successful_search = Some(at);
        status.clear_error_conditions(ErrorType::SearchFailed.as_str());
        true
    })
    .await?;
    Ok(())
}
