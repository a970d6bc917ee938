//! In-memory implementations of the feed collaborators.

use crate::puller::{FetchError, HttpClient, Response};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{header::HeaderMap, StatusCode, Url};
use std::{collections::VecDeque, sync::Arc};

pub use threatfeed_controller_core::fake::*;

/// Serves queued responses, then a fixed response, recording every request.
#[derive(Clone, Default)]
pub struct FakeHttp {
    inner: Arc<Mutex<HttpState>>,
}

#[derive(Default)]
struct HttpState {
    queued: VecDeque<Result<Response, FetchError>>,
    fixed: Option<Response>,
    requests: Vec<(Url, HeaderMap)>,
}

impl FakeHttp {
    /// Responds to every unqueued request with `status` and `body`.
    pub fn respond(&self, status: StatusCode, body: impl Into<Bytes>) {
        self.inner.lock().fixed = Some(Response {
            status,
            body: body.into(),
        });
    }

    pub fn push(&self, rsp: Result<Response, FetchError>) {
        self.inner.lock().queued.push_back(rsp);
    }

    pub fn requests(&self) -> Vec<(Url, HeaderMap)> {
        self.inner.lock().requests.clone()
    }

    pub fn calls(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

#[async_trait::async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<Response, FetchError> {
        let mut state = self.inner.lock();
        state.requests.push((url.clone(), headers.clone()));
        if let Some(rsp) = state.queued.pop_front() {
            return rsp;
        }
        state
            .fixed
            .clone()
            .ok_or_else(|| FetchError::Other(format!("no response for {url}").into()))
    }
}
