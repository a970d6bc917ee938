#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod puller;
pub mod searcher;
pub mod watcher;

pub use self::{
    puller::{HttpClient, PullClients, Puller},
    searcher::Searcher,
    watcher::{Reconcilers, Stores, Watcher},
};
