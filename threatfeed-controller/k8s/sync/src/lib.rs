#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod globalnetworksets;
pub mod queue;
mod sets;

#[cfg(test)]
mod tests;

pub use self::{
    globalnetworksets::GlobalNetworkSetController,
    sets::{DomainNameSetController, IpSetController, SetController},
};
use std::sync::Arc;

/// Invoked when a feed's contents could not be written, so that the feed can
/// arrange to retry sooner than its regular period.
pub type FailFn = Arc<dyn Fn() + Send + Sync + 'static>;
