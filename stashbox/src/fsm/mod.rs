//! Request state machine.
//!
//! A request walks `Lookup`, then one of `ServeHit`, `ServingStale` or
//! `Upstream`, and always ends in `Done`. Requests the cache must not touch
//! go through `Bypass` instead.

mod fetch;
pub mod pipeline;
mod states;

pub use pipeline::{CachePipeline, CachePipelineBuilder};
pub use states::{Answer, FetchFailure, Fetched, Revalidation, State};
