#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Causal bookkeeping for relaynet runs.
//!
//! [`VectorTime`] tracks the per-node logical clocks used to order events,
//! and [`TraceLogger`] writes the textual Synoptic traces
//! (`<time> <event>` per line) that external trace-analysis tools consume.

mod logger;
mod vector_time;

pub use logger::TraceLogger;
pub use vector_time::{NODE_SLOTS, VectorTime};
