//! Fabric performance poller.
//!
//! Recurring metric tasks polled on a shared refresh rate, fanned out to
//! every subscriber once per cycle, combined into batches across sources,
//! and aggregated into a sliding-window health score.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod export;
pub mod fabric;
pub mod perf;
pub mod persist;
pub mod scheduler;
pub mod task;
