//! The measurement and dispatch engine behind the synthetic monitor.
//!
//! A [`scheduler::Scheduler`] fires declared [`catalog::Test`]s on their cron
//! schedules and fans them into pluggable [`executor`] backends. Each backend
//! exercises an S3-compatible endpoint (upload, download, delete, list),
//! captures per-phase timings, and records the observations into the shared
//! [`metrics::Collector`].

pub mod catalog;
pub mod error;
pub mod executor;
pub mod jitter;
pub mod metrics;
pub mod points;
pub mod runid;
pub mod scheduler;
pub mod signer;
pub mod testdata;
pub mod trace;
pub mod wire;
