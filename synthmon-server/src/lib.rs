//! The synthetic monitor server binary.
//!
//! This builds on the measurement engine in [`synthmon_service`] and wires it
//! to configuration, logging, and the HTTP surface that exposes the collected
//! metrics to an external scraper.
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod endpoints;
pub mod healthcheck;
pub mod observability;
pub mod state;
pub mod web;
