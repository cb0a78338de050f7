//! Labelled time-series collection for synthetic test runs.
//!
//! One [`Collector`] is shared by every executor and the exposition
//! endpoint; the underlying registry is safe for concurrent observation and
//! concurrent scrape.

use std::time::Duration;

use anyhow::Result;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::catalog::Action;
use crate::trace::HttpTimings;

const STATUS_SUCCESS: &str = "success";
const STATUS_FAILURE: &str = "failure";

/// Buckets for whole-operation durations.
const OPERATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Buckets for individual HTTP phases, which sit in the millisecond range.
const PHASE_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Registry of all synthetic-test metrics.
pub struct Collector {
    registry: Registry,

    pub(crate) test_runs_total: IntCounterVec,
    test_run_duration: HistogramVec,

    pub(crate) op_duration: HistogramVec,
    pub(crate) op_bytes: CounterVec,
    pub(crate) op_count: CounterVec,
    pub(crate) op_success: IntCounterVec,

    pub(crate) http_timing: HistogramVec,

    last_duration: GaugeVec,
    last_http_phase: GaugeVec,
}

impl Collector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let test_runs_total = IntCounterVec::new(
            Opts::new(
                "synthetics_test_runs_total",
                "Total number of synthetic test runs",
            ),
            &["test_name", "step_name", "executor", "status"],
        )?;
        let test_run_duration = HistogramVec::new(
            HistogramOpts::new(
                "synthetics_test_duration_seconds",
                "Duration of synthetic test runs",
            ),
            &["test_name", "step_name", "executor"],
        )?;
        let op_duration = HistogramVec::new(
            HistogramOpts::new(
                "synth_duration_seconds",
                "Duration of storage operations (upload, download, etc.)",
            )
            .buckets(OPERATION_BUCKETS.to_vec()),
            &["test_name", "action", "executor", "bucket", "file_size"],
        )?;
        let op_bytes = CounterVec::new(
            Opts::new(
                "synth_bytes_total",
                "Total bytes transferred to or from storage",
            ),
            &["test_name", "action", "executor", "bucket"],
        )?;
        let op_count = CounterVec::new(
            Opts::new(
                "synth_operation_count_total",
                "Total count of storage operations",
            ),
            &["test_name", "action", "executor", "bucket"],
        )?;
        let op_success = IntCounterVec::new(
            Opts::new(
                "synth_operation_success_total",
                "Storage operation outcomes by status",
            ),
            &["test_name", "action", "executor", "status"],
        )?;
        let http_timing = HistogramVec::new(
            HistogramOpts::new(
                "synth_http_timing_seconds",
                "Granular HTTP timing breakdown (dns, connect, tls, ttfb, transfer)",
            )
            .buckets(PHASE_BUCKETS.to_vec()),
            &["test_name", "action", "executor", "phase"],
        )?;
        let last_duration = GaugeVec::new(
            Opts::new(
                "synth_last_duration_seconds",
                "Duration of the most recent operation",
            ),
            &["test_name", "action", "executor"],
        )?;
        let last_http_phase = GaugeVec::new(
            Opts::new(
                "synth_last_http_phase_seconds",
                "Most recent HTTP phase timing",
            ),
            &["test_name", "action", "executor", "phase"],
        )?;

        registry.register(Box::new(test_runs_total.clone()))?;
        registry.register(Box::new(test_run_duration.clone()))?;
        registry.register(Box::new(op_duration.clone()))?;
        registry.register(Box::new(op_bytes.clone()))?;
        registry.register(Box::new(op_count.clone()))?;
        registry.register(Box::new(op_success.clone()))?;
        registry.register(Box::new(http_timing.clone()))?;
        registry.register(Box::new(last_duration.clone()))?;
        registry.register(Box::new(last_http_phase.clone()))?;

        Ok(Collector {
            registry,
            test_runs_total,
            test_run_duration,
            op_duration,
            op_bytes,
            op_count,
            op_success,
            http_timing,
            last_duration,
            last_http_phase,
        })
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Records one test or step execution. An empty `step_name` denotes the
    /// overall run.
    pub fn record_test_run(
        &self,
        test_name: &str,
        step_name: &str,
        executor: &str,
        success: bool,
        duration: Duration,
    ) {
        let status = if success { STATUS_SUCCESS } else { STATUS_FAILURE };
        self.test_runs_total
            .with_label_values(&[test_name, step_name, executor, status])
            .inc();
        self.test_run_duration
            .with_label_values(&[test_name, step_name, executor])
            .observe(duration.as_secs_f64());
    }

    /// Records an upload operation.
    pub fn record_upload(
        &self,
        test_name: &str,
        executor: &str,
        bucket: &str,
        file_size: &str,
        duration: Duration,
        bytes: u64,
        success: bool,
    ) {
        let action = Action::Upload.as_str();
        if !file_size.is_empty() && !duration.is_zero() {
            self.op_duration
                .with_label_values(&[test_name, action, executor, bucket, file_size])
                .observe(duration.as_secs_f64());
        }
        if !duration.is_zero() {
            self.last_duration
                .with_label_values(&[test_name, action, executor])
                .set(duration.as_secs_f64());
        }
        if success {
            self.op_bytes
                .with_label_values(&[test_name, action, executor, bucket])
                .inc_by(bytes as f64);
            self.op_count
                .with_label_values(&[test_name, action, executor, bucket])
                .inc();
            self.success(test_name, action, executor, true);
        } else {
            self.success(test_name, action, executor, false);
        }
    }

    /// Records a download operation. When no `file_size` label is given it
    /// is derived from the observed byte count, with `"unknown"` as the last
    /// resort so the histogram is always recorded.
    pub fn record_download(
        &self,
        test_name: &str,
        executor: &str,
        bucket: &str,
        file_size: &str,
        duration: Duration,
        bytes: u64,
        success: bool,
    ) {
        let action = Action::Download.as_str();

        let derived;
        let file_size = if file_size.is_empty() {
            derived = if bytes > 0 {
                format_bytes_label(bytes)
            } else {
                "unknown".to_owned()
            };
            derived.as_str()
        } else {
            file_size
        };

        if !duration.is_zero() {
            self.op_duration
                .with_label_values(&[test_name, action, executor, bucket, file_size])
                .observe(duration.as_secs_f64());
            self.last_duration
                .with_label_values(&[test_name, action, executor])
                .set(duration.as_secs_f64());
        }
        if success {
            self.op_bytes
                .with_label_values(&[test_name, action, executor, bucket])
                .inc_by(bytes as f64);
            self.op_count
                .with_label_values(&[test_name, action, executor, bucket])
                .inc();
            self.success(test_name, action, executor, true);
        } else {
            self.success(test_name, action, executor, false);
        }
    }

    /// Records a delete operation covering `count` objects.
    pub fn record_delete(
        &self,
        test_name: &str,
        executor: &str,
        bucket: &str,
        file_size: &str,
        duration: Duration,
        count: u64,
        success: bool,
    ) {
        let action = Action::Delete.as_str();
        if !file_size.is_empty() && !duration.is_zero() {
            self.op_duration
                .with_label_values(&[test_name, action, executor, bucket, file_size])
                .observe(duration.as_secs_f64());
        }
        if !duration.is_zero() {
            self.last_duration
                .with_label_values(&[test_name, action, executor])
                .set(duration.as_secs_f64());
        }
        self.success(test_name, action, executor, success);
        if success && count > 0 {
            self.op_count
                .with_label_values(&[test_name, action, executor, bucket])
                .inc_by(count as f64);
        }
    }

    /// Records a list operation.
    pub fn record_list(&self, test_name: &str, executor: &str, bucket: &str, success: bool) {
        let action = Action::List.as_str();
        self.success(test_name, action, executor, success);
        if success {
            self.op_count
                .with_label_values(&[test_name, action, executor, bucket])
                .inc();
        }
    }

    /// Records every nonzero phase of one HTTP exchange.
    pub fn record_http_timings(
        &self,
        test_name: &str,
        action: Action,
        executor: &str,
        timings: &HttpTimings,
    ) {
        let phases = [
            ("dns", timings.dns),
            ("connect", timings.tcp_connect),
            ("tls", timings.tls_handshake),
            ("ttfb", timings.ttfb),
            ("transfer", timings.transfer),
            ("total", timings.total),
        ];
        for (phase, duration) in phases {
            self.record_http_phase(test_name, action, executor, phase, duration);
        }
    }

    /// Records a single named phase (e.g. `sign`) when nonzero.
    pub fn record_http_phase(
        &self,
        test_name: &str,
        action: Action,
        executor: &str,
        phase: &str,
        duration: Duration,
    ) {
        if duration.is_zero() {
            return;
        }
        let action = action.as_str();
        self.http_timing
            .with_label_values(&[test_name, action, executor, phase])
            .observe(duration.as_secs_f64());
        self.last_http_phase
            .with_label_values(&[test_name, action, executor, phase])
            .set(duration.as_secs_f64());
    }

    fn success(&self, test_name: &str, action: &str, executor: &str, success: bool) {
        let status = if success { STATUS_SUCCESS } else { STATUS_FAILURE };
        self.op_success
            .with_label_values(&[test_name, action, executor, status])
            .inc();
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector").finish_non_exhaustive()
    }
}

/// Formats observed bytes as the coarsest exact power-of-1024 label so that
/// derived download labels line up with declared upload sizes.
fn format_bytes_label(bytes: u64) -> String {
    crate::catalog::ByteSize::new(bytes).to_string()
}
