//! Executor that drives a scripted child process speaking the native
//! protocol.
//!
//! The child receives its parameters through the environment and writes a
//! line-delimited metric stream to a temporary file, which is replayed into
//! the collector after the child exits. The stream is parsed even when the
//! child fails, so partial runs keep their observations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{declared_size_label, RunContext, TestExecutor};
use crate::catalog::TestStep;
use crate::error::StepError;
use crate::metrics::Collector;
use crate::points::{self, MetricPoint};

/// Settings for the scripted child process.
#[derive(Debug, Clone)]
pub struct NativeConfig {
    pub binary_path: PathBuf,
    /// Metric stream format passed to `--out <format>=<file>`.
    pub output_format: String,
    pub access_grant: String,
    pub bucket: String,
}

pub struct NativeExecutor {
    config: NativeConfig,
    collector: Arc<Collector>,
}

impl NativeExecutor {
    pub fn new(config: NativeConfig, collector: Arc<Collector>) -> Self {
        NativeExecutor { config, collector }
    }

    /// Replays the child's metric stream into the collector.
    ///
    /// The metric-name mapping is a closed enumeration: upload and download
    /// samples are combined into one record each (so the histogram sees both
    /// duration and byte count), deletes are recorded per point.
    fn record_points(
        &self,
        test_name: &str,
        bucket: &str,
        file_size_label: &str,
        parsed: Vec<MetricPoint>,
    ) {
        let executor = self.name();
        let count = parsed.len();
        let grouped = points::group_by_metric(parsed);

        let first = |name: &str| grouped.get(name).and_then(|ps| ps.first()).map(|p| p.value);

        let upload_duration = millis(first("storj_upload_duration_ms").unwrap_or_default());
        let upload_bytes = first("storj_upload_bytes_total").unwrap_or_default() as u64;
        let upload_success = first("storj_upload_success").map(|v| v > 0.0).unwrap_or(true);
        if !upload_duration.is_zero() || upload_bytes > 0 {
            self.collector.record_upload(
                test_name,
                executor,
                bucket,
                file_size_label,
                upload_duration,
                upload_bytes,
                upload_success,
            );
        }

        let download_duration = millis(first("storj_download_duration_ms").unwrap_or_default());
        let download_bytes = first("storj_download_bytes_total").unwrap_or_default() as u64;
        let download_success = first("storj_download_success")
            .map(|v| v > 0.0)
            .unwrap_or(true);
        if !download_duration.is_zero() || download_bytes > 0 {
            self.collector.record_download(
                test_name,
                executor,
                bucket,
                file_size_label,
                download_duration,
                download_bytes,
                download_success,
            );
        }

        if let Some(durations) = grouped.get("storj_delete_duration_ms") {
            for point in durations {
                self.collector.record_delete(
                    test_name,
                    executor,
                    bucket,
                    file_size_label,
                    millis(point.value),
                    1,
                    true,
                );
            }
        }

        if let Some(outcomes) = grouped.get("storj_delete_success") {
            for point in outcomes {
                if point.value <= 0.0 {
                    self.collector.record_delete(
                        test_name,
                        executor,
                        bucket,
                        file_size_label,
                        Duration::ZERO,
                        1,
                        false,
                    );
                }
            }
        }

        if let Some(counts) = grouped.get("storj_delete_count_total") {
            let total: u64 = counts.iter().map(|p| p.value.max(0.0) as u64).sum();
            if total > 0 {
                self.collector.record_delete(
                    test_name,
                    executor,
                    bucket,
                    "",
                    Duration::ZERO,
                    total,
                    true,
                );
            }
        }

        tracing::debug!("parsed {count} metric point(s) from test {test_name}");
    }
}

#[async_trait]
impl TestExecutor for NativeExecutor {
    fn name(&self) -> &'static str {
        "native"
    }

    fn collector(&self) -> &Collector {
        &self.collector
    }

    fn default_bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn run_step(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        step.action()?;
        let script = step.script_path.as_ref().ok_or(StepError::MissingScript)?;

        let output_file = tempfile::Builder::new()
            .prefix(&format!("k6-output-{}-{}-", run.test_name, step.name))
            .suffix(".json")
            .tempfile()?;

        let mut cmd = Command::new(&self.config.binary_path);
        cmd.arg("run")
            .arg("--out")
            .arg(format!(
                "{}={}",
                self.config.output_format,
                output_file.path().display()
            ))
            .arg("--summary-mode=disabled")
            .arg("--no-usage-report")
            .arg("--quiet")
            .arg(script)
            .env("STORJ_ACCESS_GRANT", &self.config.access_grant)
            .env("STORJ_BUCKET", &run.bucket)
            .env("TEST_NAME", &run.test_name)
            .env("SHARED_FILE", &run.object_key)
            .env("TEST_ULID", run.run_id.to_string())
            .kill_on_drop(true);

        if let Some(size) = step.file_size {
            cmd.env("FILE_SIZE", size.bytes().to_string());
        }
        if let Some(ttl) = step.ttl_seconds {
            cmd.env("TTL_SECONDS", ttl.to_string());
        }
        if let Some(prefix) = &step.file_prefix {
            cmd.env("FILE_PREFIX", prefix);
        }
        if let Some(max_age) = step.max_age_minutes {
            cmd.env("MAX_AGE_MINUTES", max_age.to_string());
        }
        if let Some(max_delete) = step.max_delete {
            cmd.env("MAX_DELETE", max_delete.to_string());
        }

        let output = cmd.output().await?;

        if !output.stdout.is_empty() {
            tracing::debug!(
                "child stdout for {}/{}: {}",
                run.test_name,
                step.name,
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }
        if !output.stderr.is_empty() {
            tracing::debug!(
                "child stderr for {}/{}: {}",
                run.test_name,
                step.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // Record whatever the child managed to emit, even on failure.
        let stream = tokio::fs::read_to_string(output_file.path())
            .await
            .unwrap_or_default();
        self.record_points(
            &run.test_name,
            &run.bucket,
            &declared_size_label(step),
            points::parse_lines(&stream),
        );

        if !output.status.success() {
            return Err(StepError::ChildFailed {
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

fn millis(value: f64) -> Duration {
    if value > 0.0 {
        Duration::from_secs_f64(value / 1000.0)
    } else {
        Duration::ZERO
    }
}
