//! Executor using the `rust-s3` SDK against the configured endpoint.
//!
//! The bucket handle is pinned to the custom endpoint with path-style
//! addressing and static credentials. The SDK does not inject payload
//! checksums on its own, which the target gateways would reject. Only
//! whole-operation durations are observable here; no per-phase HTTP timings
//! are emitted.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use s3::creds::Credentials as S3Credentials;
use s3::{Bucket, BucketConfiguration, Region};

use super::{
    declared_size_label, random_payload, upload_size, RunContext, S3Options, TestExecutor,
};
use crate::catalog::{Action, TestStep, DEFAULT_STEP_TIMEOUT};
use crate::error::{RunError, StepError};
use crate::metrics::Collector;

pub struct SdkHttpExecutor {
    endpoint: String,
    region_name: String,
    credentials: S3Credentials,
    default_bucket: String,
    collector: Arc<Collector>,
}

impl SdkHttpExecutor {
    pub fn new(options: S3Options, collector: Arc<Collector>) -> anyhow::Result<Self> {
        options.validate()?;
        let credentials = S3Credentials::new(
            Some(&options.access_key),
            Some(&options.secret_key),
            None,
            None,
            None,
        )
        .context("failed to build SDK credentials")?;

        Ok(SdkHttpExecutor {
            endpoint: options.endpoint.trim_end_matches('/').to_owned(),
            region_name: options.region,
            credentials,
            default_bucket: options.bucket,
            collector,
        })
    }

    fn region(&self) -> Region {
        Region::Custom {
            region: self.region_name.clone(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Path-style bucket handle pinned to the configured endpoint.
    fn bucket_handle(&self, bucket: &str) -> Result<Box<Bucket>, StepError> {
        Ok(Bucket::new(bucket, self.region(), self.credentials.clone())?.with_path_style())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StepError> {
        let handle = self.bucket_handle(bucket)?;
        if handle.exists().await.unwrap_or(false) {
            return Ok(());
        }

        let created = Bucket::create_with_path_style(
            bucket,
            self.region(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await;
        match created {
            Ok(response) if response.success() => tracing::info!("created bucket: {bucket}"),
            Ok(response) => tracing::debug!(
                "create bucket returned status {} (may be ignorable if the bucket exists)",
                response.response_code
            ),
            Err(err) => tracing::debug!(
                "create bucket returned: {err} (may be ignorable if the bucket exists)"
            ),
        }

        if !handle.exists().await? {
            return Err(StepError::UnexpectedStatus { status: 404 });
        }
        Ok(())
    }

    async fn upload(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let (size, label) = upload_size(step);
        let data = random_payload(size);

        let mut handle = self.bucket_handle(&run.bucket)?;
        if let Some(ttl) = step.ttl() {
            // The gateway does not honour Expires for object deletion; the
            // TTL rides along as metadata and is effective only under the
            // native executor.
            handle.add_header("x-amz-meta-ttl-seconds", &ttl.to_string());
        }

        let start = Instant::now();
        let response = match handle
            .put_object_with_content_type(&run.object_key, &data, "application/octet-stream")
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.collector.record_upload(
                    &run.test_name,
                    self.name(),
                    &run.bucket,
                    &label,
                    start.elapsed(),
                    size,
                    false,
                );
                return Err(err.into());
            }
        };
        let duration = start.elapsed();

        if response.status_code() != 200 {
            self.collector.record_upload(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                duration,
                size,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status_code(),
            });
        }

        tracing::debug!(
            "uploaded {} ({size} bytes) in {duration:?}",
            run.object_key
        );
        self.collector.record_upload(
            &run.test_name,
            self.name(),
            &run.bucket,
            &label,
            duration,
            size,
            true,
        );
        Ok(())
    }

    async fn download(&self, run: &RunContext) -> Result<(), StepError> {
        let handle = self.bucket_handle(&run.bucket)?;

        let start = Instant::now();
        let response = match handle.get_object(&run.object_key).await {
            Ok(response) => response,
            Err(err) => {
                self.collector.record_download(
                    &run.test_name,
                    self.name(),
                    &run.bucket,
                    "",
                    start.elapsed(),
                    0,
                    false,
                );
                return Err(err.into());
            }
        };
        let duration = start.elapsed();

        if response.status_code() != 200 {
            self.collector.record_download(
                &run.test_name,
                self.name(),
                &run.bucket,
                "",
                duration,
                0,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status_code(),
            });
        }

        let bytes_read = response.bytes().len() as u64;
        let expected = response
            .headers()
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(expected) = expected {
            if expected != bytes_read {
                tracing::warn!(
                    "download size mismatch for {}: expected {expected} bytes, got {bytes_read}",
                    run.object_key
                );
            }
        }

        tracing::debug!(
            "downloaded {} ({bytes_read} bytes) in {duration:?}",
            run.object_key
        );
        self.collector.record_download(
            &run.test_name,
            self.name(),
            &run.bucket,
            "",
            duration,
            bytes_read,
            true,
        );
        Ok(())
    }

    async fn delete(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let label = declared_size_label(step);
        let handle = self.bucket_handle(&run.bucket)?;

        let start = Instant::now();
        let response = match handle.delete_object(&run.object_key).await {
            Ok(response) => response,
            Err(err) => {
                self.collector.record_delete(
                    &run.test_name,
                    self.name(),
                    &run.bucket,
                    &label,
                    std::time::Duration::ZERO,
                    0,
                    false,
                );
                return Err(err.into());
            }
        };
        let duration = start.elapsed();

        if !matches!(response.status_code(), 200 | 204) {
            self.collector.record_delete(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                std::time::Duration::ZERO,
                0,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status_code(),
            });
        }

        tracing::debug!("deleted {} in {duration:?}", run.object_key);
        self.collector.record_delete(
            &run.test_name,
            self.name(),
            &run.bucket,
            &label,
            duration,
            1,
            true,
        );
        Ok(())
    }

    async fn list(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let handle = self.bucket_handle(&run.bucket)?;
        let prefix = step.file_prefix.clone().unwrap_or_default();

        let results = match handle.list(prefix, None).await {
            Ok(results) => results,
            Err(err) => {
                self.collector
                    .record_list(&run.test_name, self.name(), &run.bucket, false);
                return Err(err.into());
            }
        };

        let objects: usize = results.iter().map(|page| page.contents.len()).sum();
        tracing::debug!("listed {objects} object(s) in {}", run.bucket);
        self.collector
            .record_list(&run.test_name, self.name(), &run.bucket, true);
        Ok(())
    }
}

#[async_trait]
impl TestExecutor for SdkHttpExecutor {
    fn name(&self) -> &'static str {
        "sdk-http"
    }

    fn collector(&self) -> &Collector {
        &self.collector
    }

    fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    async fn prepare_run(&self, run: &RunContext) -> Result<(), RunError> {
        match tokio::time::timeout(DEFAULT_STEP_TIMEOUT, self.ensure_bucket(&run.bucket)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(RunError::Bucket {
                bucket: run.bucket.clone(),
                source,
            }),
            Err(_) => Err(RunError::Bucket {
                bucket: run.bucket.clone(),
                source: StepError::Timeout(DEFAULT_STEP_TIMEOUT),
            }),
        }
    }

    async fn run_step(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        match step.action()? {
            Action::Upload => self.upload(run, step).await,
            Action::Download => self.download(run).await,
            Action::Delete => self.delete(run, step).await,
            Action::List => self.list(run, step).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ByteSize, ExecutorKind, Test};
    use tokio_util::sync::CancellationToken;

    fn options(endpoint: &str) -> S3Options {
        S3Options {
            endpoint: endpoint.into(),
            access_key: "test-key".into(),
            secret_key: "test-secret".into(),
            region: "us-east-1".into(),
            bucket: "test-bucket".into(),
        }
    }

    #[test]
    fn constructor_validates_settings() {
        let collector = Arc::new(Collector::new().unwrap());
        assert!(SdkHttpExecutor::new(options("http://localhost:9000"), collector.clone()).is_ok());

        let mut missing_endpoint = options("");
        missing_endpoint.endpoint.clear();
        assert!(SdkHttpExecutor::new(missing_endpoint, collector.clone()).is_err());

        let mut missing_key = options("http://localhost:9000");
        missing_key.access_key.clear();
        assert!(SdkHttpExecutor::new(missing_key, collector).is_err());
    }

    #[test]
    fn bucket_handles_pin_the_custom_endpoint() {
        let exec = SdkHttpExecutor::new(
            options("http://localhost:9000/"),
            Arc::new(Collector::new().unwrap()),
        )
        .unwrap();

        let handle = exec.bucket_handle("bkt").unwrap();
        assert_eq!(handle.name(), "bkt");
        assert!(exec.endpoint.ends_with("9000"), "trailing slash trimmed");
    }

    // The round-trip tests need an S3 emulator listening on localhost:9000;
    // CI brings one up before running them.

    fn emulator_test(step: TestStep) -> (SdkHttpExecutor, Test) {
        let exec = SdkHttpExecutor::new(
            options("http://localhost:9000"),
            Arc::new(Collector::new().unwrap()),
        )
        .unwrap();
        let test = Test {
            name: "sdk-smoke".into(),
            schedule: "*/5 * * * *".into(),
            enabled: true,
            executor: ExecutorKind::SdkHttp,
            bucket: None,
            filename: None,
            jitter: None,
            steps: vec![step],
        };
        (exec, test)
    }

    #[tokio::test]
    #[ignore = "requires a running S3 emulator on localhost:9000"]
    async fn upload_download_delete_round_trip() {
        let (exec, mut test) = emulator_test(TestStep {
            name: "upload".into(),
            file_size: Some(ByteSize::new(64 * 1024)),
            ..Default::default()
        });
        test.steps.push(TestStep {
            name: "download".into(),
            ..Default::default()
        });
        test.steps.push(TestStep {
            name: "delete".into(),
            ..Default::default()
        });

        exec.run_test(&CancellationToken::new(), &test).await.unwrap();

        let c = &exec.collector;
        assert_eq!(
            c.op_bytes
                .with_label_values(&["sdk-smoke", "upload", "sdk-http", "test-bucket"])
                .get(),
            (64 * 1024) as f64
        );
        assert_eq!(
            c.op_bytes
                .with_label_values(&["sdk-smoke", "download", "sdk-http", "test-bucket"])
                .get(),
            (64 * 1024) as f64
        );
    }

    #[tokio::test]
    #[ignore = "requires a running S3 emulator on localhost:9000"]
    async fn download_of_missing_object_fails_the_run() {
        let (exec, test) = emulator_test(TestStep {
            name: "download".into(),
            ..Default::default()
        });

        let err = exec
            .run_test(&CancellationToken::new(), &test)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Step { .. }));
    }
}
