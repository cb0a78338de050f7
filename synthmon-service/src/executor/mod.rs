//! Executor abstraction.
//!
//! Every backend satisfies the same contract: run one [`Test`] as an ordered
//! sequence of steps, sharing a single generated object key and bucket
//! across the run. The orchestration (run identifiers, bucket resolution,
//! step jitter, deadlines, metric recording, abort-on-failure) is provided
//! here; backends implement the per-step operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use rand::RngCore;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ExecutorKind, Test, TestStep, DEFAULT_FILE_SIZE};
use crate::error::{RunError, StepError};
use crate::jitter;
use crate::metrics::Collector;
use crate::runid::RunId;
use crate::signer;

mod curl_http;
mod native;
mod raw_http;
mod sdk_http;

pub use curl_http::CurlHttpExecutor;
pub use native::{NativeConfig, NativeExecutor};
pub use raw_http::RawHttpExecutor;
pub use sdk_http::SdkHttpExecutor;

/// Executors resolvable by their declared kind.
pub type ExecutorRegistry = HashMap<ExecutorKind, Arc<dyn TestExecutor>>;

/// Connection settings shared by the S3-capable executors.
#[derive(Debug, Clone)]
pub struct S3Options {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Default bucket, used when a test declares no override.
    pub bucket: String,
}

impl S3Options {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty() {
            anyhow::bail!("S3 endpoint is required");
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            anyhow::bail!("S3 access key and secret key are required");
        }
        Ok(())
    }

    pub(crate) fn credentials(&self) -> signer::Credentials {
        signer::Credentials {
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
        }
    }
}

/// Everything a step needs to know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub test_name: String,
    pub bucket: String,
    /// Object key shared by all steps of this run.
    pub object_key: String,
    pub run_id: RunId,
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Stable name used for the `executor` metric label.
    fn name(&self) -> &'static str;

    fn collector(&self) -> &Collector;

    /// Bucket used when the test declares no override.
    fn default_bucket(&self) -> &str;

    /// Preflight run once before any step; the S3 backends ensure the
    /// target bucket here.
    async fn prepare_run(&self, run: &RunContext) -> Result<(), RunError> {
        let _ = run;
        Ok(())
    }

    /// Performs a single step. The deadline and cancellation are enforced
    /// by the caller.
    async fn run_step(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError>;

    /// Runs all steps of `test` in order, aborting on the first failure.
    async fn run_test(
        &self,
        shutdown: &CancellationToken,
        test: &Test,
    ) -> Result<(), RunError> {
        let executor = self.name();
        let collector = self.collector();
        let test_start = Instant::now();

        let run_id = RunId::generate();
        let run = RunContext {
            test_name: test.name.clone(),
            bucket: test.resolve_bucket(self.default_bucket()).to_owned(),
            object_key: test.object_key(&run_id.to_string()),
            run_id,
            shutdown: shutdown.clone(),
        };

        tracing::info!(
            "running test {} (executor: {executor}, run: {}, key: {}, bucket: {})",
            test.name,
            run.run_id,
            run.object_key,
            run.bucket,
        );

        if let Err(err) = self.prepare_run(&run).await {
            collector.record_test_run(&test.name, "", executor, false, test_start.elapsed());
            return Err(err);
        }

        let total = test.steps.len();
        for (index, step) in test.steps.iter().enumerate() {
            if total > 1 {
                tracing::info!("  [{}/{total}] running: {}", index + 1, step.name);
            }

            let step_start = Instant::now();
            let step_timeout = step.timeout();
            let result: Result<(), StepError> = async {
                if let Some(cfg) = &step.jitter {
                    if cfg.is_enabled() {
                        // Steps only use the duration form of `max`.
                        let max = cfg.max_jitter(None).unwrap_or_default();
                        let label = format!("step {}/{}", test.name, step.name);
                        jitter::apply(shutdown, max, &label).await?;
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => Err(StepError::Interrupted),
                    outcome = tokio::time::timeout(step_timeout, self.run_step(&run, step)) => {
                        match outcome {
                            Ok(inner) => inner,
                            Err(_) => Err(StepError::Timeout(step_timeout)),
                        }
                    }
                }
            }
            .await;

            let step_duration = step_start.elapsed();
            match result {
                Ok(()) => {
                    collector.record_test_run(
                        &test.name,
                        &step.name,
                        executor,
                        true,
                        step_duration,
                    );
                    if total > 1 {
                        tracing::info!("  [{}/{total}] completed: {}", index + 1, step.name);
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        "test {} failed at step {}: {source}",
                        test.name,
                        step.name
                    );
                    collector.record_test_run(
                        &test.name,
                        &step.name,
                        executor,
                        false,
                        step_duration,
                    );
                    collector.record_test_run(
                        &test.name,
                        "",
                        executor,
                        false,
                        test_start.elapsed(),
                    );
                    return Err(RunError::Step {
                        step: step.name.clone(),
                        source,
                    });
                }
            }
        }

        let duration = test_start.elapsed();
        tracing::info!("test {} completed successfully in {duration:?}", test.name);
        collector.record_test_run(&test.name, "", executor, true, duration);
        Ok(())
    }
}

/// Payload size and canonical label for an upload step.
pub(crate) fn upload_size(step: &TestStep) -> (u64, String) {
    match step.file_size {
        Some(size) => (size.bytes(), size.label()),
        None => (DEFAULT_FILE_SIZE.bytes(), DEFAULT_FILE_SIZE.label()),
    }
}

/// The declared size label, or empty when none was declared.
pub(crate) fn declared_size_label(step: &TestStep) -> String {
    step.file_size.map(|s| s.label()).unwrap_or_default()
}

pub(crate) fn random_payload(size: u64) -> Vec<u8> {
    let mut data = vec![0u8; size as usize];
    rand::rng().fill_bytes(&mut data);
    data
}

/// Query string for a bucket listing, optionally filtered by prefix.
pub(crate) fn list_query(prefix: Option<&str>) -> String {
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!(
            "list-type=2&prefix={}",
            utf8_percent_encode(prefix, NON_ALPHANUMERIC)
        ),
        None => "list-type=2".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::JitterConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted backend recording the step sequence it was asked to run.
    struct ScriptedExecutor {
        collector: Collector,
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        fail_prepare: bool,
    }

    impl ScriptedExecutor {
        fn new(fail_on: Option<&'static str>) -> Self {
            ScriptedExecutor {
                collector: Collector::new().unwrap(),
                calls: Mutex::new(Vec::new()),
                fail_on,
                fail_prepare: false,
            }
        }
    }

    #[async_trait]
    impl TestExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn collector(&self) -> &Collector {
            &self.collector
        }

        fn default_bucket(&self) -> &str {
            "global-bucket"
        }

        async fn prepare_run(&self, run: &RunContext) -> Result<(), RunError> {
            if self.fail_prepare {
                return Err(RunError::Bucket {
                    bucket: run.bucket.clone(),
                    source: StepError::UnexpectedStatus { status: 403 },
                });
            }
            Ok(())
        }

        async fn run_step(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
            step.action()?;
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", step.name, run.object_key));
            if Some(step.name.as_str()) == self.fail_on {
                return Err(StepError::UnexpectedStatus { status: 500 });
            }
            Ok(())
        }
    }

    fn three_step_test() -> Test {
        Test {
            name: "t1".into(),
            schedule: "*/5 * * * *".into(),
            enabled: true,
            executor: ExecutorKind::RawHttp,
            bucket: None,
            filename: None,
            jitter: None,
            steps: ["upload", "download", "delete"]
                .into_iter()
                .map(|name| TestStep {
                    name: name.into(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn run_count(c: &Collector, step: &str, status: &str) -> u64 {
        c.test_runs_total
            .with_label_values(&["t1", step, "scripted", status])
            .get()
    }

    #[tokio::test]
    async fn steps_run_in_order_and_share_one_key() {
        let exec = ScriptedExecutor::new(None);
        let token = CancellationToken::new();

        exec.run_test(&token, &three_step_test()).await.unwrap();

        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        let key = calls[0].split_once(':').unwrap().1.to_owned();
        assert!(key.starts_with("t1-") && key.ends_with(".bin"));
        assert_eq!(calls[0], format!("upload:{key}"));
        assert_eq!(calls[1], format!("download:{key}"));
        assert_eq!(calls[2], format!("delete:{key}"));

        // Exactly one record per step plus one for the whole run.
        for step in ["upload", "download", "delete", ""] {
            assert_eq!(run_count(&exec.collector, step, "success"), 1);
            assert_eq!(run_count(&exec.collector, step, "failure"), 0);
        }
    }

    #[tokio::test]
    async fn keys_differ_across_runs() {
        let exec = ScriptedExecutor::new(None);
        let token = CancellationToken::new();
        let test = three_step_test();

        exec.run_test(&token, &test).await.unwrap();
        exec.run_test(&token, &test).await.unwrap();

        let calls = exec.calls.lock().unwrap().clone();
        assert_ne!(calls[0], calls[3]);
    }

    #[tokio::test]
    async fn step_failure_aborts_the_run() {
        let exec = ScriptedExecutor::new(Some("download"));
        let token = CancellationToken::new();

        let err = exec.run_test(&token, &three_step_test()).await.unwrap_err();
        assert!(matches!(err, RunError::Step { ref step, .. } if step == "download"));

        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2, "delete must not run after a failed download");

        assert_eq!(run_count(&exec.collector, "upload", "success"), 1);
        assert_eq!(run_count(&exec.collector, "download", "failure"), 1);
        assert_eq!(run_count(&exec.collector, "delete", "success"), 0);
        assert_eq!(run_count(&exec.collector, "delete", "failure"), 0);
        assert_eq!(run_count(&exec.collector, "", "failure"), 1);
    }

    #[tokio::test]
    async fn unknown_step_names_fail_immediately() {
        let exec = ScriptedExecutor::new(None);
        let token = CancellationToken::new();

        let mut test = three_step_test();
        test.steps[0].name = "defragment".into();

        let err = exec.run_test(&token, &test).await.unwrap_err();
        let RunError::Step { source, .. } = err else {
            panic!("expected step error");
        };
        assert!(matches!(source, StepError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn bucket_override_reaches_the_steps() {
        let exec = ScriptedExecutor::new(None);
        let token = CancellationToken::new();

        let mut test = three_step_test();
        test.bucket = Some("special".into());
        test.filename = Some("pinned.bin".into());
        test.steps.truncate(1);

        exec.run_test(&token, &test).await.unwrap();
        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["upload:pinned.bin"]);
    }

    #[tokio::test]
    async fn prepare_failure_skips_all_steps() {
        let mut exec = ScriptedExecutor::new(None);
        exec.fail_prepare = true;
        let token = CancellationToken::new();

        let err = exec.run_test(&token, &three_step_test()).await.unwrap_err();
        assert!(matches!(err, RunError::Bucket { .. }));
        assert!(exec.calls.lock().unwrap().is_empty());
        assert_eq!(run_count(&exec.collector, "", "failure"), 1);
    }

    #[tokio::test]
    async fn cancelled_step_jitter_fails_the_run_without_running_the_step() {
        let exec = ScriptedExecutor::new(None);
        let token = CancellationToken::new();
        token.cancel();

        let mut test = three_step_test();
        test.steps[0].jitter = Some(JitterConfig {
            enabled: Some(true),
            max: Some("30s".into()),
        });

        let err = exec.run_test(&token, &test).await.unwrap_err();
        let RunError::Step { source, .. } = err else {
            panic!("expected step error");
        };
        assert!(matches!(source, StepError::Interrupted));
        assert!(exec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn upload_size_defaults_to_one_mebibyte() {
        let step = TestStep {
            name: "upload".into(),
            ..Default::default()
        };
        let (size, label) = upload_size(&step);
        assert_eq!(size, 1024 * 1024);
        assert_eq!(label, "1MB");
    }

    #[test]
    fn list_query_encodes_the_prefix() {
        assert_eq!(list_query(None), "list-type=2");
        assert_eq!(list_query(Some("")), "list-type=2");
        assert_eq!(
            list_query(Some("logs/2024")),
            "list-type=2&prefix=logs%2F2024"
        );
    }

    #[tokio::test]
    async fn step_timeout_is_enforced() {
        struct SlowExecutor {
            collector: Collector,
        }

        #[async_trait]
        impl TestExecutor for SlowExecutor {
            fn name(&self) -> &'static str {
                "slow"
            }
            fn collector(&self) -> &Collector {
                &self.collector
            }
            fn default_bucket(&self) -> &str {
                "bkt"
            }
            async fn run_step(
                &self,
                _run: &RunContext,
                _step: &TestStep,
            ) -> Result<(), StepError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        tokio::time::pause();
        let exec = SlowExecutor {
            collector: Collector::new().unwrap(),
        };
        let token = CancellationToken::new();

        let mut test = three_step_test();
        test.steps.truncate(1);
        test.steps[0].timeout = Some("1s".into());

        let err = exec.run_test(&token, &test).await.unwrap_err();
        let RunError::Step { source, .. } = err else {
            panic!("expected step error");
        };
        assert!(matches!(source, StepError::Timeout(_)));
    }
}
