//! Cron-driven fan-out of scheduled tests into their executors.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::catalog::{JitterConfig, Test};
use crate::executor::{ExecutorRegistry, TestExecutor};
use crate::jitter;

struct Entry {
    test: Arc<Test>,
    executor: Arc<dyn TestExecutor>,
    schedule: Schedule,
    max_jitter: Duration,
}

/// Owns the cron table and the lifecycle of all firing loops.
pub struct Scheduler {
    entries: Vec<Entry>,
    /// Every test, including disabled ones, for on-demand invocation.
    catalog: Vec<Arc<Test>>,
    executors: ExecutorRegistry,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Builds the schedule table. Disabled tests and tests whose declared
    /// executor has no registered backend are skipped with a warning;
    /// unparseable cron expressions and jitter settings are errors.
    pub fn new(
        tests: &[Test],
        executors: ExecutorRegistry,
        global_jitter: &JitterConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        let mut catalog = Vec::new();

        for test in tests {
            let test = Arc::new(test.clone());
            catalog.push(Arc::clone(&test));

            if !test.enabled {
                tracing::info!("skipping disabled test: {}", test.name);
                continue;
            }
            let Some(executor) = executors.get(&test.executor) else {
                tracing::warn!(
                    "skipping test {}: no backend registered for executor `{}`",
                    test.name,
                    test.executor
                );
                continue;
            };

            let schedule = parse_schedule(&test.schedule)
                .with_context(|| format!("test {}", test.name))?;

            let effective = test.effective_jitter(global_jitter);
            let max_jitter = if effective.is_enabled() {
                let interval = estimate_cron_interval(&test.schedule).ok();
                effective
                    .max_jitter(interval)
                    .with_context(|| format!("invalid jitter for test {}", test.name))?
            } else {
                Duration::ZERO
            };

            if max_jitter.is_zero() {
                tracing::info!(
                    "scheduled test: {} (executor: {}, schedule: {})",
                    test.name,
                    test.executor,
                    test.schedule
                );
            } else {
                tracing::info!(
                    "scheduled test: {} (executor: {}, schedule: {}, jitter: max {max_jitter:?})",
                    test.name,
                    test.executor,
                    test.schedule
                );
            }

            entries.push(Entry {
                test,
                executor: Arc::clone(executor),
                schedule,
                max_jitter,
            });
        }

        if entries.is_empty() {
            tracing::warn!("no tests enabled in configuration");
        } else {
            tracing::info!("scheduled {} test(s)", entries.len());
        }

        Ok(Scheduler {
            entries,
            catalog,
            executors,
            tracker: TaskTracker::new(),
            shutdown,
        })
    }

    pub fn scheduled_count(&self) -> usize {
        self.entries.len()
    }

    /// Spawns one firing loop per scheduled test.
    pub fn start(&self) {
        for entry in &self.entries {
            let test = Arc::clone(&entry.test);
            let executor = Arc::clone(&entry.executor);
            let schedule = entry.schedule.clone();
            let max_jitter = entry.max_jitter;
            let shutdown = self.shutdown.clone();
            let tracker = self.tracker.clone();

            self.tracker.spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }

                    // Each firing is its own task, so runs of a slow test may
                    // overlap when the interval is shorter than the run.
                    let test = Arc::clone(&test);
                    let executor = Arc::clone(&executor);
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        if !max_jitter.is_zero() {
                            let label = format!("test {}", test.name);
                            if jitter::apply(&shutdown, max_jitter, &label).await.is_err() {
                                tracing::debug!("test {} jitter interrupted", test.name);
                                return;
                            }
                        }
                        tracing::info!(
                            "scheduled execution: {} (executor: {})",
                            test.name,
                            executor.name()
                        );
                        if let Err(err) = executor.run_test(&shutdown, &test).await {
                            tracing::warn!("test {} failed: {err}", test.name);
                        }
                    });
                }
            });
        }
        tracing::info!("scheduler started");
    }

    /// Runs one test immediately, bypassing its schedule and jitter.
    pub async fn run_now(&self, name: &str) -> Result<()> {
        let test = self
            .catalog
            .iter()
            .find(|test| test.name == name)
            .with_context(|| format!("test not found: {name}"))?;
        let executor = self.executors.get(&test.executor).with_context(|| {
            format!(
                "no backend registered for executor `{}` of test {name}",
                test.executor
            )
        })?;

        tracing::info!("running test on demand: {name} (executor: {})", executor.name());
        executor
            .run_test(&self.shutdown, test)
            .await
            .map_err(Into::into)
    }

    /// Stops accepting new firings and waits for in-flight runs, bounded by
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("scheduler grace period elapsed with runs still in flight");
        } else {
            tracing::info!("scheduler stopped");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.entries.len())
            .field("catalog", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

/// The cron engine wants a seconds field; standard five-field expressions
/// get a literal `0` prepended.
pub fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron(expr))
        .with_context(|| format!("invalid cron expression `{expr}`"))
}

/// Estimates the interval between firings of the common cron shapes; only
/// used to resolve percentage jitter. Shapes outside the table fall back to
/// one minute.
pub fn estimate_cron_interval(expr: &str) -> Result<Duration> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() < 5 {
        bail!("invalid cron schedule: {expr}");
    }
    let (minute, hour) = (parts[0], parts[1]);

    if let Some(n) = minute.strip_prefix("*/").and_then(|n| n.parse::<u64>().ok()) {
        if n > 0 {
            return Ok(Duration::from_secs(n * 60));
        }
    }
    if minute == "0" {
        if let Some(n) = hour.strip_prefix("*/").and_then(|n| n.parse::<u64>().ok()) {
            if n > 0 {
                return Ok(Duration::from_secs(n * 3600));
            }
        }
    }
    if minute.parse::<u64>().is_ok() {
        if hour == "*" {
            return Ok(Duration::from_secs(3600));
        }
        if hour.parse::<u64>().is_ok() {
            return Ok(Duration::from_secs(24 * 3600));
        }
    }

    Ok(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExecutorKind, TestStep};
    use crate::error::{RunError, StepError};
    use crate::executor::RunContext;
    use crate::metrics::Collector;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        collector: Collector,
        runs: AtomicUsize,
        hang: bool,
    }

    impl CountingExecutor {
        fn new(hang: bool) -> Arc<Self> {
            Arc::new(CountingExecutor {
                collector: Collector::new().unwrap(),
                runs: AtomicUsize::new(0),
                hang,
            })
        }
    }

    #[async_trait]
    impl TestExecutor for CountingExecutor {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn collector(&self) -> &Collector {
            &self.collector
        }
        fn default_bucket(&self) -> &str {
            "bkt"
        }
        async fn run_step(&self, _run: &RunContext, _step: &TestStep) -> Result<(), StepError> {
            Ok(())
        }
        async fn run_test(
            &self,
            shutdown: &CancellationToken,
            _test: &Test,
        ) -> Result<(), RunError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                shutdown.cancelled().await;
            }
            Ok(())
        }
    }

    fn test(name: &str, schedule: &str, enabled: bool, kind: ExecutorKind) -> Test {
        Test {
            name: name.into(),
            schedule: schedule.into(),
            enabled,
            executor: kind,
            bucket: None,
            filename: None,
            jitter: None,
            steps: vec![TestStep {
                name: "upload".into(),
                ..Default::default()
            }],
        }
    }

    fn registry(exec: Arc<CountingExecutor>) -> ExecutorRegistry {
        let mut map: ExecutorRegistry = HashMap::new();
        map.insert(ExecutorKind::Native, exec);
        map
    }

    #[test]
    fn interval_estimation_table() {
        assert_eq!(
            estimate_cron_interval("*/5 * * * *").unwrap(),
            Duration::from_secs(5 * 60)
        );
        assert_eq!(
            estimate_cron_interval("0 */2 * * *").unwrap(),
            Duration::from_secs(2 * 3600)
        );
        assert_eq!(
            estimate_cron_interval("30 * * * *").unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            estimate_cron_interval("0 0 * * *").unwrap(),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            estimate_cron_interval("* * * * *").unwrap(),
            Duration::from_secs(60)
        );
        assert!(estimate_cron_interval("* * *").is_err());
    }

    #[test]
    fn five_field_expressions_are_normalized() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[tokio::test]
    async fn disabled_and_backendless_tests_are_skipped() {
        let exec = CountingExecutor::new(false);
        let tests = [
            test("enabled", "*/5 * * * *", true, ExecutorKind::Native),
            test("disabled", "*/5 * * * *", false, ExecutorKind::Native),
            test("no-backend", "*/5 * * * *", true, ExecutorKind::RawHttp),
        ];

        let scheduler = Scheduler::new(
            &tests,
            registry(exec),
            &JitterConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(scheduler.scheduled_count(), 1);
    }

    #[tokio::test]
    async fn bad_cron_expressions_fail_construction() {
        let exec = CountingExecutor::new(false);
        let tests = [test("bad", "every now and then", true, ExecutorKind::Native)];

        let result = Scheduler::new(
            &tests,
            registry(exec),
            &JitterConfig::default(),
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn percentage_jitter_resolves_against_the_interval() {
        let exec = CountingExecutor::new(false);
        let mut scheduled = test("jittered", "*/10 * * * *", true, ExecutorKind::Native);
        scheduled.jitter = Some(JitterConfig {
            enabled: Some(true),
            max: Some("10%".into()),
        });

        let scheduler = Scheduler::new(
            &[scheduled],
            registry(exec),
            &JitterConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(scheduler.entries[0].max_jitter, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn run_now_bypasses_the_schedule() {
        let exec = CountingExecutor::new(false);
        // Disabled tests can still be invoked on demand.
        let tests = [test("on-demand", "0 0 1 1 *", false, ExecutorKind::Native)];

        let scheduler = Scheduler::new(
            &tests,
            registry(Arc::clone(&exec)),
            &JitterConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();

        scheduler.run_now("on-demand").await.unwrap();
        assert_eq!(exec.runs.load(Ordering::SeqCst), 1);

        assert!(scheduler.run_now("missing").await.is_err());
    }

    #[tokio::test]
    async fn firing_loop_runs_the_test() {
        let exec = CountingExecutor::new(false);
        // Six-field form: fires every second.
        let tests = [test("ticker", "* * * * * *", true, ExecutorKind::Native)];

        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            &tests,
            registry(Arc::clone(&exec)),
            &JitterConfig::default(),
            token.clone(),
        )
        .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown(Duration::from_secs(5)).await;

        assert!(exec.runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn shutdown_wait_is_bounded() {
        let exec = CountingExecutor::new(true);
        let tests = [test("hanger", "* * * * * *", true, ExecutorKind::Native)];

        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            &tests,
            registry(exec),
            &JitterConfig::default(),
            token,
        )
        .unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let start = std::time::Instant::now();
        scheduler.shutdown(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
