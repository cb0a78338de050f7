//! Executor that shells out to a `curl` binary for the HTTP exchange.
//!
//! The signer produces header values which are handed to the child as
//! explicit `-H` flags; timing comes from curl's write-out report. Upload
//! bodies are staged in temporary files the child reads, downloads land in a
//! temporary file whose final size is the observed byte count.

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Method, Request};
use tokio::process::Command;

use super::{
    declared_size_label, list_query, random_payload, upload_size, RunContext, S3Options,
    TestExecutor,
};
use crate::catalog::{Action, TestStep, DEFAULT_STEP_TIMEOUT};
use crate::error::{RunError, StepError};
use crate::metrics::Collector;
use crate::signer::Signer;
use crate::trace::HttpTimings;

/// curl write-out format:
/// `status|dns|connect|appconnect|starttransfer|total`, cumulative seconds.
const WRITE_FORMAT: &str =
    "%{http_code}|%{time_namelookup}|%{time_connect}|%{time_appconnect}|%{time_starttransfer}|%{time_total}";

pub struct CurlHttpExecutor {
    curl_path: PathBuf,
    endpoint: String,
    signer: Signer,
    default_bucket: String,
    collector: Arc<Collector>,
}

impl CurlHttpExecutor {
    pub fn new(options: S3Options, collector: Arc<Collector>) -> anyhow::Result<Self> {
        options.validate()?;
        let curl_path =
            find_in_path("curl").ok_or_else(|| anyhow::anyhow!("curl not found in PATH"))?;

        Ok(CurlHttpExecutor {
            curl_path,
            signer: Signer::new(options.credentials()),
            endpoint: options.endpoint.trim_end_matches('/').to_owned(),
            default_bucket: options.bucket,
            collector,
        })
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/{bucket}", self.endpoint)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }

    /// Signs a request shape and renders its headers as `-H` flag values.
    fn sign_headers(
        &self,
        method: Method,
        url: &str,
        content_length: Option<u64>,
    ) -> Result<(Vec<String>, Duration), StepError> {
        let mut builder = Request::builder().method(method).uri(url);
        if content_length.is_some() {
            builder = builder.header("content-type", "application/octet-stream");
        }
        let mut req = builder
            .body(())
            .map_err(|err| StepError::MalformedReport(err.to_string()))?;

        let sign_start = Instant::now();
        self.signer.sign(&mut req)?;
        let sign_duration = sign_start.elapsed();

        let headers = req
            .headers()
            .iter()
            .map(|(name, value)| {
                format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
            })
            .collect();
        Ok((headers, sign_duration))
    }

    async fn run_curl(&self, args: Vec<String>) -> Result<Output, StepError> {
        Ok(Command::new(&self.curl_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?)
    }

    /// Runs curl expecting a bare `%{http_code}` write-out.
    async fn status_probe(
        &self,
        method: Method,
        url: &str,
    ) -> Result<String, StepError> {
        let (headers, _) = self.sign_headers(method.clone(), url, None)?;
        let mut args = vec!["-s".to_owned(), "-S".to_owned()];
        if method == Method::HEAD {
            args.push("-I".to_owned());
        } else {
            args.push("-X".to_owned());
            args.push(method.to_string());
        }
        args.extend(["-o".to_owned(), "/dev/null".to_owned()]);
        args.extend(["-w".to_owned(), "%{http_code}".to_owned()]);
        for header in headers {
            args.push("-H".to_owned());
            args.push(header);
        }
        args.push(url.to_owned());

        let output = self.run_curl(args).await?;
        if !output.status.success() {
            return Err(StepError::ChildFailed {
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// HEAD, then PUT (409 is benign), then HEAD again via the child.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StepError> {
        let url = self.bucket_url(bucket);

        if let Ok(status) = self.status_probe(Method::HEAD, &url).await {
            if status == "200" {
                return Ok(());
            }
        }

        match self.status_probe(Method::PUT, &url).await?.as_str() {
            "200" | "201" => tracing::info!("created bucket: {bucket}"),
            "409" => {}
            status => tracing::debug!(
                "create bucket returned status {status} (may be ignorable if the bucket exists)"
            ),
        }

        let verify = self.status_probe(Method::HEAD, &url).await?;
        if verify != "200" {
            return Err(StepError::UnexpectedStatus {
                status: verify.parse().unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Runs curl with the timing write-out and parses its report.
    async fn timed_exchange(
        &self,
        mut args: Vec<String>,
        headers: Vec<String>,
        url: &str,
    ) -> Result<(u16, HttpTimings), StepError> {
        for header in headers {
            args.push("-H".to_owned());
            args.push(header);
        }
        args.push(url.to_owned());

        let output = self.run_curl(args).await?;
        if !output.status.success() {
            return Err(StepError::ChildFailed {
                status: output.status.code().unwrap_or(-1),
            });
        }
        parse_timing_report(&String::from_utf8_lossy(&output.stdout))
    }

    async fn upload(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let (size, label) = upload_size(step);

        let mut body_file = tempfile::Builder::new()
            .prefix("curl-upload-")
            .tempfile()?;
        std::io::Write::write_all(&mut body_file, &random_payload(size))?;

        let url = self.object_url(&run.bucket, &run.object_key);
        let (mut headers, sign) = self.sign_headers(Method::PUT, &url, Some(size))?;
        if let Some(ttl) = step.ttl() {
            headers.push(format!("x-amz-meta-ttl-seconds: {ttl}"));
        }

        let args = vec![
            "-s".to_owned(),
            "-S".to_owned(),
            "-X".to_owned(),
            "PUT".to_owned(),
            "--data-binary".to_owned(),
            format!("@{}", body_file.path().display()),
            "-w".to_owned(),
            WRITE_FORMAT.to_owned(),
            "-o".to_owned(),
            "/dev/null".to_owned(),
        ];

        let record_failure = |duration: Duration| {
            self.collector.record_upload(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                duration,
                size,
                false,
            );
        };

        let (status, timings) = match self.timed_exchange(args, headers, &url).await {
            Ok(report) => report,
            Err(err) => {
                record_failure(Duration::ZERO);
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Upload, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Upload, self.name(), "sign", sign);

        if !matches!(status, 200 | 201) {
            record_failure(timings.total);
            return Err(StepError::UnexpectedStatus { status });
        }

        tracing::debug!(
            "uploaded {} ({size} bytes) in {:?} (sign={sign:?}, dns={:?}, ttfb={:?})",
            run.object_key,
            timings.total,
            timings.dns,
            timings.ttfb,
        );
        self.collector.record_upload(
            &run.test_name,
            self.name(),
            &run.bucket,
            &label,
            timings.total,
            size,
            true,
        );
        Ok(())
    }

    async fn download(&self, run: &RunContext) -> Result<(), StepError> {
        let url = self.object_url(&run.bucket, &run.object_key);
        let (headers, sign) = self.sign_headers(Method::GET, &url, None)?;

        let target = tempfile::Builder::new()
            .prefix("curl-download-")
            .tempfile()?;

        let args = vec![
            "-s".to_owned(),
            "-S".to_owned(),
            "-X".to_owned(),
            "GET".to_owned(),
            "-o".to_owned(),
            target.path().display().to_string(),
            "-w".to_owned(),
            WRITE_FORMAT.to_owned(),
        ];

        let record_failure = |duration: Duration| {
            self.collector.record_download(
                &run.test_name,
                self.name(),
                &run.bucket,
                "",
                duration,
                0,
                false,
            );
        };

        let (status, timings) = match self.timed_exchange(args, headers, &url).await {
            Ok(report) => report,
            Err(err) => {
                record_failure(Duration::ZERO);
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Download, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Download, self.name(), "sign", sign);

        if status != 200 {
            record_failure(timings.total);
            return Err(StepError::UnexpectedStatus { status });
        }

        let bytes_read = tokio::fs::metadata(target.path()).await?.len();
        tracing::debug!(
            "downloaded {} ({bytes_read} bytes) in {:?} (sign={sign:?}, transfer={:?})",
            run.object_key,
            timings.total,
            timings.transfer,
        );
        self.collector.record_download(
            &run.test_name,
            self.name(),
            &run.bucket,
            "",
            timings.total,
            bytes_read,
            true,
        );
        Ok(())
    }

    async fn delete(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let label = declared_size_label(step);
        let url = self.object_url(&run.bucket, &run.object_key);
        let (headers, sign) = self.sign_headers(Method::DELETE, &url, None)?;

        let args = vec![
            "-s".to_owned(),
            "-S".to_owned(),
            "-X".to_owned(),
            "DELETE".to_owned(),
            "-w".to_owned(),
            WRITE_FORMAT.to_owned(),
            "-o".to_owned(),
            "/dev/null".to_owned(),
        ];

        let record_failure = || {
            self.collector.record_delete(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                Duration::ZERO,
                0,
                false,
            );
        };

        let (status, timings) = match self.timed_exchange(args, headers, &url).await {
            Ok(report) => report,
            Err(err) => {
                record_failure();
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Delete, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Delete, self.name(), "sign", sign);

        if !matches!(status, 200 | 204) {
            record_failure();
            return Err(StepError::UnexpectedStatus { status });
        }

        tracing::debug!("deleted {} in {:?} (sign={sign:?})", run.object_key, timings.total);
        self.collector.record_delete(
            &run.test_name,
            self.name(),
            &run.bucket,
            &label,
            timings.total,
            1,
            true,
        );
        Ok(())
    }

    async fn list(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let url = format!(
            "{}?{}",
            self.bucket_url(&run.bucket),
            list_query(step.file_prefix.as_deref())
        );
        let (headers, sign) = self.sign_headers(Method::GET, &url, None)?;

        let args = vec![
            "-s".to_owned(),
            "-S".to_owned(),
            "-X".to_owned(),
            "GET".to_owned(),
            "-w".to_owned(),
            WRITE_FORMAT.to_owned(),
            "-o".to_owned(),
            "/dev/null".to_owned(),
        ];

        let (status, timings) = match self.timed_exchange(args, headers, &url).await {
            Ok(report) => report,
            Err(err) => {
                self.collector
                    .record_list(&run.test_name, self.name(), &run.bucket, false);
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::List, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::List, self.name(), "sign", sign);

        if status != 200 {
            self.collector
                .record_list(&run.test_name, self.name(), &run.bucket, false);
            return Err(StepError::UnexpectedStatus { status });
        }

        self.collector
            .record_list(&run.test_name, self.name(), &run.bucket, true);
        Ok(())
    }
}

#[async_trait]
impl TestExecutor for CurlHttpExecutor {
    fn name(&self) -> &'static str {
        "subprocess-http"
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

/// Parses `status|dns|connect|appconnect|starttransfer|total` into
/// phase-local timings. The report carries cumulative seconds; adjacent
/// values are subtracted, and a subtraction that would go negative yields
/// zero instead.
fn parse_timing_report(report: &str) -> Result<(u16, HttpTimings), StepError> {
    let report = report.trim();
    let parts: Vec<&str> = report.split('|').collect();
    if parts.len() != 6 {
        return Err(StepError::MalformedReport(format!(
            "unexpected curl output: `{report}`"
        )));
    }

    let status = parts[0]
        .parse::<u16>()
        .map_err(|_| StepError::MalformedReport(format!("bad status `{}`", parts[0])))?;

    let seconds = |raw: &str| raw.trim().parse::<f64>().unwrap_or(0.0);
    let dns = seconds(parts[1]);
    let connect = seconds(parts[2]);
    let appconnect = seconds(parts[3]);
    let starttransfer = seconds(parts[4]);
    let total = seconds(parts[5]);

    let phase = |later: f64, earlier: f64| {
        if later > earlier {
            Duration::from_secs_f64(later - earlier)
        } else {
            Duration::ZERO
        }
    };

    let timings = HttpTimings {
        dns: phase(dns, 0.0),
        tcp_connect: phase(connect, dns),
        tls_handshake: phase(appconnect, connect),
        ttfb: phase(starttransfer, appconnect),
        transfer: phase(total, starttransfer),
        total: phase(total, 0.0),
    };

    Ok((status, timings))
}

/// Locates a binary on `PATH`.
fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    search_paths(&paths, binary)
}

fn search_paths(paths: &std::ffi::OsStr, binary: &str) -> Option<PathBuf> {
    std::env::split_paths(paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
