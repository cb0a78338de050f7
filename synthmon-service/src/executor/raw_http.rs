//! Executor performing object operations over direct HTTP.
//!
//! Requests are signed in-process and executed over the wire-level client so
//! that every connection phase is measured. Addressing is path-style:
//! `<endpoint>/<bucket>/<key>`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request};

use super::{
    declared_size_label, list_query, random_payload, upload_size, RunContext, S3Options,
    TestExecutor,
};
use crate::catalog::{Action, TestStep, DEFAULT_STEP_TIMEOUT};
use crate::error::{RunError, StepError, WireError};
use crate::metrics::Collector;
use crate::signer::Signer;
use crate::trace::{HttpTimings, TimingTracer};
use crate::wire::{WireClient, WireResponse};

pub struct RawHttpExecutor {
    endpoint: String,
    signer: Signer,
    client: WireClient,
    default_bucket: String,
    collector: Arc<Collector>,
}

impl RawHttpExecutor {
    pub fn new(options: S3Options, collector: Arc<Collector>) -> anyhow::Result<Self> {
        options.validate()?;
        Ok(RawHttpExecutor {
            signer: Signer::new(options.credentials()),
            client: WireClient::new(),
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

    fn build_request(
        &self,
        method: Method,
        url: &str,
        body: Bytes,
    ) -> Result<Request<Bytes>, StepError> {
        Request::builder()
            .method(method)
            .uri(url)
            .body(body)
            .map_err(|err| StepError::Transport(WireError::BadUrl(err.to_string())))
    }

    /// Signs and executes one exchange. The sign phase is measured
    /// separately from the wire phases.
    async fn exchange(
        &self,
        mut req: Request<Bytes>,
    ) -> Result<(WireResponse, HttpTimings, Duration), StepError> {
        let sign_start = Instant::now();
        self.signer.sign(&mut req)?;
        let sign_duration = sign_start.elapsed();

        let mut tracer = TimingTracer::start();
        let response = self.client.execute(&req, &mut tracer).await?;
        let timings = tracer.finish(Instant::now());

        Ok((response, timings, sign_duration))
    }

    /// Signed request without body or timing concerns (bucket-ensure).
    async fn simple(&self, method: Method, url: &str) -> Result<WireResponse, StepError> {
        let mut req = self.build_request(method, url, Bytes::new())?;
        self.signer.sign(&mut req)?;
        let mut tracer = TimingTracer::start();
        Ok(self.client.execute(&req, &mut tracer).await?)
    }

    /// HEAD, then PUT (409 is a benign race), then HEAD again. Anything but
    /// a final 200 is fatal for the run.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StepError> {
        let url = self.bucket_url(bucket);

        if let Ok(head) = self.simple(Method::HEAD, &url).await {
            if head.status == 200 {
                return Ok(());
            }
        }

        let put = self.simple(Method::PUT, &url).await?;
        match put.status {
            200 | 201 => tracing::info!("created bucket: {bucket}"),
            409 => {}
            status => tracing::debug!(
                "create bucket returned status {status} (may be ignorable if the bucket exists)"
            ),
        }

        let verify = self.simple(Method::HEAD, &url).await?;
        if verify.status != 200 {
            return Err(StepError::UnexpectedStatus {
                status: verify.status,
            });
        }
        Ok(())
    }

    async fn upload(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let (size, label) = upload_size(step);
        let url = self.object_url(&run.bucket, &run.object_key);

        let mut req =
            self.build_request(Method::PUT, &url, Bytes::from(random_payload(size)))?;
        req.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        req.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(size));
        if let Some(ttl) = step.ttl() {
            req.headers_mut()
                .insert("x-amz-meta-ttl-seconds", HeaderValue::from(ttl));
        }

        let start = Instant::now();
        let (response, timings, sign) = match self.exchange(req).await {
            Ok(exchange) => exchange,
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
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Upload, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Upload, self.name(), "sign", sign);

        if !matches!(response.status, 200 | 201) {
            self.collector.record_upload(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                timings.total,
                size,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status,
            });
        }

        tracing::debug!(
            "uploaded {} ({size} bytes) in {:?} (sign={sign:?}, dns={:?}, tls={:?}, ttfb={:?})",
            run.object_key,
            timings.total,
            timings.dns,
            timings.tls_handshake,
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
        let req = self.build_request(Method::GET, &url, Bytes::new())?;

        let start = Instant::now();
        let (response, timings, sign) = match self.exchange(req).await {
            Ok(exchange) => exchange,
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
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Download, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Download, self.name(), "sign", sign);

        if response.status != 200 {
            self.collector.record_download(
                &run.test_name,
                self.name(),
                &run.bucket,
                "",
                timings.total,
                0,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status,
            });
        }

        tracing::debug!(
            "downloaded {} ({} bytes) in {:?} (sign={sign:?}, ttfb={:?}, transfer={:?})",
            run.object_key,
            response.body_bytes,
            timings.total,
            timings.ttfb,
            timings.transfer,
        );
        // The file-size label is derived from the observed bytes.
        self.collector.record_download(
            &run.test_name,
            self.name(),
            &run.bucket,
            "",
            timings.total,
            response.body_bytes,
            true,
        );
        Ok(())
    }

    async fn delete(&self, run: &RunContext, step: &TestStep) -> Result<(), StepError> {
        let label = declared_size_label(step);
        let url = self.object_url(&run.bucket, &run.object_key);
        let req = self.build_request(Method::DELETE, &url, Bytes::new())?;

        let (response, timings, sign) = match self.exchange(req).await {
            Ok(exchange) => exchange,
            Err(err) => {
                self.collector.record_delete(
                    &run.test_name,
                    self.name(),
                    &run.bucket,
                    &label,
                    Duration::ZERO,
                    0,
                    false,
                );
                return Err(err);
            }
        };

        self.collector
            .record_http_timings(&run.test_name, Action::Delete, self.name(), &timings);
        self.collector
            .record_http_phase(&run.test_name, Action::Delete, self.name(), "sign", sign);

        if !matches!(response.status, 200 | 204) {
            self.collector.record_delete(
                &run.test_name,
                self.name(),
                &run.bucket,
                &label,
                Duration::ZERO,
                0,
                false,
            );
            return Err(StepError::UnexpectedStatus {
                status: response.status,
            });
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
        let req = self.build_request(Method::GET, &url, Bytes::new())?;

        let (response, timings, sign) = match self.exchange(req).await {
            Ok(exchange) => exchange,
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

        if response.status != 200 {
            self.collector
                .record_list(&run.test_name, self.name(), &run.bucket, false);
            return Err(StepError::UnexpectedStatus {
                status: response.status,
            });
        }

        self.collector
            .record_list(&run.test_name, self.name(), &run.bucket, true);
        Ok(())
    }
}

#[async_trait]
impl TestExecutor for RawHttpExecutor {
    fn name(&self) -> &'static str {
        "raw-http"
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
