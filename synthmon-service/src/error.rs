//! Error types for the measurement engine.

use std::time::Duration;

use thiserror::Error;

/// The work was cut short by process shutdown.
#[derive(Debug, Error)]
#[error("interrupted by shutdown")]
pub struct Interrupted;

/// Errors produced while signing a request.
#[derive(Debug, Error)]
pub enum SignError {
    /// The request URL carries no host, so there is nothing to bind the
    /// signature to.
    #[error("request URL has no host")]
    MissingHost,
}

/// Errors from the wire-level HTTP client.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid request URL: {0}")]
    BadUrl(String),

    #[error("dns resolution failed: {0}")]
    Dns(#[source] std::io::Error),

    #[error("no address resolved for `{0}`")]
    NoAddress(String),

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("tls handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("invalid tls server name `{0}`")]
    ServerName(String),

    #[error("i/o failure during exchange: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Failure of a single step within a test run.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step name is not one of the recognized operations.
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    /// A native step was declared without a script to run.
    #[error("step has no script path")]
    MissingScript,

    #[error("request signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("transport failure: {0}")]
    Transport(#[from] WireError),

    #[error("storage backend error: {0}")]
    Sdk(#[from] s3::error::S3Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("child process exited with status {status}")]
    ChildFailed { status: i32 },

    #[error("malformed timing report: {0}")]
    MalformedReport(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("interrupted by shutdown")]
    Interrupted,
}

impl From<Interrupted> for StepError {
    fn from(_: Interrupted) -> Self {
        StepError::Interrupted
    }
}

/// Failure of an entire test run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The target bucket could not be brought into existence.
    #[error("bucket `{bucket}` could not be ensured: {source}")]
    Bucket {
        bucket: String,
        #[source]
        source: StepError,
    },

    /// A step failed; subsequent steps of the run were not executed.
    #[error("step `{step}` failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("run interrupted by shutdown")]
    Interrupted,
}
