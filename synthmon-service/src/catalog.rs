//! The declarative test catalogue: tests, their steps, file sizes, and
//! jitter settings.
//!
//! These types deserialize straight out of the configuration document and are
//! immutable for the process lifetime.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Fallback applied when a step declares no timeout, a zero timeout, or one
/// that does not parse.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Default upload payload size when a step declares none.
pub const DEFAULT_FILE_SIZE: ByteSize = ByteSize::new(1024 * 1024);

/// A named, scheduled unit of synthetic work.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Test {
    pub name: String,
    /// Cron expression (five fields, standard minute resolution).
    pub schedule: String,
    #[serde(default)]
    pub enabled: bool,
    /// The backend this test runs through.
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Optional override of the globally configured bucket.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Optional fixed object key. When absent, a fresh key is derived from
    /// the per-run identifier.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub jitter: Option<JitterConfig>,
    /// Ordered steps; must be non-empty.
    pub steps: Vec<TestStep>,
}

impl Test {
    /// The bucket this test targets, falling back to the global default.
    pub fn resolve_bucket<'a>(&'a self, global: &'a str) -> &'a str {
        match self.bucket.as_deref() {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => global,
        }
    }

    /// The object key shared by all steps of one run.
    pub fn object_key(&self, run_id: &str) -> String {
        match self.filename.as_deref() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("{}-{}.bin", self.name, run_id),
        }
    }

    /// Test-level jitter settings with unset fields inherited from `global`.
    pub fn effective_jitter(&self, global: &JitterConfig) -> JitterConfig {
        match &self.jitter {
            Some(jitter) => jitter.overlaid_on(global),
            None => global.clone(),
        }
    }
}

/// One operation inside a test run. The step name doubles as the operation
/// selector.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestStep {
    pub name: String,
    /// Script to execute; consumed by the native executor only.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    /// Human-readable duration such as `"90s"`.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Upload payload size, as raw bytes or a string like `"5MB"`.
    #[serde(default)]
    pub file_size: Option<ByteSize>,
    /// Object time-to-live. Zero or negative means no expiration.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    /// Key prefix filter, consumed by deletion sweeps and listings.
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default)]
    pub max_age_minutes: Option<i64>,
    #[serde(default)]
    pub max_delete: Option<i64>,
    #[serde(default)]
    pub jitter: Option<JitterConfig>,
}

impl TestStep {
    /// The operation selected by the step name.
    pub fn action(&self) -> Result<Action, crate::error::StepError> {
        self.name
            .parse()
            .map_err(|_| crate::error::StepError::UnknownOperation(self.name.clone()))
    }

    /// Per-step deadline. Missing, zero, and unparseable values all fall
    /// back to [`DEFAULT_STEP_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        let parsed = self
            .timeout
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw.trim()).ok());
        match parsed {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Effective TTL: `Some` only for positive values.
    pub fn ttl(&self) -> Option<i64> {
        self.ttl_seconds.filter(|ttl| *ttl > 0)
    }
}

/// The operation a step performs, derived from the step name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Upload,
    Download,
    Delete,
    List,
}

impl Action {
    /// The literal used for the `action` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Download => "download",
            Action::Delete => "delete",
            Action::List => "list",
        }
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Action::Upload),
            "download" => Ok(Action::Download),
            "delete" => Ok(Action::Delete),
            "list" => Ok(Action::List),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend a test runs through.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Scripted child process speaking the native protocol.
    #[default]
    Native,
    /// Third-party HTTP object-storage SDK.
    SdkHttp,
    /// Direct HTTP with in-process signing and phase tracing.
    RawHttp,
    /// HTTP client binary driven as a child process.
    SubprocessHttp,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Native => "native",
            ExecutorKind::SdkHttp => "sdk-http",
            ExecutorKind::RawHttp => "raw-http",
            ExecutorKind::SubprocessHttp => "subprocess-http",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded random pre-delay settings.
///
/// `enabled` is a tri-state: an unset value inherits from the enclosing
/// scope (step ⟶ test ⟶ global), a set value overrides it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct JitterConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Maximum delay: a duration (`"30s"`) or, at test level, a percentage
    /// of the schedule interval (`"10%"`).
    #[serde(default)]
    pub max: Option<String>,
}

impl JitterConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// This config with unset fields filled in from `parent`.
    pub fn overlaid_on(&self, parent: &JitterConfig) -> JitterConfig {
        JitterConfig {
            enabled: self.enabled.or(parent.enabled),
            max: self.max.clone().or_else(|| parent.max.clone()),
        }
    }

    /// Resolves `max` into a concrete duration.
    ///
    /// Percentage form is resolved against `schedule_interval` and is an
    /// error without one; steps therefore pass `None` and may only use the
    /// duration form.
    pub fn max_jitter(
        &self,
        schedule_interval: Option<Duration>,
    ) -> anyhow::Result<Duration> {
        let Some(max) = self.max.as_deref().map(str::trim).filter(|s| !s.is_empty())
        else {
            return Ok(Duration::ZERO);
        };

        if let Some(percent_str) = max.strip_suffix('%') {
            let percent: f64 = percent_str.trim().parse().map_err(|err| {
                anyhow::anyhow!("invalid jitter percentage `{max}`: {err}")
            })?;
            if !(0.0..=100.0).contains(&percent) {
                bail!("jitter percentage must be between 0 and 100, got {percent}");
            }
            let Some(interval) = schedule_interval.filter(|i| !i.is_zero()) else {
                bail!("cannot use percentage jitter without a schedule interval");
            };
            return Ok(interval.mul_f64(percent / 100.0));
        }

        humantime::parse_duration(max)
            .map_err(|err| anyhow::anyhow!("invalid jitter duration `{max}`: {err}"))
    }
}

/// A file size that can be declared as raw bytes or in human-readable form,
/// carrying its canonical byte count. The display form is the canonical
/// label: the coarsest unit that divides the value exactly, in powers of
/// 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

impl ByteSize {
    pub const fn new(bytes: u64) -> Self {
        ByteSize(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// The canonical human-readable label, e.g. `"5MB"` or `"512KB"`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes >= GIB && bytes % GIB == 0 {
            write!(f, "{}GB", bytes / GIB)
        } else if bytes >= MIB && bytes % MIB == 0 {
            write!(f, "{}MB", bytes / MIB)
        } else if bytes >= KIB && bytes % KIB == 0 {
            write!(f, "{}KB", bytes / KIB)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

/// The size-string parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeParseError(String);

impl fmt::Display for SizeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SizeParseError {}

impl FromStr for ByteSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SizeParseError("empty size string".into()));
        }

        let unit_start = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (num_str, unit_str) = s.split_at(unit_start);

        let num: f64 = num_str.trim().parse().map_err(|err| {
            SizeParseError(format!("invalid number in size `{s}`: {err}"))
        })?;

        let multiplier = match unit_str.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "KB" | "K" => KIB,
            "MB" | "M" => MIB,
            "GB" | "G" => GIB,
            unit => {
                return Err(SizeParseError(format!(
                    "unknown size unit `{unit}` (supported: B, KB, MB, GB)"
                )));
            }
        };

        Ok(ByteSize((num * multiplier as f64) as u64))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a string like \"5MB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("file size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
