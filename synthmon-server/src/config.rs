use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{zeroize::Zeroize, CloneableSecret, ExposeSecret, SecretBox, SerializableSecret};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use synthmon_service::catalog::{JitterConfig, Test};
use synthmon_service::scheduler;

const ENV_PREFIX: &str = "SYNTHMON_";

/// Newtype around `String` that protects against accidental logging of
/// secrets in the configuration struct. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn empty_secret() -> SecretBox<ConfigSecret> {
    SecretBox::new(Box::new(ConfigSecret::default()))
}

/// Native-protocol access settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SatelliteConfig {
    pub access_grant: SecretBox<ConfigSecret>,
    pub bucket: String,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            access_grant: empty_secret(),
            bucket: String::new(),
        }
    }
}

/// S3 gateway settings; enable the three HTTP executors when present.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: SecretBox<ConfigSecret>,
    pub region: String,
}

impl S3Config {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.access_key.is_empty()
            && !self.secret_key.expose_secret().as_str().is_empty()
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: empty_secret(),
            region: "us-east-1".into(),
        }
    }
}

/// Location of the scripted child-process binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct K6Config {
    pub binary_path: PathBuf,
    pub output_format: String,
}

impl Default for K6Config {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/k6"),
            output_format: "json".into(),
        }
    }
}

/// Metric exposition settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            path: "/metrics".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads for the server runtime.
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise
    /// [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub satellite: SatelliteConfig,
    pub s3: S3Config,
    pub k6: K6Config,
    pub metrics: MetricsConfig,
    pub logging: Logging,
    pub runtime: Runtime,
    /// Global jitter defaults, inherited by tests and steps.
    pub jitter: JitterConfig,
    pub tests: Vec<Test>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            satellite: SatelliteConfig::default(),
            s3: S3Config::default(),
            k6: K6Config::default(),
            metrics: MetricsConfig::default(),
            logging: Logging::default(),
            runtime: Runtime::default(),
            jitter: JitterConfig::default(),
            tests: Vec::new(),
        }
    }
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Malformed(#[source] Box<figment::Error>),

    #[error("test `{test}` declares no steps")]
    EmptySteps { test: String },

    #[error("test `{test}` has an invalid schedule: {message}")]
    InvalidSchedule { test: String, message: String },

    #[error("test `{test}` has invalid jitter settings: {message}")]
    InvalidJitter { test: String, message: String },

    #[error("metrics path must start with `/`, got `{0}`")]
    BadMetricsPath(String),
}

impl Config {
    /// Loads the configuration: serialized defaults, the YAML document (with
    /// `${NAME}` references substituted from the environment), and
    /// `SYNTHMON_`-prefixed environment overrides, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?;
            figment = figment.merge(Yaml::string(&expand_env(&raw)));
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|err| ConfigError::Malformed(Box::new(err)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::BadMetricsPath(self.metrics.path.clone()));
        }

        for test in &self.tests {
            if test.steps.is_empty() {
                return Err(ConfigError::EmptySteps {
                    test: test.name.clone(),
                });
            }

            if let Err(err) = scheduler::parse_schedule(&test.schedule) {
                return Err(ConfigError::InvalidSchedule {
                    test: test.name.clone(),
                    message: format!("{err:#}"),
                });
            }

            let effective = test.effective_jitter(&self.jitter);
            if effective.is_enabled() {
                let interval = scheduler::estimate_cron_interval(&test.schedule).ok();
                if let Err(err) = effective.max_jitter(interval) {
                    return Err(ConfigError::InvalidJitter {
                        test: test.name.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }

            for step in &test.steps {
                if let Some(step_jitter) = &step.jitter {
                    if step_jitter.is_enabled() {
                        // Steps accept the duration form only.
                        if let Err(err) = step_jitter.max_jitter(None) {
                            return Err(ConfigError::InvalidJitter {
                                test: format!("{}/{}", test.name, step.name),
                                message: format!("{err:#}"),
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Address the exposition server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics.port))
    }
}

/// Substitutes `${NAME}` references from the process environment before the
/// document is parsed. Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = lookup(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.metrics.port, 8080);
        assert_eq!(config.metrics.path, "/metrics");
        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.k6.binary_path, PathBuf::from("/usr/local/bin/k6"));
        assert_eq!(config.k6.output_format, "json");
        assert!(!config.s3.is_configured());
        assert!(config.tests.is_empty());
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            satellite:
                access_grant: grant-abc
                bucket: synthetics
            s3:
                endpoint: http://localhost:9000
                access_key: ak
                secret_key: sk
            metrics:
                port: 9184
            tests:
              - name: upload-5mb
                schedule: "*/5 * * * *"
                enabled: true
                executor: raw-http
                steps:
                  - name: upload
                    file_size: 5MB
                    timeout: 90s
            "#,
            )
            .unwrap();

        let config = Config::load(Some(tempfile.path())).unwrap();

        assert_eq!(config.satellite.bucket, "synthetics");
        assert_eq!(
            config.satellite.access_grant.expose_secret().as_str(),
            "grant-abc"
        );
        assert!(config.s3.is_configured());
        assert_eq!(config.s3.secret_key.expose_secret().as_str(), "sk");
        assert_eq!(config.metrics.port, 9184);

        assert_eq!(config.tests.len(), 1);
        let test = &config.tests[0];
        assert_eq!(test.steps[0].file_size.unwrap().bytes(), 5 * 1024 * 1024);
        assert_eq!(test.steps[0].timeout(), std::time::Duration::from_secs(90));
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SYNTHMON_METRICS__PORT", "9999");
            jail.set_env("SYNTHMON_S3__ENDPOINT", "http://gateway:7777");
            jail.set_env("SYNTHMON_LOGGING__LEVEL", "debug");

            let config = Config::load(None).unwrap();
            assert_eq!(config.metrics.port, 9999);
            assert_eq!(config.s3.endpoint, "http://gateway:7777");
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            Ok(())
        });
    }

    #[test]
    fn env_references_expand_before_parsing() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SYNTHMON_TEST_SECRET", "hunter2");

            let mut tempfile = tempfile::NamedTempFile::new().unwrap();
            tempfile
                .write_all(
                    br#"
                s3:
                    endpoint: http://localhost:9000
                    access_key: ak
                    secret_key: ${SYNTHMON_TEST_SECRET}
                "#,
                )
                .unwrap();

            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.s3.secret_key.expose_secret().as_str(), "hunter2");
            Ok(())
        });
    }

    #[test]
    fn expansion_handles_unset_and_unterminated_references() {
        let expanded = expand_with("a=${SET} b=${UNSET} c=${broken", |name| {
            (name == "SET").then(|| "value".to_owned())
        });
        assert_eq!(expanded, "a=value b= c=${broken");
    }

    #[test]
    fn empty_steps_are_rejected() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            tests:
              - name: hollow
                schedule: "*/5 * * * *"
                enabled: true
                steps: []
            "#,
            )
            .unwrap();

        let err = Config::load(Some(tempfile.path())).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySteps { test } if test == "hollow"));
    }

    #[test]
    fn unparseable_schedules_are_rejected() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            tests:
              - name: bad-cron
                schedule: "whenever"
                enabled: false
                steps:
                  - name: upload
            "#,
            )
            .unwrap();

        let err = Config::load(Some(tempfile.path())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchedule { .. }));
    }

    #[test]
    fn bad_jitter_settings_are_rejected() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            tests:
              - name: over-jittered
                schedule: "*/5 * * * *"
                enabled: true
                jitter:
                    enabled: true
                    max: "150%"
                steps:
                  - name: upload
            "#,
            )
            .unwrap();

        let err = Config::load(Some(tempfile.path())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJitter { .. }));
    }

    #[test]
    fn step_jitter_may_not_use_percentages() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            tests:
              - name: stepped
                schedule: "*/5 * * * *"
                enabled: true
                steps:
                  - name: upload
                    jitter:
                        enabled: true
                        max: "10%"
            "#,
            )
            .unwrap();

        let err = Config::load(Some(tempfile.path())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJitter { .. }));
    }

    #[test]
    fn unknown_size_units_are_rejected() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            tests:
              - name: sized
                schedule: "*/5 * * * *"
                enabled: true
                steps:
                  - name: upload
                    file_size: 5PB
            "#,
            )
            .unwrap();

        let err = Config::load(Some(tempfile.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn secrets_do_not_leak_through_debug() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            s3:
                endpoint: http://localhost:9000
                access_key: ak
                secret_key: super-secret-value
            "#,
            )
            .unwrap();

        let config = Config::load(Some(tempfile.path())).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-value"));
    }
}
