//! Service wiring: metric collector, executor registry, and scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use synthmon_service::catalog::ExecutorKind;
use synthmon_service::executor::{
    CurlHttpExecutor, ExecutorRegistry, NativeConfig, NativeExecutor, RawHttpExecutor,
    S3Options, SdkHttpExecutor,
};
use synthmon_service::metrics::Collector;
use synthmon_service::scheduler::Scheduler;
use synthmon_service::testdata;

use crate::config::Config;

pub type ServiceState = Arc<Services>;

/// The shared service graph behind both the scheduler and the web surface.
#[derive(Debug)]
pub struct Services {
    pub config: Config,
    pub collector: Arc<Collector>,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: CancellationToken,
}

impl Services {
    pub fn build(config: Config) -> Result<ServiceState> {
        if let Err(err) = testdata::ensure_test_data_files(&config.tests) {
            tracing::warn!("failed to ensure test data files: {err:#}");
        }

        let collector =
            Arc::new(Collector::new().context("failed to build metric registry")?);
        let shutdown = CancellationToken::new();

        let registry = build_executors(&config, &collector);
        let scheduler =
            Scheduler::new(&config.tests, registry, &config.jitter, shutdown.clone())
                .context("failed to build scheduler")?;

        Ok(Arc::new(Services {
            config,
            collector,
            scheduler: Arc::new(scheduler),
            shutdown,
        }))
    }
}

/// Registers every backend whose settings are present. A backend that fails
/// to initialize is logged and left unregistered; tests declaring it are
/// skipped by the scheduler.
fn build_executors(config: &Config, collector: &Arc<Collector>) -> ExecutorRegistry {
    let mut registry: ExecutorRegistry = HashMap::new();

    let native = NativeExecutor::new(
        NativeConfig {
            binary_path: config.k6.binary_path.clone(),
            output_format: config.k6.output_format.clone(),
            access_grant: config
                .satellite
                .access_grant
                .expose_secret()
                .as_str()
                .to_owned(),
            bucket: config.satellite.bucket.clone(),
        },
        Arc::clone(collector),
    );
    registry.insert(ExecutorKind::Native, Arc::new(native));
    tracing::info!(
        "initialized native executor ({})",
        config.k6.binary_path.display()
    );

    if config.s3.is_configured() {
        let options = S3Options {
            endpoint: config.s3.endpoint.clone(),
            access_key: config.s3.access_key.clone(),
            secret_key: config.s3.secret_key.expose_secret().as_str().to_owned(),
            region: config.s3.region.clone(),
            bucket: config.satellite.bucket.clone(),
        };

        match SdkHttpExecutor::new(options.clone(), Arc::clone(collector)) {
            Ok(exec) => {
                registry.insert(ExecutorKind::SdkHttp, Arc::new(exec));
                tracing::info!("initialized sdk-http executor (endpoint: {})", options.endpoint);
            }
            Err(err) => tracing::warn!("failed to initialize sdk-http executor: {err:#}"),
        }

        match RawHttpExecutor::new(options.clone(), Arc::clone(collector)) {
            Ok(exec) => {
                registry.insert(ExecutorKind::RawHttp, Arc::new(exec));
                tracing::info!("initialized raw-http executor (endpoint: {})", options.endpoint);
            }
            Err(err) => tracing::warn!("failed to initialize raw-http executor: {err:#}"),
        }

        match CurlHttpExecutor::new(options.clone(), Arc::clone(collector)) {
            Ok(exec) => {
                registry.insert(ExecutorKind::SubprocessHttp, Arc::new(exec));
                tracing::info!(
                    "initialized subprocess-http executor (endpoint: {})",
                    options.endpoint
                );
            }
            Err(err) => tracing::warn!("failed to initialize subprocess-http executor: {err:#}"),
        }
    } else {
        tracing::info!("S3 executors disabled (no credentials configured)");
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_executor_is_always_registered() {
        let config = Config::default();
        let collector = Arc::new(Collector::new().unwrap());

        let registry = build_executors(&config, &collector);
        assert!(registry.contains_key(&ExecutorKind::Native));
        // No S3 settings: the HTTP executors stay unregistered.
        assert!(!registry.contains_key(&ExecutorKind::SdkHttp));
        assert!(!registry.contains_key(&ExecutorKind::RawHttp));
        assert!(!registry.contains_key(&ExecutorKind::SubprocessHttp));
    }

    #[test]
    fn services_build_from_defaults() {
        let state = Services::build(Config::default()).unwrap();
        assert_eq!(state.scheduler.scheduled_count(), 0);
        state.collector.export().unwrap();
    }
}
