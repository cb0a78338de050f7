use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::SignalKind;

use crate::config::Config;
use crate::state::Services;
use crate::web::app::App;

/// The maximum backlog for TCP listen sockets before refusing connections.
const TCP_LISTEN_BACKLOG: u32 = 1024;

/// Drain deadline for the HTTP server once shutdown is initiated.
const HTTP_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Bounded wait for in-flight test runs on shutdown.
const SCHEDULER_GRACE: Duration = Duration::from_secs(30);

/// Runs the monitor: the scheduler plus the exposition server, until
/// termination is requested.
pub async fn server(config: Config) -> Result<()> {
    tracing::info!(
        "starting synthetic monitor (bucket: {}, tests: {})",
        config.satellite.bucket,
        config.tests.len()
    );

    let listener = listen(&config).context("failed to start TCP listener")?;
    let state = Services::build(config)?;

    state.scheduler.start();

    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        App::new(server_state)
            .graceful_shutdown(true)
            .serve(listener)
            .await
    });

    let drain_state = state.clone();
    tokio::spawn(async move {
        let guard = elegant_departure::get_shutdown_guard();
        guard.wait().await;
        tracing::info!("shutting down ...");
        drain_state.shutdown.cancel();
        drain_state.scheduler.shutdown(SCHEDULER_GRACE).await;
    });

    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .on_signal(SignalKind::quit())
        .await;

    let server_result = match tokio::time::timeout(HTTP_DRAIN_DEADLINE, server_handle).await {
        Ok(joined) => joined.map_err(anyhow::Error::from).and_then(|result| result),
        Err(_) => {
            tracing::warn!("HTTP drain deadline elapsed with connections still open");
            Ok(())
        }
    };

    tracing::info!("shutdown complete");
    server_result
}

fn listen(config: &Config) -> Result<TcpListener> {
    let addr = config.listen_addr();
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(TCP_LISTEN_BACKLOG)?;
    tracing::info!("HTTP server listening on {addr}");

    Ok(listener)
}
