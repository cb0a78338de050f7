use anyhow::Result;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::endpoints;
use crate::state::ServiceState;

/// The metric exposition web application.
#[derive(Debug)]
pub struct App {
    router: axum::Router,
    graceful_shutdown: bool,
}

impl App {
    /// Creates the application router for the given service state.
    pub fn new(state: ServiceState) -> Self {
        let router = endpoints::routes(&state.config.metrics.path)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        App {
            router,
            graceful_shutdown: false,
        }
    }

    /// Enables or disables graceful shutdown for the server.
    ///
    /// By default, graceful shutdown is disabled.
    pub fn graceful_shutdown(mut self, enable: bool) -> Self {
        self.graceful_shutdown = enable;
        self
    }

    /// Runs the web server; with graceful shutdown enabled it drains once
    /// process shutdown is initiated.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let Self {
            router,
            graceful_shutdown,
        } = self;

        if graceful_shutdown {
            let guard = elegant_departure::get_shutdown_guard();
            axum::serve(listener, router)
                .with_graceful_shutdown(guard.wait_owned())
                .await?;
        } else {
            axum::serve(listener, router).await?;
        }

        Ok(())
    }
}
