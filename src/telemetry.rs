//! Tracing setup for the service.
//!
//! Installs a `tracing_subscriber` registry with an [`EnvFilter`] driven by
//! `RUST_LOG` (defaults to `info`) and a formatted stdout layer, and provides
//! the HTTP tracing layer used by the router.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    name: Option<&'static str>,
    version: Option<&'static str>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    /// Registers the global subscriber. A second registration is ignored.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let registered = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init();

        if registered.is_ok() {
            tracing::info!(
                service.name = self.name.unwrap_or("unknown"),
                service.version = self.version.unwrap_or("unknown"),
                "Telemetry initialized"
            );
        }
        self
    }

    pub fn http_tracing(&self) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }
}
