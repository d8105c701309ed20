//! Logging bootstrap shared by the chatlink binaries.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        TelemetryConfig {
            service_name: service_name.into(),
            default_filter: "info".to_string(),
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` overrides the default
/// filter. Call once at process start.
pub fn init(config: &TelemetryConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    tracing::info!(service = %config.service_name, "telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_info() {
        let config = TelemetryConfig::new("chatlink-server");
        assert_eq!(config.default_filter, "info");
        let config = config.with_default_filter("chatlink=debug,info");
        assert_eq!(config.default_filter, "chatlink=debug,info");
    }
}
