//! Process configuration for scribe-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level process configuration.
///
/// Resolver configuration is deliberately absent here: resolvers live in the
/// record store and are managed through the REST API at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the admin REST API listens on.
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,

    /// Directory backing the record store.
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Optional TLS material for the admin API. Plain HTTP when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            db_dir: default_db_dir(),
            tls: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// TLS certificate/key pair for the admin API, both PEM encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain.
    pub cert_file: PathBuf,

    /// Path to the PEM private key.
    pub key_file: PathBuf,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "scribe_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address (with the `prometheus` feature).
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5380))
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("./db/v1")
}

fn default_log_level() -> String {
    "info".to_string()
}
