//! scribe-dns binary entry point.

use clap::Parser;
use scribe_dns::{api, telemetry, Config, Reconciler, Store, TelemetryConfig, TlsConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Programmable authoritative DNS server with a REST control plane.
#[derive(Parser, Debug)]
#[command(name = "scribe-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// IP address and TCP port to serve the admin REST API on.
    #[arg(long, env = "HTTP_LISTEN", default_value = "0.0.0.0:5380")]
    http_listen: SocketAddr,

    /// Directory backing the record store.
    #[arg(long, env = "DB_DIR", default_value = "./db/v1")]
    db_dir: PathBuf,

    /// PEM certificate chain enabling TLS on the admin API.
    #[arg(long, env = "TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key enabling TLS on the admin API.
    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// Log level filter (e.g. "info", "scribe_dns=debug,warn").
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        // TLS needs both halves; anything less serves plain HTTP.
        let tls = match (self.tls_cert_file, self.tls_key_file) {
            (Some(cert_file), Some(key_file)) => Some(TlsConfig {
                cert_file,
                key_file,
            }),
            _ => None,
        };

        Config {
            http_listen: self.http_listen,
            db_dir: self.db_dir,
            tls,
            telemetry: TelemetryConfig {
                log_level: self.log_level,
                prometheus_addr: None,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config();

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        http_listen = %config.http_listen,
        db_dir = %config.db_dir.display(),
        tls = config.tls.is_some(),
        "starting scribe-dns"
    );

    let store = Store::open(&config.db_dir).inspect_err(|e| {
        error!(db_dir = %config.db_dir.display(), error = %e, "could not open record store");
    })?;

    // Sending on this channel makes the reconciler reload resolvers from the
    // store; the cancellation token stops everything.
    let (reload_tx, reload_rx) = tokio::sync::mpsc::channel(1);
    let shutdown = CancellationToken::new();

    let reconciler = Reconciler::new(store.clone());
    let reconciler_handle = tokio::spawn(reconciler.run(reload_rx, shutdown.clone()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("signal received, shutting down");
            shutdown.cancel();
        }
    });

    let served = api::serve(&config, store, reload_tx, shutdown.clone()).await;

    // Whether the API stopped cleanly or fell over, drain the data plane.
    shutdown.cancel();
    let _ = reconciler_handle.await;

    if let Err(e) = served {
        error!(error = %e, "admin API failed");
        return Err(e.into());
    }

    info!("scribe-dns shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
