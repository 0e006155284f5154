//! Scribe DNS - a programmable authoritative DNS server with a REST control plane.
//!
//! Operators declare **resolvers**: each resolver binds a set of DNS name
//! patterns to a set of listeners (protocol + address) and an ordered list of
//! upstream forwarders. Canned DNS answers are stored per resolver in a local
//! document store and served to clients; when the store has no answer, the
//! resolver falls back to its forwarders in order. All configuration is
//! mutated through the REST API and takes effect live, without a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          scribe-dns                            │
//! │                                                                │
//! │  ┌───────────────┐ reload  ┌──────────────┐                    │
//! │  │   REST API    │────────▶│  Reconciler  │                    │
//! │  │  (axum, /v1)  │         │  (listener   │                    │
//! │  └──────┬────────┘         │   lifecycle) │                    │
//! │         │                  └──────┬───────┘                    │
//! │         ▼                         ▼ start / mutate / stop      │
//! │  ┌───────────────┐         ┌──────────────┐                    │
//! │  │ Record Store  │◀────────│  Listeners   │◀── UDP/TCP :53     │
//! │  │ (file-backed) │  lookup │ (pattern mux │                    │
//! │  └───────────────┘         │  + handlers) │──▶ forwarders      │
//! │                            └──────────────┘                    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Query resolution
//!
//! ```text
//! host.example.com. A
//!   → exact match    (resolver, qtype, "host.example.com.")
//!   → wildcard match (resolver, qtype, "*.example.com.")
//!   → forwarders, in configured order
//! ```
//!
//! ## Example usage
//!
//! ```rust,ignore
//! use scribe_dns::{api, Config, Reconciler, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let store = Store::open(&config.db_dir).unwrap();
//!
//!     let (reload_tx, reload_rx) = tokio::sync::mpsc::channel(1);
//!     let shutdown = CancellationToken::new();
//!
//!     let reconciler = Reconciler::new(store.clone());
//!     tokio::spawn(reconciler.run(reload_rx, shutdown.clone()));
//!
//!     api::serve(&config, store, reload_tx, shutdown).await.unwrap();
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod mux;
pub mod reconcile;
pub mod resolver;
pub mod store;
pub mod telemetry;

// Re-export main types
pub use config::{Config, TelemetryConfig, TlsConfig};
pub use error::ServerError;
pub use message::StoredMessage;
pub use reconcile::Reconciler;
pub use resolver::ResolverConfig;
pub use store::Store;
