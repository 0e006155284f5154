//! Admin REST API.
//!
//! The control plane persists first, then nudges the reconciler: resolver
//! mutations signal the reload channel after the store write succeeds, so a
//! reconciliation pass always reads a store state at least as recent as the
//! mutation that triggered it. Question mutations touch only record data and
//! never reshape listeners, so they do not signal.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, TlsConfig};
use crate::error::ServerError;
use crate::message::StoredMessage;
use crate::resolver::ResolverConfig;
use crate::store::{Store, StoreError};

/// Shared state of the admin API handlers.
#[derive(Clone)]
pub struct ApiState {
    store: Store,
    reload: mpsc::Sender<()>,
}

impl ApiState {
    pub fn new(store: Store, reload: mpsc::Sender<()>) -> Self {
        Self { store, reload }
    }

    /// Best-effort reload nudge. A full channel means a pass is already
    /// pending and will observe this mutation too.
    fn signal_reload(&self) {
        if self.reload.try_send(()).is_err() {
            debug!("reload already pending");
        }
    }
}

/// Build the `/v1` admin router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/question", put(put_question).delete(delete_question))
        .route(
            "/v1/resolver",
            get(get_resolvers).put(put_resolver).delete(delete_resolver),
        )
        .with_state(state)
}

/// Error envelope for the admin API.
enum ApiError {
    /// Empty or undecodable request body.
    BadRequest(String),
    /// The store failed the operation.
    Store(StoreError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn put_question(
    State(state): State<ApiState>,
    body: Result<Json<StoredMessage>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(message) = body?;
    state.store.write_message(&message)?;
    info!(
        resolvers = ?message.resolvers,
        questions = message.question.len(),
        "stored DNS message"
    );
    Ok(StatusCode::OK)
}

async fn delete_question(
    State(state): State<ApiState>,
    body: Result<Json<StoredMessage>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(message) = body?;
    state.store.delete_message(&message)?;
    info!(resolvers = ?message.resolvers, "deleted DNS message");
    Ok(StatusCode::OK)
}

async fn get_resolvers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ResolverConfig>>, ApiError> {
    Ok(Json(state.store.read_resolvers()?))
}

async fn put_resolver(
    State(state): State<ApiState>,
    body: Result<Json<ResolverConfig>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(resolver) = body?;
    state.store.write_resolver(&resolver)?;
    info!(
        resolver = resolver.id.as_str(),
        patterns = resolver.patterns.len(),
        listeners = resolver.listeners.len(),
        "stored resolver"
    );
    state.signal_reload();
    Ok(StatusCode::OK)
}

async fn delete_resolver(
    State(state): State<ApiState>,
    body: Result<Json<ResolverConfig>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(resolver) = body?;
    state.store.delete_resolver(&resolver.id)?;
    info!(resolver = resolver.id.as_str(), "deleted resolver");
    state.signal_reload();
    Ok(StatusCode::OK)
}

/// Serve the admin API until `shutdown` fires. TLS is enabled when the
/// configuration carries both certificate and key paths.
pub async fn serve(
    config: &Config,
    store: Store,
    reload: mpsc::Sender<()>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = router(ApiState::new(store, reload));
    let listener = TcpListener::bind(config.http_listen).await?;

    match &config.tls {
        None => {
            info!(addr = %config.http_listen, "admin API listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
        }
        Some(tls) => {
            info!(addr = %config.http_listen, "admin API listening (TLS)");
            serve_tls(listener, app, tls, shutdown).await?;
        }
    }

    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: &TlsConfig,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let tls_config = load_tls_config(tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, "admin API accept failed");
                        continue;
                    }
                };
                tokio::spawn(handle_tls_connection(stream, peer, acceptor.clone(), app.clone()));
            }
        }
    }

    Ok(())
}

async fn handle_tls_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
) {
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;
    use hyper_util::service::TowerToHyperService;

    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let service = TowerToHyperService::new(app);
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(%peer, error = %e, "admin connection closed with error");
    }
}

fn load_tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&tls.cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&tls.key_file)?))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", tls.key_file.display())))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))
}
