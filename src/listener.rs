//! Bound DNS endpoints.
//!
//! One listener per `(net, address)` pair. Binding happens before the serve
//! task is spawned so the reconciler sees bind failures synchronously and
//! never records a listener it does not own a socket for. The serve task
//! runs until its shutdown channel fires, then drops the server future,
//! which tears down the socket tasks.

use hickory_server::ServerFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::mux::PatternMux;
use crate::resolver::Net;

/// Idle timeout for inbound TCP DNS connections.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind `(net, address)` and serve queries through `mux` until `shutdown`
/// fires. Returns the bound local address once the socket is live.
pub async fn spawn(
    net: Net,
    address: &str,
    mux: PatternMux,
    shutdown: oneshot::Receiver<()>,
) -> Result<SocketAddr, ServerError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| ServerError::InvalidAddress(address.to_string()))?;

    let mut server = ServerFuture::new(mux);
    let local_addr = match net {
        Net::Udp => {
            let socket = UdpSocket::bind(addr).await?;
            let local_addr = socket.local_addr()?;
            server.register_socket(socket);
            local_addr
        }
        Net::Tcp => {
            let tcp_listener = TcpListener::bind(addr).await?;
            let local_addr = tcp_listener.local_addr()?;
            server.register_listener(tcp_listener, TCP_IDLE_TIMEOUT);
            local_addr
        }
    };

    info!(%net, addr = %local_addr, "DNS listener bound");
    tokio::spawn(serve(server, shutdown, net, local_addr));

    Ok(local_addr)
}

async fn serve(
    mut server: ServerFuture<PatternMux>,
    shutdown: oneshot::Receiver<()>,
    net: Net,
    addr: SocketAddr,
) {
    tokio::select! {
        result = server.block_until_done() => {
            // Terminal socket error; the reconciler will rebind on the next
            // reload if the listener is still configured.
            if let Err(e) = result {
                error!(%net, %addr, error = %e, "DNS listener terminated");
            }
        }
        _ = shutdown => {
            debug!(%net, %addr, "DNS listener shutting down");
        }
    }
}
