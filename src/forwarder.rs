//! Upstream forwarder client.
//!
//! One call, one exchange: serialize the query, send it to a single upstream
//! over its configured transport, decode whatever comes back. No retries, no
//! caching, no pooling. Fallback across upstreams is policy and lives in the
//! resolver pipeline.

use hickory_proto::op::Message;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::resolver::{ForwarderConfig, Net};

/// Per-exchange deadline covering connect, send and receive.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size accepted from an upstream.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// A failed exchange. Any decodable DNS response, whatever its rcode, is a
/// success; this type covers transport and wire-format failures only.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream address does not parse.
    #[error("invalid upstream address '{0}'")]
    InvalidAddress(String),

    /// The exchange did not complete within the deadline.
    #[error("timeout exchanging with {upstream}")]
    Timeout { upstream: String },

    /// Socket-level failure.
    #[error("exchange with {upstream} failed: {source}")]
    Io {
        upstream: String,
        source: io::Error,
    },

    /// The upstream answered with undecodable wire data, or the query could
    /// not be serialized.
    #[error("DNS wire error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// Client for single request/response exchanges with upstream servers.
#[derive(Debug, Clone)]
pub struct ForwarderClient {
    timeout: Duration,
}

impl Default for ForwarderClient {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

impl ForwarderClient {
    /// Create a client with a custom per-exchange deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Perform one exchange with `upstream` and decode the response.
    pub async fn exchange(
        &self,
        upstream: &ForwarderConfig,
        request: &Message,
    ) -> Result<Message, ForwardError> {
        let addr: SocketAddr = upstream
            .address
            .parse()
            .map_err(|_| ForwardError::InvalidAddress(upstream.address.clone()))?;
        let request_bytes = request.to_vec()?;

        let response_bytes = match upstream.net {
            Net::Udp => self.exchange_udp(addr, &request_bytes).await?,
            Net::Tcp => self.exchange_tcp(addr, &request_bytes).await?,
        };

        debug!(
            upstream = %upstream,
            bytes = response_bytes.len(),
            "upstream exchange complete"
        );

        Ok(Message::from_vec(&response_bytes)?)
    }

    async fn exchange_udp(&self, addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| io_error(addr, e))?;
        // Connected socket: ICMP unreachable surfaces as a recv error instead
        // of a silent timeout.
        socket.connect(addr).await.map_err(|e| io_error(addr, e))?;

        tokio::time::timeout(self.timeout, socket.send(request))
            .await
            .map_err(|_| timeout_error(addr))?
            .map_err(|e| io_error(addr, e))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| timeout_error(addr))?
            .map_err(|e| io_error(addr, e))?;
        buf.truncate(received);
        Ok(buf)
    }

    async fn exchange_tcp(&self, addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timeout_error(addr))?
            .map_err(|e| io_error(addr, e))?;

        let length = (request.len() as u16).to_be_bytes();
        tokio::time::timeout(self.timeout, async {
            stream.write_all(&length).await?;
            stream.write_all(request).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| timeout_error(addr))?
        .map_err(|e| io_error(addr, e))?;

        tokio::time::timeout(self.timeout, async {
            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| io_error(addr, e))?;
            let response_len = u16::from_be_bytes(len_buf) as usize;
            let mut response = vec![0u8; response_len];
            stream
                .read_exact(&mut response)
                .await
                .map_err(|e| io_error(addr, e))?;
            Ok(response)
        })
        .await
        .map_err(|_| timeout_error(addr))?
    }
}

fn io_error(addr: SocketAddr, source: io::Error) -> ForwardError {
    ForwardError::Io {
        upstream: addr.to_string(),
        source,
    }
}

fn timeout_error(addr: SocketAddr) -> ForwardError {
    ForwardError::Timeout {
        upstream: addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{DNSClass, Name, RecordType};

    fn query(name: &str) -> Message {
        let mut message = Message::new();
        message.set_id(42);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        let mut q = Query::new();
        q.set_name(Name::from_ascii(name).unwrap());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        message.add_query(q);
        message
    }

    async fn canned_udp_upstream(rcode: ResponseCode) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.set_response_code(rcode);
            for q in request.queries() {
                response.add_query(q.clone());
            }
            socket
                .send_to(&response.to_vec().unwrap(), from)
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_exchange_returns_decoded_response() {
        let upstream_addr = canned_udp_upstream(ResponseCode::NoError).await;
        let upstream = ForwarderConfig {
            net: Net::Udp,
            address: upstream_addr.to_string(),
        };

        let client = ForwarderClient::default();
        let response = client.exchange(&upstream, &query("ext.test.")).await.unwrap();
        assert_eq!(response.id(), 42);
        assert_eq!(response.response_code(), ResponseCode::NoError);
    }

    #[tokio::test]
    async fn test_error_rcode_is_a_successful_exchange() {
        let upstream_addr = canned_udp_upstream(ResponseCode::NXDomain).await;
        let upstream = ForwarderConfig {
            net: Net::Udp,
            address: upstream_addr.to_string(),
        };

        let client = ForwarderClient::default();
        let response = client.exchange(&upstream, &query("ext.test.")).await.unwrap();
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn test_closed_tcp_port_is_transport_error() {
        // Bind then drop to get a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = ForwarderConfig {
            net: Net::Tcp,
            address: addr.to_string(),
        };

        let client = ForwarderClient::new(Duration::from_millis(500));
        let err = client.exchange(&upstream, &query("ext.test.")).await.unwrap_err();
        assert!(matches!(
            err,
            ForwardError::Io { .. } | ForwardError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_bad_address_is_rejected() {
        let upstream = ForwarderConfig {
            net: Net::Udp,
            address: "not-an-address".to_string(),
        };
        let client = ForwarderClient::default();
        let err = client.exchange(&upstream, &query("ext.test.")).await.unwrap_err();
        assert!(matches!(err, ForwardError::InvalidAddress(_)));
    }
}
