//! Shared test infrastructure.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::UdpSocket;

use scribe_dns::forwarder::ForwarderClient;
use scribe_dns::handler::ResolverHandler;
use scribe_dns::message::{DnsQuestion, DnsRecord, StoredHeader, StoredMessage};
use scribe_dns::mux::PatternMux;
use scribe_dns::resolver::{
    ForwarderConfig, ListenerConfig, Net, ResolverBinding, ResolverConfig, StoreTag,
};
use scribe_dns::store::Store;

/// Source address stamped on synthetic requests.
pub const CLIENT_ADDR: &str = "127.0.0.1:53210";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed straight into the mux or
/// a resolver handler. The response is serialized via `destructive_emit` and
/// kept as wire bytes, then parsed back with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Store and configuration builders ---

pub fn temp_store() -> (Store, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = Store::open(dir.path()).expect("failed to open store");
    (store, dir)
}

pub fn resolver_config(
    id: &str,
    patterns: &[&str],
    listeners: &[(Net, &str)],
    forwarders: Vec<ForwarderConfig>,
) -> ResolverConfig {
    ResolverConfig {
        id: id.to_string(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        listeners: listeners
            .iter()
            .map(|(net, address)| ListenerConfig {
                net: *net,
                address: address.to_string(),
            })
            .collect(),
        forwarders,
        store: StoreTag::default(),
    }
}

pub fn udp_forwarder(addr: SocketAddr) -> ForwarderConfig {
    ForwarderConfig {
        net: Net::Udp,
        address: addr.to_string(),
    }
}

/// A stored message answering `qname`/`qtype` for the listed resolvers.
pub fn stored_message(resolvers: &[&str], qname: &str, qtype: u16) -> StoredMessage {
    StoredMessage {
        resolvers: resolvers.iter().map(|r| r.to_string()).collect(),
        header: StoredHeader::default(),
        question: vec![DnsQuestion {
            qname: qname.to_string(),
            qtype,
            qclass: 1,
        }],
        answer: Vec::new(),
        ns: Vec::new(),
        extra: Vec::new(),
    }
}

/// An A record with an explicit owner name.
pub fn a_record(name: &str, ip: &str, ttl: u32) -> DnsRecord {
    DnsRecord {
        name: name.to_string(),
        rr_type: 1,
        class: 1,
        ttl,
        rdata: json!(ip),
    }
}

/// Build a handler for `resolver_id` over `store` with the given forwarders
/// and a short exchange deadline so transport errors fail fast.
pub fn test_handler(
    resolver_id: &str,
    store: &Store,
    forwarders: Vec<ForwarderConfig>,
) -> Arc<ResolverHandler> {
    Arc::new(ResolverHandler::new(
        ResolverBinding::new(resolver_id, forwarders),
        store.clone(),
        ForwarderClient::new(Duration::from_millis(500)),
    ))
}

/// A mux with one resolver handler installed under `patterns`.
pub fn test_mux(handler: Arc<ResolverHandler>, patterns: &[&str]) -> PatternMux {
    let mux = PatternMux::new();
    for pattern in patterns {
        mux.register(pattern, handler.clone());
    }
    mux
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    build_message_bytes(name, record_type, id, OpCode::Query)
}

/// Build wire-format bytes with an arbitrary opcode.
pub fn build_message_bytes(name: &str, record_type: RecordType, id: u16, op_code: OpCode) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(op_code);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).expect("invalid test qname"));
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().expect("failed to encode test query")
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` as a listener would hand it to the mux.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    Request::new(msg, CLIENT_ADDR.parse().unwrap(), Protocol::Udp)
}

/// Run one query through the mux and return the parsed response.
pub async fn execute_query(mux: &PatternMux, name: &str, record_type: RecordType, id: u16) -> Message {
    let request = build_request(name, record_type, id);
    let handler = TestResponseHandler::new();
    mux.handle_request(&request, handler.clone()).await;
    handler.into_message()
}

/// Send a real UDP query to a bound listener; `None` on timeout.
pub async fn udp_query(
    server: SocketAddr,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Option<Message> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind query socket");
    let query = build_query_bytes(name, record_type, id);
    socket.send_to(&query, server).await.expect("send query");

    let mut buf = vec![0u8; 4096];
    let received = match tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
        Ok(Ok(received)) => received,
        // Timeout or an ICMP-refused error both mean "nobody answered".
        _ => return None,
    };
    Some(Message::from_vec(&buf[..received]).expect("parse response"))
}

// --- Mock upstream ---

/// How a [`MockUpstream`] answers.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamBehavior {
    /// NOERROR with one A record for the queried name.
    Answer(Ipv4Addr),
    /// NXDOMAIN, optionally claiming recursion is available.
    NxDomain { recursion_available: bool },
    /// Swallow queries without answering.
    Ignore,
}

/// Minimal scripted upstream DNS server on a loopback UDP port.
pub struct MockUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub async fn start(behavior: UpstreamBehavior) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = socket.local_addr().expect("mock upstream addr");
        let hits = Arc::new(AtomicUsize::new(0));

        let task_hits = hits.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);

                if matches!(behavior, UpstreamBehavior::Ignore) {
                    continue;
                }
                let Ok(request) = Message::from_vec(&buf[..len]) else {
                    continue;
                };

                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_recursion_desired(request.recursion_desired());
                for query in request.queries() {
                    response.add_query(query.clone());
                }

                match behavior {
                    UpstreamBehavior::Answer(ip) => {
                        response.set_response_code(ResponseCode::NoError);
                        response.set_recursion_available(true);
                        if let Some(query) = request.queries().first() {
                            response.add_answer(Record::from_rdata(
                                query.name().clone(),
                                60,
                                RData::A(A(ip)),
                            ));
                        }
                    }
                    UpstreamBehavior::NxDomain {
                        recursion_available,
                    } => {
                        response.set_response_code(ResponseCode::NXDomain);
                        response.set_recursion_available(recursion_available);
                    }
                    UpstreamBehavior::Ignore => unreachable!(),
                }

                let Ok(bytes) = response.to_vec() else { continue };
                let _ = socket.send_to(&bytes, from).await;
            }
        });

        Self { addr, hits, task }
    }

    /// Number of queries this upstream has received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// This upstream as a UDP forwarder config.
    pub fn forwarder(&self) -> ForwarderConfig {
        udp_forwarder(self.addr)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback UDP port that nothing is listening on: exchanges against it
/// fail fast with a connection-refused style error.
pub async fn dead_upstream_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind probe socket");
    let addr = socket.local_addr().expect("probe addr");
    drop(socket);
    addr
}

// --- Response assertions ---

/// Extract A record addresses from the answer section.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert a NOERROR response carrying exactly the expected A records.
pub fn assert_a_response(msg: &Message, expected_ips: &[Ipv4Addr]) {
    assert_response_code(msg, ResponseCode::NoError);
    let mut actual = extract_a_ips(msg);
    actual.sort();
    let mut expected: Vec<Ipv4Addr> = expected_ips.to_vec();
    expected.sort();
    assert_eq!(
        actual, expected,
        "A records mismatch.\nactual:   {actual:?}\nexpected: {expected:?}"
    );
}
