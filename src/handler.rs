//! Per-resolver DNS request handler.
//!
//! One handler instance is installed into a listener mux for each of its
//! resolver's patterns. It owns the full answer path: opcode dispatch, the
//! store-backed pipeline, forwarder fallback, and synthesis of the wire
//! response from whichever source answered.

use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, Record};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::forwarder::ForwarderClient;
use crate::message::{DnsRecord, StoredHeader, StoredMessage};
use crate::metrics::{self, QueryOutcome, Timer};
use crate::resolver::{InternalLookup, Resolver, ResolverBinding};
use crate::store::Store;

/// Handles queries for one resolver. Captures the resolver's binding, so a
/// forwarder hot-reload by the reconciler is visible on the next request.
pub struct ResolverHandler {
    resolver: Resolver,
}

impl ResolverHandler {
    pub fn new(binding: Arc<ResolverBinding>, store: Store, client: ForwarderClient) -> Self {
        Self {
            resolver: Resolver::new(binding, store, client),
        }
    }

    /// Id of the resolver this handler answers for.
    pub fn resolver_id(&self) -> &str {
        self.resolver.binding().id()
    }

    /// Answer one request and write the response.
    pub async fn handle<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        if request.header().op_code() != OpCode::Query {
            warn!(
                resolver = self.resolver_id(),
                opcode = ?request.header().op_code(),
                "opcode not supported"
            );
            metrics::record_query("-", QueryOutcome::NotImplemented, timer.elapsed());
            return respond_with_code(request, &mut response_handle, ResponseCode::NotImp).await;
        }

        let request_info = match request.request_info() {
            Ok(info) => info,
            Err(e) => {
                error!(resolver = self.resolver_id(), error = %e, "failed to parse request");
                metrics::record_query("-", QueryOutcome::FormError, timer.elapsed());
                return respond_with_code(request, &mut response_handle, ResponseCode::FormErr)
                    .await;
            }
        };

        let query = &request_info.query;
        let qname = query.name().to_string();
        let qtype = u16::from(query.query_type());
        let qtype_str = format!("{:?}", query.query_type());

        debug!(
            resolver = self.resolver_id(),
            qname = qname.as_str(),
            qtype = qtype_str.as_str(),
            client = %request.src(),
            "query received"
        );

        let internal_rcode = match self.resolver.lookup(qtype, &qname) {
            InternalLookup::Answer { message, wildcard } => {
                let outcome = if wildcard {
                    QueryOutcome::WildcardHit
                } else {
                    QueryOutcome::LocalHit
                };
                metrics::record_query(&qtype_str, outcome, timer.elapsed());
                return self
                    .respond_stored(request, &mut response_handle, &message)
                    .await;
            }
            InternalLookup::NotFound => ResponseCode::NXDomain,
            InternalLookup::Failed => ResponseCode::ServFail,
        };

        // The store could not answer; fall back to the forwarders.
        let mut forward_query = Query::new();
        forward_query.set_name(Name::from(query.name().clone()));
        forward_query.set_query_type(query.query_type());
        forward_query.set_query_class(query.query_class());
        let forward_request = build_forward_request(request, forward_query);
        if let Some(upstream_response) = self.resolver.forward(&forward_request).await {
            debug!(
                resolver = self.resolver_id(),
                qname = qname.as_str(),
                rcode = ?upstream_response.response_code(),
                "answered by forwarder"
            );
            metrics::record_query(&qtype_str, QueryOutcome::Forwarded, timer.elapsed());
            return self
                .respond_upstream(request, &mut response_handle, &upstream_response)
                .await;
        }

        let outcome = match internal_rcode {
            ResponseCode::ServFail => QueryOutcome::ServFail,
            _ => QueryOutcome::NxDomain,
        };
        metrics::record_query(&qtype_str, outcome, timer.elapsed());
        respond_with_code(request, &mut response_handle, internal_rcode).await
    }

    /// Synthesize a response from a stored message.
    async fn respond_stored<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        stored: &StoredMessage,
    ) -> ResponseInfo {
        let header = stored_header(request, &stored.header);

        let answers = self.encode_section(&stored.answer);
        let name_servers = self.encode_section(&stored.ns);
        let additionals = self.encode_section(&stored.extra);

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            answers.iter(),
            name_servers.iter(),
            &[],
            additionals.iter(),
        );

        send(request, response_handle, response).await
    }

    /// Relay an upstream response under the client's transaction.
    async fn respond_upstream<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        upstream: &Message,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(upstream.response_code());
        header.set_authoritative(upstream.authoritative());
        header.set_truncated(upstream.truncated());
        header.set_recursion_available(upstream.recursion_available());
        header.set_authentic_data(upstream.authentic_data());
        header.set_checking_disabled(upstream.checking_disabled());

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            upstream.answers().iter(),
            upstream.name_servers().iter(),
            &[],
            upstream.additionals().iter(),
        );

        send(request, response_handle, response).await
    }

    fn encode_section(&self, records: &[DnsRecord]) -> Vec<Record> {
        records
            .iter()
            .filter_map(|record| match record.to_record() {
                Ok(wire) => Some(wire),
                Err(e) => {
                    warn!(
                        resolver = self.resolver_id(),
                        name = record.name.as_str(),
                        rtype = record.rr_type,
                        error = %e,
                        "skipping unencodable stored record"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Response header for a stored answer: transaction fields echoed from the
/// request, flags and rcode taken from the store.
fn stored_header(request: &Request, stored: &StoredHeader) -> Header {
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(stored.authoritative);
    header.set_truncated(stored.truncated);
    header.set_recursion_available(stored.recursion_available);
    header.set_authentic_data(stored.authenticated_data);
    header.set_checking_disabled(stored.checking_disabled);
    header.set_response_code(ResponseCode::from(0, stored.rcode as u8));
    header
}

/// Fresh query for the upstream exchange, carrying the client's transaction
/// id and recursion bit.
fn build_forward_request(request: &Request, query: Query) -> Message {
    let mut message = Message::new();
    message.set_id(request.header().id());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(request.header().recursion_desired());
    message.add_query(query);
    message
}

/// Respond with an empty message carrying `code`.
pub(crate) async fn respond_with_code<R: ResponseHandler>(
    request: &Request,
    response_handle: &mut R,
    code: ResponseCode,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(code);

    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.build(header, &[], &[] as &[Record], &[], &[]);

    send(request, response_handle, response).await
}

async fn send<'a, R: ResponseHandler>(
    request: &Request,
    response_handle: &mut R,
    response: hickory_server::authority::MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
) -> ResponseInfo {
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, "failed to send response");
            ResponseInfo::from(*request.header())
        }
    }
}
