//! Metrics instrumentation for scribe-dns.
//!
//! All metrics are prefixed with `scribe_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a served DNS query.
pub fn record_query(qtype: &str, outcome: QueryOutcome, duration: std::time::Duration) {
    let outcome_str = match outcome {
        QueryOutcome::LocalHit => "local_hit",
        QueryOutcome::WildcardHit => "wildcard_hit",
        QueryOutcome::Forwarded => "forwarded",
        QueryOutcome::NxDomain => "nxdomain",
        QueryOutcome::ServFail => "servfail",
        QueryOutcome::NotImplemented => "notimp",
        QueryOutcome::FormError => "formerr",
        QueryOutcome::NoHandler => "no_handler",
    };

    counter!("scribe_dns.query.count", "type" => qtype.to_string(), "outcome" => outcome_str)
        .increment(1);
    histogram!("scribe_dns.query.duration.seconds", "type" => qtype.to_string())
        .record(duration.as_secs_f64());
}

/// How a DNS query was answered.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome {
    /// Answered from the store by exact match.
    LocalHit,
    /// Answered from the store by wildcard match.
    WildcardHit,
    /// Answered by an upstream forwarder.
    Forwarded,
    /// No local record and no definitive upstream answer.
    NxDomain,
    /// Store hard error or unanswerable internal failure.
    ServFail,
    /// Unsupported opcode.
    NotImplemented,
    /// Request could not be parsed.
    FormError,
    /// No pattern matched the query name.
    NoHandler,
}

/// Record one upstream exchange attempt.
pub fn record_forward(net: &str, result: ForwardResult) {
    let result_str = match result {
        ForwardResult::Answer => "answer",
        ForwardResult::NegativeAnswer => "negative_answer",
        ForwardResult::Rejected => "rejected",
        ForwardResult::TransportError => "transport_error",
    };

    counter!("scribe_dns.forward.count", "net" => net.to_string(), "result" => result_str)
        .increment(1);
}

/// Result of a single upstream exchange.
#[derive(Debug, Clone, Copy)]
pub enum ForwardResult {
    /// Upstream returned NOERROR.
    Answer,
    /// Upstream returned an authoritative negative (NXDOMAIN with RA).
    NegativeAnswer,
    /// Upstream answered with a non-definitive rcode.
    Rejected,
    /// Exchange failed at the transport layer.
    TransportError,
}

/// Record a reconciliation action.
pub fn record_reconcile(action: ReconcileAction) {
    let action_str = match action {
        ReconcileAction::ListenerStarted => "listener_started",
        ReconcileAction::ListenerStopped => "listener_stopped",
        ReconcileAction::ListenerFailed => "listener_failed",
        ReconcileAction::PatternAdded => "pattern_added",
        ReconcileAction::PatternRemoved => "pattern_removed",
    };

    counter!("scribe_dns.reconcile.action.count", "action" => action_str).increment(1);
}

/// Reconciliation actions.
#[derive(Debug, Clone, Copy)]
pub enum ReconcileAction {
    /// A new listener was bound and its serve task started.
    ListenerStarted,
    /// A listener was shut down after losing its last pattern.
    ListenerStopped,
    /// A listener failed to bind.
    ListenerFailed,
    /// A pattern handler was installed into a mux.
    PatternAdded,
    /// A pattern handler was removed from a mux.
    PatternRemoved,
}

/// Record the size of the running listener set after a reconciliation pass.
pub fn record_running_listeners(listeners: usize, patterns: usize) {
    gauge!("scribe_dns.reconcile.listeners").set(listeners as f64);
    gauge!("scribe_dns.reconcile.patterns").set(patterns as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
