//! Pattern multiplexer: routes queries to per-resolver handlers.
//!
//! Each listener owns one mux, so each bound endpoint has its own pattern
//! namespace. Dispatch follows DNS longest-suffix precedence: a query for
//! `a.b.example.` prefers a handler registered for `b.example.` over one for
//! `example.` over the root pattern `.`. The table is mutated by the
//! reconciler while the listener task dispatches through it; the interior
//! lock is held only for table access, never across an await.

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::handler::{respond_with_code, ResolverHandler};
use crate::metrics::{self, QueryOutcome, Timer};

/// Cloneable handle to one listener's pattern table.
#[derive(Clone, Default)]
pub struct PatternMux {
    inner: Arc<RwLock<HashMap<String, Arc<ResolverHandler>>>>,
}

impl PatternMux {
    /// Create an empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler under `pattern`, replacing any previous handler for
    /// the same pattern.
    pub fn register(&self, pattern: &str, handler: Arc<ResolverHandler>) {
        self.inner
            .write()
            .insert(normalize_pattern(pattern), handler);
    }

    /// Remove the handler registered under `pattern`. Returns whether one
    /// was installed.
    pub fn remove(&self, pattern: &str) -> bool {
        self.inner.write().remove(&normalize_pattern(pattern)).is_some()
    }

    /// Whether a handler is registered under exactly `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.inner.read().contains_key(&normalize_pattern(pattern))
    }

    /// Number of installed patterns.
    pub fn pattern_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Resolver ids with at least one installed handler.
    pub fn resolver_ids(&self) -> HashSet<String> {
        self.inner
            .read()
            .values()
            .map(|handler| handler.resolver_id().to_string())
            .collect()
    }

    /// Find the handler with the longest registered suffix of `qname`.
    fn lookup(&self, qname: &str) -> Option<Arc<ResolverHandler>> {
        let name = normalize_pattern(qname);
        let table = self.inner.read();

        let mut suffix = name.as_str();
        loop {
            if let Some(handler) = table.get(suffix) {
                return Some(handler.clone());
            }
            match suffix.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => suffix = rest,
                _ => break,
            }
        }
        table.get(".").cloned()
    }
}

#[async_trait]
impl RequestHandler for PatternMux {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        let request_info = match request.request_info() {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to parse request");
                metrics::record_query("-", QueryOutcome::FormError, timer.elapsed());
                return respond_with_code(request, &mut response_handle, ResponseCode::FormErr)
                    .await;
            }
        };

        let qname = request_info.query.name().to_string();
        match self.lookup(&qname) {
            Some(handler) => handler.handle(request, response_handle).await,
            None => {
                // No pattern covers this name on this listener; answer as an
                // empty zone would.
                debug!(qname = qname.as_str(), "no handler for query name");
                metrics::record_query("-", QueryOutcome::NoHandler, timer.elapsed());
                respond_with_code(request, &mut response_handle, ResponseCode::NXDomain).await
            }
        }
    }
}

/// Lowercase and anchor a pattern or query name with a trailing dot. The
/// bare root stays `.`.
pub(crate) fn normalize_pattern(pattern: &str) -> String {
    let mut normalized = pattern.to_ascii_lowercase();
    if !normalized.ends_with('.') {
        normalized.push('.');
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ForwarderClient;
    use crate::resolver::ResolverBinding;
    use crate::store::Store;
    use tempfile::TempDir;

    fn handler(id: &str, store: &Store) -> Arc<ResolverHandler> {
        Arc::new(ResolverHandler::new(
            ResolverBinding::new(id, vec![]),
            store.clone(),
            ForwarderClient::default(),
        ))
    }

    fn mux_with(patterns: &[(&str, &str)]) -> (PatternMux, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mux = PatternMux::new();
        for (pattern, id) in patterns {
            mux.register(pattern, handler(id, &store));
        }
        (mux, dir)
    }

    fn resolved(mux: &PatternMux, qname: &str) -> Option<String> {
        mux.lookup(qname).map(|h| h.resolver_id().to_string())
    }

    #[test]
    fn test_longest_suffix_wins() {
        let (mux, _dir) = mux_with(&[
            ("example.", "shallow"),
            ("b.example.", "deep"),
            (".", "root"),
        ]);

        assert_eq!(resolved(&mux, "a.b.example.").as_deref(), Some("deep"));
        assert_eq!(resolved(&mux, "x.example.").as_deref(), Some("shallow"));
        assert_eq!(resolved(&mux, "other.org.").as_deref(), Some("root"));
        assert_eq!(resolved(&mux, ".").as_deref(), Some("root"));
    }

    #[test]
    fn test_no_match_without_root_pattern() {
        let (mux, _dir) = mux_with(&[("example.com.", "r1")]);
        assert_eq!(resolved(&mux, "other.org."), None);
        assert_eq!(resolved(&mux, "example.com.x."), None);
    }

    #[test]
    fn test_patterns_are_case_insensitive_and_dot_anchored() {
        let (mux, _dir) = mux_with(&[("Example.COM", "r1")]);
        assert!(mux.contains("example.com."));
        assert_eq!(resolved(&mux, "HOST.example.com.").as_deref(), Some("r1"));
    }

    #[test]
    fn test_remove_uninstalls_handler() {
        let (mux, _dir) = mux_with(&[("example.com.", "r1")]);
        assert!(mux.remove("example.com."));
        assert!(!mux.remove("example.com."));
        assert_eq!(mux.pattern_count(), 0);
        assert_eq!(resolved(&mux, "host.example.com."), None);
    }

    #[test]
    fn test_resolver_ids_reflect_installed_handlers() {
        let (mux, _dir) = mux_with(&[("a.", "r1"), ("b.", "r1"), ("c.", "r2")]);
        let ids = mux.resolver_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("r1") && ids.contains("r2"));
    }
}
