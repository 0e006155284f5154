//! Reconciliation of configured resolvers against running listeners.
//!
//! The reconciler is the sole owner of the running-listener table. It is a
//! single task driven by a `reload` signal: control-plane writers persist
//! first, then nudge the channel. Each pass walks the persisted resolver
//! configurations, starts or mutates listeners to match (add/update pass),
//! then strips every pattern the configuration no longer claims and stops
//! listeners whose pattern set became empty (cleanup pass).
//!
//! The reload channel is bounded at one entry, so bursts of mutations
//! coalesce into a single pass that reads a store state at least as recent
//! as every mutation that signalled it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::forwarder::ForwarderClient;
use crate::handler::ResolverHandler;
use crate::listener;
use crate::metrics::{self, ReconcileAction};
use crate::mux::{normalize_pattern, PatternMux};
use crate::resolver::{ListenerConfig, ResolverBinding, ResolverConfig};
use crate::store::Store;

/// Authoritative in-memory record of one bound listener.
struct RunningListener {
    listener: ListenerConfig,
    mux: PatternMux,
    /// Patterns currently installed; mirrors the mux table exactly.
    patterns: Vec<String>,
    /// Single-use stop signal; consumed when the listener is retired.
    shutdown: oneshot::Sender<()>,
    /// Per-resolver bindings captured by this listener's handlers. Updated
    /// in place on reload so handlers see fresh forwarder lists.
    bindings: HashMap<String, Arc<ResolverBinding>>,
}

fn pattern_key(listener_key: &str, pattern: &str) -> String {
    format!("{listener_key}-{pattern}")
}

/// Drives the running listener set toward the persisted configuration.
pub struct Reconciler {
    store: Store,
    client: ForwarderClient,
    running: HashMap<String, RunningListener>,
}

impl Reconciler {
    /// Create a reconciler over `store` with default forwarder timeouts.
    pub fn new(store: Store) -> Self {
        Self::with_client(store, ForwarderClient::default())
    }

    /// Create a reconciler with a custom forwarder client.
    pub fn with_client(store: Store, client: ForwarderClient) -> Self {
        Self {
            store,
            client,
            running: HashMap::new(),
        }
    }

    /// Number of currently running listeners.
    pub fn running_listeners(&self) -> usize {
        self.running.len()
    }

    /// Patterns installed on the listener identified by `listener_key`,
    /// sorted; `None` when no such listener is running.
    pub fn installed_patterns(&self, listener_key: &str) -> Option<Vec<String>> {
        self.running.get(listener_key).map(|rl| {
            let mut patterns = rl.patterns.clone();
            patterns.sort();
            patterns
        })
    }

    /// Run until `shutdown` fires or the reload channel closes, reconciling
    /// once immediately and then once per reload signal. All running
    /// listeners are stopped on the way out.
    pub async fn run(mut self, mut reload: mpsc::Receiver<()>, shutdown: CancellationToken) {
        self.reconcile().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = reload.recv() => match signal {
                    Some(()) => self.reconcile().await,
                    None => break,
                },
            }
        }

        self.shutdown_all();
    }

    /// One reconciliation pass. A failed store read aborts the pass without
    /// touching the running set: stale but live beats a partial reshape.
    pub async fn reconcile(&mut self) {
        debug!("reloading resolvers from store");
        let configured = match self.store.read_resolvers() {
            Ok(configured) => configured,
            Err(e) => {
                warn!(error = %e, "could not load resolvers; keeping current listener set");
                return;
            }
        };

        let kept = self.add_pass(&configured).await;
        self.cleanup_pass(&kept);

        let patterns: usize = self.running.values().map(|rl| rl.patterns.len()).sum();
        metrics::record_running_listeners(self.running.len(), patterns);
    }

    /// Start missing listeners and install missing patterns; returns the set
    /// of pattern keys the current configuration claims.
    async fn add_pass(&mut self, configured: &[ResolverConfig]) -> HashSet<String> {
        let mut kept = HashSet::new();

        for resolver in configured {
            for listener in &resolver.listeners {
                let key = listener.key();

                if let Some(running) = self.running.get_mut(&key) {
                    // Hot-reload the forwarder order for every handler this
                    // resolver already has on the listener.
                    if let Some(binding) = running.bindings.get(&resolver.id) {
                        binding.set_forwarders(resolver.forwarders.clone());
                    }

                    for pattern in &resolver.patterns {
                        let pattern = normalize_pattern(pattern);
                        if !running.patterns.contains(&pattern) {
                            let binding = running
                                .bindings
                                .entry(resolver.id.clone())
                                .or_insert_with(|| {
                                    ResolverBinding::new(&resolver.id, resolver.forwarders.clone())
                                })
                                .clone();
                            let handler = Arc::new(ResolverHandler::new(
                                binding,
                                self.store.clone(),
                                self.client.clone(),
                            ));
                            running.mux.register(&pattern, handler);
                            running.patterns.push(pattern.clone());
                            info!(
                                listener = key.as_str(),
                                pattern = pattern.as_str(),
                                resolver = resolver.id.as_str(),
                                "pattern installed"
                            );
                            metrics::record_reconcile(ReconcileAction::PatternAdded);
                        }
                        kept.insert(pattern_key(&key, &pattern));
                    }
                } else {
                    // A resolver with no patterns must not leak a bound
                    // socket nobody can be routed through.
                    if resolver.patterns.is_empty() {
                        debug!(
                            resolver = resolver.id.as_str(),
                            listener = key.as_str(),
                            "resolver declares no patterns; skipping listener"
                        );
                        continue;
                    }

                    match self.start_listener(resolver, listener).await {
                        Ok(running) => {
                            for pattern in &running.patterns {
                                kept.insert(pattern_key(&key, pattern));
                            }
                            self.running.insert(key, running);
                            metrics::record_reconcile(ReconcileAction::ListenerStarted);
                        }
                        Err(e) => {
                            // Not recorded as running; the next reload retries.
                            warn!(
                                listener = key.as_str(),
                                resolver = resolver.id.as_str(),
                                error = %e,
                                "failed to start listener"
                            );
                            metrics::record_reconcile(ReconcileAction::ListenerFailed);
                        }
                    }
                }
            }
        }

        kept
    }

    /// Bind a fresh listener carrying all of `resolver`'s patterns.
    async fn start_listener(
        &self,
        resolver: &ResolverConfig,
        listener: &ListenerConfig,
    ) -> Result<RunningListener, ServerError> {
        let mux = PatternMux::new();
        let binding = ResolverBinding::new(&resolver.id, resolver.forwarders.clone());
        let handler = Arc::new(ResolverHandler::new(
            binding.clone(),
            self.store.clone(),
            self.client.clone(),
        ));

        let mut patterns = Vec::new();
        for pattern in &resolver.patterns {
            let pattern = normalize_pattern(pattern);
            if !patterns.contains(&pattern) {
                mux.register(&pattern, handler.clone());
                patterns.push(pattern);
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let bound = listener::spawn(listener.net, &listener.address, mux.clone(), shutdown_rx).await?;

        info!(
            resolver = resolver.id.as_str(),
            listener = %listener,
            addr = %bound,
            patterns = ?patterns,
            "listener started"
        );

        Ok(RunningListener {
            listener: listener.clone(),
            mux,
            patterns,
            shutdown: shutdown_tx,
            bindings: HashMap::from([(resolver.id.clone(), binding)]),
        })
    }

    /// Drop every pattern the configuration no longer claims and stop
    /// listeners left with none.
    fn cleanup_pass(&mut self, kept: &HashSet<String>) {
        let mut stopped = Vec::new();

        for (key, running) in self.running.iter_mut() {
            let (retained, dropped): (Vec<String>, Vec<String>) = running
                .patterns
                .drain(..)
                .partition(|pattern| kept.contains(&pattern_key(key, pattern)));

            for pattern in &dropped {
                running.mux.remove(pattern);
                info!(
                    listener = key.as_str(),
                    pattern = pattern.as_str(),
                    "pattern removed"
                );
                metrics::record_reconcile(ReconcileAction::PatternRemoved);
            }
            running.patterns = retained;

            // Bindings whose resolver lost its last handler here are dead.
            let live = running.mux.resolver_ids();
            running.bindings.retain(|id, _| live.contains(id));

            if running.patterns.is_empty() {
                stopped.push(key.clone());
            }
        }

        for key in stopped {
            if let Some(running) = self.running.remove(&key) {
                info!(listener = %running.listener, "stopping listener");
                let _ = running.shutdown.send(());
                metrics::record_reconcile(ReconcileAction::ListenerStopped);
            }
        }
    }

    /// Stop every running listener. Used on process shutdown.
    fn shutdown_all(&mut self) {
        for (key, running) in self.running.drain() {
            debug!(listener = key.as_str(), "stopping listener on shutdown");
            let _ = running.shutdown.send(());
        }
    }
}
