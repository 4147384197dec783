//! Stream discovery: oneshot and continuous resolves.
//!
//! A resolver can be driven in exactly one of two ways. Oneshot runs a
//! single attempt's event loop on the calling thread and returns the
//! gathered descriptors. Continuous spawns one background thread that keeps
//! the attempt running indefinitely while `results()` snapshots the map and
//! ages out streams that have gone silent. Once continuous mode is started
//! the instance cannot be repurposed.

use crate::api_config::ApiConfig;
use crate::cancellation::{Cancellable, CancellableRegistry};
use crate::error::{Error, Result};
use crate::resolve_attempt::{AttemptParams, AttemptState, ResolveAttempt};
use crate::stream_info::{check_query, StreamInfo};
use crate::util::time::{clock, FOREVER};
use log::warn;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

pub struct Resolver {
    cfg: Arc<ApiConfig>,
    /// Multicast groups expanded with the discovery port.
    mcast_endpoints: Vec<SocketAddr>,
    /// Known peers expanded across the configured port range.
    ucast_endpoints: Vec<SocketAddr>,
    registry: CancellableRegistry,
    cancelled: AtomicBool,
    current: Mutex<Option<Arc<AttemptState>>>,
    forget_after: Mutex<f64>,
    background: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::with_config(ApiConfig::global())
    }

    pub fn with_config(cfg: Arc<ApiConfig>) -> Self {
        let mcast_endpoints = cfg
            .multicast_addresses
            .iter()
            .map(|addr| SocketAddr::new(*addr, cfg.multicast_port))
            .collect();

        let mut ucast_endpoints = Vec::new();
        for peer in &cfg.known_peers {
            match (peer.as_str(), cfg.base_port).to_socket_addrs() {
                Ok(addrs) => {
                    for resolved in addrs {
                        for port in cfg.base_port..cfg.base_port.saturating_add(cfg.port_range) {
                            ucast_endpoints.push(SocketAddr::new(resolved.ip(), port));
                        }
                    }
                }
                Err(e) => warn!("cannot resolve known peer '{peer}': {e}"),
            }
        }

        Resolver {
            cfg,
            mcast_endpoints,
            ucast_endpoints,
            registry: CancellableRegistry::new(),
            cancelled: AtomicBool::new(false),
            current: Mutex::new(None),
            forget_after: Mutex::new(FOREVER),
            background: Mutex::new(None),
        }
    }

    /// Composes a query string scoped to this resolver's session id.
    ///
    /// `pred_or_prop` is either a complete predicate (when `value` is absent)
    /// or a property name to be matched against `value`.
    pub fn build_query(&self, pred_or_prop: Option<&str>, value: Option<&str>) -> String {
        let mut query = format!("session_id='{}'", self.cfg.session_id);
        if let Some(pred) = pred_or_prop {
            query.push_str(" and ");
            query.push_str(pred);
            if let Some(value) = value {
                query.push_str(&format!("='{value}'"));
            }
        }
        query
    }

    /// Resolves a query into the descriptors of matching streams.
    ///
    /// Blocks until at least `minimum` unique streams have been seen (but
    /// for no less than `minimum_time` seconds), the timeout fires, or the
    /// resolver is cancelled from another thread. A cancelled resolve
    /// returns an empty vector.
    pub fn resolve_oneshot(
        &self,
        query: &str,
        minimum: usize,
        timeout: f64,
        minimum_time: f64,
    ) -> Result<Vec<StreamInfo>> {
        if self.background.lock().unwrap().is_some() {
            return Err(Error::InvalidState(
                "resolver is already running in continuous mode",
            ));
        }
        check_query(query)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let attempt = {
            let _guard = runtime.enter();
            ResolveAttempt::new(
                self.cfg.clone(),
                &self.ucast_endpoints,
                &self.mcast_endpoints,
                query,
            )?
        };
        let state = attempt.state();
        *self.current.lock().unwrap() = Some(state.clone());
        let registration =
            self.registry.register(Arc::downgrade(&state) as Weak<dyn Cancellable>);

        if !self.cancelled.load(Ordering::SeqCst) {
            runtime.block_on(attempt.run(AttemptParams {
                unicast_wait: self.cfg.unicast_min_rtt,
                multicast_wait: self.cfg.multicast_min_rtt,
                cancel_after: timeout,
                minimum,
                minimum_time,
            }));
        }
        self.registry.unregister(registration);

        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let results = state.results.lock().unwrap();
        Ok(results.values().map(|(info, _)| info.clone()).collect())
    }

    /// Starts a background thread that keeps resolving the query.
    ///
    /// Streams not heard from for `forget_after` seconds are pruned from the
    /// snapshots returned by [`results`](Self::results). The resolver cannot
    /// be reused for other queries afterwards.
    pub fn resolve_continuous(&self, query: &str, forget_after: f64) -> Result<()> {
        let mut background = self.background.lock().unwrap();
        if background.is_some() {
            return Err(Error::InvalidState(
                "resolver is already running in continuous mode",
            ));
        }
        check_query(query)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let attempt = {
            let _guard = runtime.enter();
            ResolveAttempt::new(
                self.cfg.clone(),
                &self.ucast_endpoints,
                &self.mcast_endpoints,
                query,
            )?
        };
        let state = attempt.state();
        *self.current.lock().unwrap() = Some(state.clone());
        *self.forget_after.lock().unwrap() = forget_after;
        self.registry
            .register(Arc::downgrade(&state) as Weak<dyn Cancellable>);

        let params = AttemptParams {
            unicast_wait: self.cfg.unicast_min_rtt + self.cfg.continuous_resolve_interval,
            multicast_wait: self.cfg.multicast_min_rtt + self.cfg.continuous_resolve_interval,
            cancel_after: FOREVER,
            minimum: 0,
            minimum_time: 0.0,
        };
        let handle = thread::Builder::new()
            .name("lsl-resolver".to_string())
            .spawn(move || {
                runtime.block_on(attempt.run(params));
            })?;
        *background = Some(handle);
        Ok(())
    }

    /// Snapshot of the current result set, aged by `forget_after`.
    pub fn results(&self, max_results: usize) -> Result<Vec<StreamInfo>> {
        let state = self
            .current
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidState("no ongoing resolve"))?;
        let expired_before = clock() - *self.forget_after.lock().unwrap();
        let mut results = state.results.lock().unwrap();
        results.retain(|_, (_, last_seen)| *last_seen >= expired_before);
        Ok(results
            .values()
            .take(max_results)
            .map(|(info, _)| info.clone())
            .collect())
    }

    /// Tears down any ongoing resolve and renders the resolver unusable.
    ///
    /// Unblocks a concurrent `resolve_oneshot` from another thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.registry.cancel_all();
        if let Some(state) = self.current.lock().unwrap().clone() {
            state.cancel();
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.background.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("resolver background thread panicked during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Arc<ApiConfig> {
        Arc::new(
            ApiConfig::new()
                .with_allow_ipv6(false)
                .with_multicast_addresses(Vec::new())
                .with_port_range(0, 0),
        )
    }

    #[test]
    fn test_build_query() {
        let resolver = Resolver::with_config(Arc::new(
            ApiConfig::new().with_session_id("lab").with_multicast_addresses(Vec::new()),
        ));
        assert_eq!(resolver.build_query(None, None), "session_id='lab'");
        assert_eq!(
            resolver.build_query(Some("type='EEG'"), None),
            "session_id='lab' and type='EEG'"
        );
        assert_eq!(
            resolver.build_query(Some("name"), Some("BioSemi")),
            "session_id='lab' and name='BioSemi'"
        );
    }

    #[test]
    fn test_oneshot_rejects_bad_query() {
        let resolver = Resolver::with_config(local_config());
        assert!(matches!(
            resolver.resolve_oneshot("name=unquoted", 0, 0.1, 0.0),
            Err(Error::QueryInvalid { .. })
        ));
    }

    #[test]
    fn test_double_start_fails() {
        let resolver = Resolver::with_config(local_config());
        resolver.resolve_continuous("name='X'", 1.0).unwrap();
        assert!(matches!(
            resolver.resolve_continuous("name='X'", 1.0),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            resolver.resolve_oneshot("name='X'", 0, 0.1, 0.0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_results_without_resolve_fails() {
        let resolver = Resolver::with_config(local_config());
        assert!(matches!(
            resolver.results(10),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_cancelled_oneshot_returns_empty() {
        let resolver = Arc::new(Resolver::with_config(local_config()));
        let canceller = Arc::clone(&resolver);
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(100));
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        let results = resolver.resolve_oneshot("name='X'", 0, 30.0, 0.0).unwrap();
        assert!(results.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        handle.join().unwrap();
    }
}
