//! One round of a UDP discovery query: bursted sends, timed gathering of
//! replies, deduplication by stream uid.
//!
//! An attempt owns a receive socket plus a set of sender sockets and runs a
//! single event loop over its burst timers, its deadline, and the receive
//! path. The result map is shared with the owning resolver, which reads it
//! while the attempt is still running in continuous mode.

use crate::api_config::ApiConfig;
use crate::cancellation::Cancellable;
use crate::error::{Error, Result};
use crate::socket_utils;
use crate::stream_info::StreamInfo;
use crate::util::time::{clock, FOREVER};
use log::{debug, warn};
use socket2::{Domain, SockAddr, Socket};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Duration;

/// Resolve results: stream uid mapped to the descriptor and the time it was
/// last heard from.
pub type ResultMap = HashMap<String, (StreamInfo, f64)>;

/// State shared between an attempt's event loop and its owning resolver.
pub struct AttemptState {
    pub results: Mutex<ResultMap>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl AttemptState {
    fn new() -> Arc<Self> {
        Arc::new(AttemptState {
            results: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests teardown; safe from any thread, idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.cancel_notify.notify_one();
        }
    }
}

impl Cancellable for AttemptState {
    fn cancel(&self) {
        AttemptState::cancel(self);
    }
}

/// Timing and termination parameters of one attempt run.
#[derive(Clone, Copy, Debug)]
pub struct AttemptParams {
    /// Spacing between unicast query waves, in seconds.
    pub unicast_wait: f64,
    /// Spacing between multicast query waves, in seconds.
    pub multicast_wait: f64,
    /// Give up this many seconds after the run starts.
    pub cancel_after: f64,
    /// Minimum number of unique results before an early return is allowed;
    /// 0 keeps gathering until the deadline.
    pub minimum: usize,
    /// Keep gathering for at least this many seconds even once `minimum`
    /// results are present.
    pub minimum_time: f64,
}

struct QuerySender {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl QuerySender {
    /// Sends the query to every target; per-target failures are soft.
    async fn send_query(&self, msg: &[u8]) -> bool {
        let mut any_successful = false;
        for target in &self.targets {
            match self.socket.send_to(msg, target).await {
                Ok(_) => any_successful = true,
                Err(e) => debug!("query send to {target} failed: {e}"),
            }
        }
        any_successful
    }
}

pub struct ResolveAttempt {
    cfg: Arc<ApiConfig>,
    state: Arc<AttemptState>,
    recv_socket: UdpSocket,
    unicast_senders: Vec<QuerySender>,
    mcast_senders: Vec<QuerySender>,
    /// Kept for re-checking replies when response validation is on.
    query: Option<String>,
    query_id: String,
    query_msg: String,
}

impl ResolveAttempt {
    /// Opens the sockets and composes the query message.
    ///
    /// Must be called from within a tokio runtime; the attempt's sockets are
    /// driven by that runtime's reactor.
    pub fn new(
        cfg: Arc<ApiConfig>,
        ucast_targets: &[SocketAddr],
        mcast_targets: &[SocketAddr],
        query: &str,
    ) -> Result<Self> {
        if !cfg.allow_ipv4 && !cfg.allow_ipv6 {
            return Err(Error::ConfigInvalid(
                "both IPv4 and IPv6 are disabled".to_string(),
            ));
        }

        // receive socket: IPv6 with dual stack when available, else IPv4
        let (recv, recv_v6) = open_recv_socket(&cfg)?;
        let bind_ip = if recv_v6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let recv_port =
            match socket_utils::bind_udp_in_range(&recv, bind_ip, cfg.base_port, cfg.port_range) {
                Ok(port) => port,
                Err(e) => {
                    warn!(
                        "could not bind to a port in the configured port range; \
                         using a randomly assigned one: {e}"
                    );
                    recv.bind(&SockAddr::from(SocketAddr::new(bind_ip, 0)))?;
                    recv.local_addr()?
                        .as_socket()
                        .map(|a| a.port())
                        .ok_or_else(|| Error::Internal("receive socket has no address".to_string()))?
                }
            };
        recv.set_nonblocking(true)?;
        let recv_socket = UdpSocket::from_std(recv.into())?;

        // split the multicast target list by family; non-multicast v4
        // addresses are assumed to be broadcast addresses
        let mut mcast_v4 = Vec::new();
        let mut mcast_v6 = Vec::new();
        let mut broadcast_targets = Vec::new();
        for ep in mcast_targets {
            match ep.ip() {
                IpAddr::V4(addr) if cfg.allow_ipv4 => {
                    if addr.is_multicast() {
                        mcast_v4.push(*ep);
                    } else {
                        broadcast_targets.push(*ep);
                    }
                }
                IpAddr::V6(addr) if cfg.allow_ipv6 => {
                    if addr.is_multicast() {
                        mcast_v6.push(*ep);
                    } else {
                        debug!("ignoring non-multicast IPv6 discovery target {ep}");
                    }
                }
                _ => {}
            }
        }

        let mut mcast_senders = Vec::new();
        for targets in [mcast_v4, mcast_v6] {
            if targets.is_empty() {
                continue;
            }
            let groups: Vec<IpAddr> = targets.iter().map(|ep| ep.ip()).collect();
            if let Some(sock) = socket_utils::multicast_sender(&cfg, &groups) {
                sock.set_nonblocking(true)?;
                mcast_senders.push(QuerySender {
                    socket: UdpSocket::from_std(sock.into())?,
                    targets,
                });
            }
        }
        if cfg.allow_ipv4 && !broadcast_targets.is_empty() {
            match open_broadcast_socket() {
                Ok(sock) => mcast_senders.push(QuerySender {
                    socket: sock,
                    targets: broadcast_targets,
                }),
                Err(e) => warn!("cannot open UDP broadcast socket for resolves: {e}"),
            }
        }

        let mut unicast_senders = Vec::new();
        for v4 in [true, false] {
            let targets: Vec<SocketAddr> = ucast_targets
                .iter()
                .filter(|ep| ep.is_ipv4() == v4)
                .copied()
                .collect();
            if targets.is_empty() || (v4 && !cfg.allow_ipv4) || (!v4 && !cfg.allow_ipv6) {
                continue;
            }
            let domain = if v4 { Domain::IPV4 } else { Domain::IPV6 };
            let sock = socket_utils::udp_socket(domain)?;
            let bind = if v4 {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            };
            sock.bind(&SockAddr::from(SocketAddr::new(bind, 0)))?;
            sock.set_nonblocking(true)?;
            unicast_senders.push(QuerySender {
                socket: UdpSocket::from_std(sock.into())?,
                targets,
            });
        }

        // the query id is the decimal hash of the query string; replies echo
        // it so stale responses can be discarded
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        let query_id = hasher.finish().to_string();
        let query_msg = format!("LSL:shortinfo\r\n{query}\r\n{recv_port} {query_id}\r\n");
        debug!("waiting for query results (port {recv_port}) for {query}");

        Ok(ResolveAttempt {
            query: cfg.validate_query_responses.then(|| query.to_string()),
            cfg,
            state: AttemptState::new(),
            recv_socket,
            unicast_senders,
            mcast_senders,
            query_id,
            query_msg,
        })
    }

    pub fn state(&self) -> Arc<AttemptState> {
        self.state.clone()
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Drives the attempt to completion: bursts queries on the wave timers
    /// and gathers replies until done or cancelled.
    pub async fn run(self, params: AttemptParams) {
        let started = clock();
        let deadline = started + params.cancel_after.min(FOREVER);
        let atleast_until = started + params.minimum_time;

        // interleave the waves: the multicast wave trails the unicast one by
        // the unicast round-trip estimate
        let multicast_wait = params.multicast_wait
            + if self.unicast_senders.is_empty() {
                0.0
            } else {
                self.cfg.unicast_min_rtt
            };
        let mut mcast_timer = tokio::time::interval(wave_duration(multicast_wait));
        let mut ucast_timer = tokio::time::interval(wave_duration(params.unicast_wait));
        let deadline_sleep = tokio::time::sleep(wave_duration(params.cancel_after.min(FOREVER)));
        tokio::pin!(deadline_sleep);
        let atleast_sleep = tokio::time::sleep(wave_duration(params.minimum_time.max(0.0)));
        tokio::pin!(atleast_sleep);
        let mut atleast_elapsed = params.minimum == 0 || params.minimum_time <= 0.0;

        let mut buf = vec![0u8; 65536];
        loop {
            if self.is_done(deadline, params.minimum, atleast_until) {
                break;
            }
            tokio::select! {
                _ = self.state.cancel_notify.notified() => break,
                _ = &mut deadline_sleep => break,
                _ = &mut atleast_sleep, if !atleast_elapsed => {
                    atleast_elapsed = true;
                }
                _ = mcast_timer.tick(), if !self.mcast_senders.is_empty() => {
                    for sender in &self.mcast_senders {
                        sender.send_query(self.query_msg.as_bytes()).await;
                    }
                }
                _ = ucast_timer.tick(), if !self.unicast_senders.is_empty() => {
                    for sender in &self.unicast_senders {
                        sender.send_query(self.query_msg.as_bytes()).await;
                    }
                }
                received = self.recv_socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => self.handle_datagram(&buf[..len], remote),
                    Err(e) => {
                        if self.state.is_cancelled() {
                            break;
                        }
                        warn!("resolve receive error: {e}");
                    }
                }
            }
        }
        self.do_cancel();
    }

    fn is_done(&self, deadline: f64, minimum: usize, atleast_until: f64) -> bool {
        if self.state.is_cancelled() {
            return true;
        }
        let now = clock();
        if now > deadline {
            return true;
        }
        if minimum == 0 {
            return false;
        }
        let results = self.state.results.lock().unwrap();
        results.len() >= minimum && now >= atleast_until
    }

    /// Processes one reply datagram: check the query-id echo, parse the
    /// shortinfo payload, and merge it into the result map.
    fn handle_datagram(&self, data: &[u8], remote: SocketAddr) {
        let text = String::from_utf8_lossy(data);
        let Some((id_line, payload)) = text.split_once('\n') else {
            return;
        };
        if id_line.trim() != self.query_id {
            return;
        }
        let info = match StreamInfo::from_shortinfo_message(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!("hiccup while processing a resolve reply: {e}");
                return;
            }
        };
        if let Some(query) = &self.query {
            if !info.matches_query(query) {
                debug!("received streaminfo does not match the query");
                return;
            }
        }

        let uid = info.uid().to_string();
        let now = clock();
        let mut results = self.state.results.lock().unwrap();
        let entry = results.entry(uid).or_insert((info, now));
        entry.1 = now;
        // keep the address of the earliest reply per family, since that is
        // the faster route
        match normalize_addr(remote.ip()) {
            IpAddr::V4(addr) => {
                if entry.0.v4_address().is_none() {
                    entry.0.set_v4_address(addr);
                }
            }
            IpAddr::V6(addr) => {
                if entry.0.v6_address().is_none() {
                    entry.0.set_v6_address(addr);
                }
            }
        }
    }

    /// Stops new waves and marks the attempt cancelled; the sockets close
    /// when the attempt is dropped at the end of `run`.
    fn do_cancel(&self) {
        self.state.cancel();
    }
}

/// Dual-stack receive sockets report v4 peers as v4-mapped v6 addresses.
fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}

fn wave_duration(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.001))
}

fn open_recv_socket(cfg: &ApiConfig) -> Result<(Socket, bool)> {
    if cfg.allow_ipv6 {
        match open_recv_v6(cfg.allow_ipv4) {
            Ok(sock) => return Ok((sock, true)),
            Err(e) => {
                warn!("couldn't open IPv6 socket: {e}");
                if !cfg.allow_ipv4 {
                    return Err(Error::ConfigInvalid(
                        "IPv6 support unavailable and IPv4 disabled".to_string(),
                    ));
                }
            }
        }
    }
    Ok((socket_utils::udp_socket(Domain::IPV4)?, false))
}

fn open_recv_v6(allow_ipv4: bool) -> Result<Socket> {
    let sock = socket_utils::udp_socket(Domain::IPV6)?;
    // the IPv6 socket can also receive IPv4 replies unless v6_only is set;
    // setting it fails when the OS is not dual-stack capable
    sock.set_only_v6(!allow_ipv4)
        .map_err(|e| Error::SocketOpenFailed(e.to_string()))?;
    Ok(sock)
}

fn open_broadcast_socket() -> Result<UdpSocket> {
    let sock = socket_utils::udp_socket(Domain::IPV4)?;
    sock.set_broadcast(true)?;
    sock.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    )))?;
    sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(sock.into())?)
}
