//! TCP data transport, server side: dual-stack acceptor, per-client session
//! state machine, and the blocking transfer worker.
//!
//! A note on memory ownership: the server holds strong handles to sessions
//! only while they sit in the in-flight set; sessions hold a `Weak` handle
//! back to the server and upgrade it on demand, proceeding with close when
//! the upgrade fails. Each session that reaches the transfer phase hands its
//! socket to one dedicated OS thread which owns a strong handle to the
//! session, so the session lives until that thread exits.

use crate::api_config::ApiConfig;
use crate::cancellation::Cancellable;
use crate::error::{Error, Result};
use crate::sample::{portable, SampleFactory};
use crate::send_buffer::{ConsumerQueue, SendBuffer};
use crate::socket_utils;
use crate::stream_info::StreamInfo;
use crate::sync_transfer::SyncTransferHandler;
use crate::util::endian::{self, ByteOrder};
use crate::util::time::clock;
use bytes::{BufMut, BytesMut};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Serves one outlet's data feed to any number of TCP consumers.
pub struct TcpServer {
    cfg: Arc<ApiConfig>,
    info: StreamInfo,
    /// Server-wide chunk cap in samples; 0 leaves chunking to the clients.
    chunk_size: usize,
    send_buffer: Arc<SendBuffer>,
    factory: Arc<SampleFactory>,
    shortinfo_msg: String,
    fullinfo_msg: String,
    sync_handler: Option<SyncTransferHandler>,
    listener_v4: Mutex<Option<std::net::TcpListener>>,
    listener_v6: Mutex<Option<std::net::TcpListener>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    inflight: Mutex<HashMap<u64, Arc<ClientSession>>>,
    next_session_id: AtomicU64,
}

impl TcpServer {
    /// Binds the acceptors and freezes the stream descriptor.
    ///
    /// Each enabled family tries up to 10 ports in the configured range; a
    /// family that fails to bind is dropped with a warning, and construction
    /// fails only when no family is left.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<ApiConfig>,
        mut info: StreamInfo,
        send_buffer: Arc<SendBuffer>,
        factory: Arc<SampleFactory>,
        chunk_size: usize,
        allow_v4: bool,
        allow_v6: bool,
        do_sync: bool,
    ) -> Result<Arc<Self>> {
        info.set_session_id(cfg.session_id.clone());
        info.reset_uid();
        info.set_created_at(clock());
        info.set_hostname(socket_utils::hostname());

        let tries = cfg.port_range.min(10).max(1);
        let listener_v4 = if allow_v4 && cfg.allow_ipv4 {
            match socket_utils::tcp_listener_in_range(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                cfg.base_port,
                tries,
            ) {
                Ok((listener, port)) => {
                    info.set_v4_data_port(port);
                    debug!("created IPv4 TCP acceptor for {} @ port {port}", info.name());
                    Some(listener)
                }
                Err(e) => {
                    warn!("failed to create IPv4 acceptor: {e}");
                    None
                }
            }
        } else {
            None
        };
        let listener_v6 = if allow_v6 && cfg.allow_ipv6 {
            match socket_utils::tcp_listener_in_range(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                cfg.base_port,
                tries,
            ) {
                Ok((listener, port)) => {
                    info.set_v6_data_port(port);
                    debug!("created IPv6 TCP acceptor for {} @ port {port}", info.name());
                    Some(listener)
                }
                Err(e) => {
                    warn!("failed to create IPv6 acceptor: {e}");
                    None
                }
            }
        } else {
            None
        };
        if listener_v4.is_none() && listener_v6.is_none() {
            return Err(Error::BindFailed(
                "failed to instantiate socket acceptors for the TCP server".to_string(),
            ));
        }

        let shortinfo_msg = info.to_shortinfo_message();
        let fullinfo_msg = info.to_fullinfo_message();
        Ok(Arc::new(TcpServer {
            cfg,
            info,
            chunk_size,
            send_buffer,
            factory,
            shortinfo_msg,
            fullinfo_msg,
            sync_handler: do_sync.then(SyncTransferHandler::new),
            listener_v4: Mutex::new(listener_v4),
            listener_v6: Mutex::new(listener_v6),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            inflight: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }))
    }

    /// The served descriptor, with the bound data ports filled in.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn shortinfo_msg(&self) -> &str {
        &self.shortinfo_msg
    }

    pub fn fullinfo_msg(&self) -> &str {
        &self.fullinfo_msg
    }

    /// Starts accepting connections. Must be called inside a tokio runtime.
    pub fn begin_serving(self: &Arc<Self>) -> Result<()> {
        for slot in [&self.listener_v4, &self.listener_v6] {
            if let Some(listener) = slot.lock().unwrap().take() {
                listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(listener)?;
                let server = Arc::clone(self);
                tokio::spawn(server.accept_loop(listener));
            }
        }
        Ok(())
    }

    /// Stops accepting, aborts in-flight sessions, and wakes any transfer
    /// thread that is blocked waiting for a sample.
    pub fn end_serving(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        self.close_inflight_sessions();
        self.send_buffer
            .push_sample(Arc::new(self.factory.new_ping(clock())));
    }

    /// Blocking fan-out push for outlets in synchronous mode.
    pub fn write_all_blocking(&self, bufs: &[&[u8]]) -> Result<()> {
        match &self.sync_handler {
            Some(handler) => {
                handler.write_all_blocking(bufs);
                Ok(())
            }
            None => Err(Error::InvalidState("server is not in synchronous mode")),
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted data connection from {peer}");
                        self.configure_socket(&stream);
                        self.clone().start_session(stream);
                    }
                    Err(e) => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!("unhandled accept error: {e}");
                    }
                }
            }
        }
    }

    fn configure_socket(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY: {e}");
        }
        let sockref = socket2::SockRef::from(stream);
        if self.cfg.socket_send_buffer_size > 0 {
            if let Err(e) = sockref.set_send_buffer_size(self.cfg.socket_send_buffer_size) {
                warn!("cannot set socket send buffer size: {e}");
            }
        }
        if self.cfg.socket_receive_buffer_size > 0 {
            if let Err(e) = sockref.set_recv_buffer_size(self.cfg.socket_receive_buffer_size) {
                warn!("cannot set socket receive buffer size: {e}");
            }
        }
    }

    fn start_session(self: Arc<Self>, stream: TcpStream) {
        let session = Arc::new(ClientSession::new(Arc::downgrade(&self)));
        let id = self.register_session(session.clone());
        session.id.store(id, Ordering::SeqCst);
        tokio::spawn(async move {
            match session.clone().process(stream).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() || matches!(e, Error::Cancelled) => {
                    debug!("client session ended: {e}");
                }
                Err(e) => warn!("client session ended with error: {e}"),
            }
            if !session.transfer_detached.load(Ordering::SeqCst) {
                if let Some(serv) = session.serv.upgrade() {
                    serv.unregister_session(session.id.load(Ordering::SeqCst));
                }
            }
        });
    }

    fn register_session(&self, session: Arc<ClientSession>) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.inflight.lock().unwrap().insert(id, session);
        id
    }

    fn unregister_session(&self, id: u64) {
        self.inflight.lock().unwrap().remove(&id);
    }

    fn close_inflight_sessions(&self) {
        let sessions: Vec<Arc<ClientSession>> =
            self.inflight.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.cancel();
        }
    }
}

/// Negotiated transfer parameters handed to the worker thread.
struct TransferParams {
    data_protocol_version: u32,
    use_byte_order: ByteOrder,
    suppress_subnormals: bool,
    max_samples_per_chunk: usize,
}

/// Parsed streamfeed request.
struct FeedRequest {
    protocol_version: u32,
    uid: Option<String>,
    headers: Vec<(String, String)>,
    /// `(max_buffered, chunk_granularity)` read from the 1.00 parameter line.
    legacy: Option<(i64, usize)>,
}

/// Active session with one TCP client.
struct ClientSession {
    serv: Weak<TcpServer>,
    id: AtomicU64,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    /// Present once the socket has been handed to blocking I/O.
    std_sock: Mutex<Option<Arc<std::net::TcpStream>>>,
    /// Set once a transfer worker owns the session's teardown.
    transfer_detached: AtomicBool,
}

impl Cancellable for ClientSession {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        if let Some(sock) = self.std_sock.lock().unwrap().as_ref() {
            let _ = sock.shutdown(Shutdown::Both);
        }
    }
}

impl ClientSession {
    fn new(serv: Weak<TcpServer>) -> Self {
        ClientSession {
            serv,
            id: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            std_sock: Mutex::new(None),
            transfer_detached: AtomicBool::new(false),
        }
    }

    /// Runs the session state machine: parse the request, negotiate, send
    /// the feed header, and hand off to the transfer worker.
    async fn process(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let command = self.read_request_line(&mut reader).await?;

        if command == "LSL:shortinfo" {
            let query = self.read_request_line(&mut reader).await?;
            let Some(serv) = self.serv.upgrade() else {
                return Ok(());
            };
            if serv.info.matches_query(&query) {
                reader
                    .get_mut()
                    .write_all(serv.shortinfo_msg.as_bytes())
                    .await?;
            } else {
                debug!("got a shortinfo request for a non-matching query");
            }
            Ok(())
        } else if command == "LSL:fullinfo" {
            let Some(serv) = self.serv.upgrade() else {
                return Ok(());
            };
            reader
                .get_mut()
                .write_all(serv.fullinfo_msg.as_bytes())
                .await?;
            Ok(())
        } else if command == "LSL:streamfeed" {
            // 1.00 feed: one parameter line, no negotiation block
            let line = self.read_request_line(&mut reader).await?;
            let mut parts = line.split_whitespace();
            let max_buffered: i64 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::ProtocolViolation("missing feed parameters".to_string()))?;
            let chunk_granularity: usize = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            self.start_streamfeed(
                reader,
                FeedRequest {
                    protocol_version: 100,
                    uid: None,
                    headers: Vec::new(),
                    legacy: Some((max_buffered, chunk_granularity)),
                },
            )
            .await
        } else if let Some(rest) = command.strip_prefix("LSL:streamfeed/") {
            let mut parts = rest.split_whitespace();
            let protocol_version: u32 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(|| {
                Error::ProtocolViolation(format!("bad streamfeed request '{command}'"))
            })?;
            let uid = parts.next().map(|s| s.to_string());
            if protocol_version >= 110 {
                let headers = self.read_feed_headers(&mut reader).await?;
                self.start_streamfeed(
                    reader,
                    FeedRequest {
                        protocol_version,
                        uid,
                        headers,
                        legacy: None,
                    },
                )
                .await
            } else {
                // pre-1.10 versioned feeds send the two feed parameters
                // followed by a blank line
                let mut param_text = String::new();
                loop {
                    let line = self.read_request_line(&mut reader).await?;
                    if line.is_empty() {
                        break;
                    }
                    param_text.push_str(&line);
                    param_text.push(' ');
                }
                let mut parts = param_text.split_whitespace();
                let max_buffered: i64 = parts.next().and_then(|v| v.parse().ok()).ok_or_else(
                    || Error::ProtocolViolation("missing feed parameters".to_string()),
                )?;
                let chunk_granularity: usize =
                    parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                self.start_streamfeed(
                    reader,
                    FeedRequest {
                        protocol_version,
                        uid,
                        headers: Vec::new(),
                        legacy: Some((max_buffered, chunk_granularity)),
                    },
                )
                .await
            }
        } else {
            Err(Error::ProtocolViolation(format!(
                "unrecognized request method '{command}'"
            )))
        }
    }

    /// Key-value lines up to the first empty line; keys are lowercased and
    /// `;` comments stripped.
    async fn read_feed_headers(
        &self,
        reader: &mut BufReader<TcpStream>,
    ) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        loop {
            let line = self.read_request_line(reader).await?;
            if line.is_empty() {
                break;
            }
            let line = line
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) => {
                    headers.push((key.trim().to_string(), value.trim().to_string()));
                }
                None => debug!("request line '{line}' contained no key-value pair"),
            }
        }
        Ok(headers)
    }

    async fn start_streamfeed(
        self: Arc<Self>,
        mut reader: BufReader<TcpStream>,
        request: FeedRequest,
    ) -> Result<()> {
        let Some(serv) = self.serv.upgrade() else {
            return Ok(());
        };
        let server_ver = serv.cfg.use_protocol_version;

        if request.protocol_version / 100 > server_ver / 100 {
            debug!("got a request for a too new protocol version");
            return send_status(&mut reader, server_ver, "505 Version not supported").await;
        }
        if let Some(uid) = &request.uid {
            if uid != serv.info.uid() {
                return send_status(&mut reader, server_ver, "404 Not found").await;
            }
        }

        let format = serv.info.channel_format();

        // client capabilities, with conservative assumptions as defaults
        let mut client_byte_order: u32 = ByteOrder::Little.as_u32();
        let mut client_endian_performance = 0.0f64;
        let mut client_has_ieee754_floats = true;
        let mut client_supports_subnormals = true;
        let mut client_protocol_version = request.protocol_version;
        let mut client_value_size = format.value_bytes();
        let mut max_buffered: i64 = 0;
        let mut chunk_granularity: usize = 0;

        if let Some((legacy_max, legacy_chunk)) = request.legacy {
            max_buffered = legacy_max;
            chunk_granularity = legacy_chunk;
            client_protocol_version = 100;
        } else {
            for (key, value) in &request.headers {
                match key.as_str() {
                    "native-byte-order" => {
                        if let Ok(v) = value.parse() {
                            client_byte_order = v;
                        }
                    }
                    "endian-performance" => {
                        if let Ok(v) = value.parse() {
                            client_endian_performance = v;
                        }
                    }
                    "has-ieee754-floats" => client_has_ieee754_floats = parse_bool(value),
                    "supports-subnormals" => client_supports_subnormals = parse_bool(value),
                    "value-size" => {
                        if let Ok(v) = value.parse() {
                            client_value_size = v;
                        }
                    }
                    "max-buffer-length" => {
                        if let Ok(v) = value.parse() {
                            max_buffered = v;
                        }
                    }
                    "max-chunk-length" => {
                        if let Ok(v) = value.parse() {
                            chunk_granularity = v;
                        }
                    }
                    "protocol-version" => {
                        if let Ok(v) = value.parse() {
                            client_protocol_version = v;
                        }
                    }
                    other => debug!("ignoring unknown feed header '{other}'"),
                }
            }
        }

        // least common denominator, downgraded to the portable 1.00 format
        // when a binary conversion we cannot express would be involved
        let mut data_protocol_version = server_ver.min(client_protocol_version);
        if format.is_numeric() && client_value_size != format.value_bytes() {
            data_protocol_version = 100;
        }
        if !client_has_ieee754_floats {
            data_protocol_version = 100;
        }

        let mut use_byte_order = ByteOrder::native();
        let mut suppress_subnormals = false;
        if data_protocol_version >= 110 {
            // transmit in the client's byte order exactly when our ordering
            // differs, the reversal is defined and wide enough to matter,
            // and we convert faster than the client would
            if client_byte_order != ByteOrder::native().as_u32()
                && endian::can_reverse(client_value_size)
                && client_value_size > 1
                && endian::measure_reverse_performance() > client_endian_performance
            {
                if let Ok(order) = ByteOrder::try_from(client_byte_order) {
                    use_byte_order = order;
                }
            }
            suppress_subnormals = format.has_subnormals() && !client_supports_subnormals;
        }

        // feed header plus the two corruption-detection test patterns
        let mut feedbuf = BytesMut::with_capacity(16384);
        if data_protocol_version >= 110 {
            let header = format!(
                "LSL/{server_ver} 200 OK\r\nUID: {}\r\nByte-Order: {use_byte_order}\r\n\
                 Suppress-Subnormals: {}\r\nData-Protocol-Version: {data_protocol_version}\r\n\r\n",
                serv.info.uid(),
                if suppress_subnormals { 1 } else { 0 },
            );
            feedbuf.put_slice(header.as_bytes());
        } else {
            portable::put_string(&mut feedbuf, serv.shortinfo_msg.as_bytes());
        }
        let pattern_factory = SampleFactory::new(format, serv.info.channel_count() as usize);
        for pattern in [4u32, 2] {
            let sample = pattern_factory.test_pattern(pattern);
            if data_protocol_version >= 110 {
                sample.save_streambuf(&mut feedbuf, use_byte_order, suppress_subnormals);
            } else {
                portable::put_sample(&mut feedbuf, &sample);
            }
        }

        // hand the socket over to blocking I/O for the transfer worker
        let std_stream = reader.into_inner().into_std()?;
        std_stream.set_nonblocking(false)?;
        let sock = Arc::new(std_stream);
        *self.std_sock.lock().unwrap() = Some(sock.clone());
        if self.cancelled.load(Ordering::SeqCst) {
            let _ = sock.shutdown(Shutdown::Both);
            return Err(Error::Cancelled);
        }

        let sync_mode = serv.sync_handler.is_some();
        let queue = if !sync_mode && max_buffered > 0 {
            Some(serv.send_buffer.new_consumer(max_buffered as usize))
        } else {
            None
        };
        let max_samples_per_chunk = if chunk_granularity > 0 {
            chunk_granularity
        } else if serv.chunk_size > 0 {
            serv.chunk_size
        } else {
            usize::MAX
        };
        let params = TransferParams {
            data_protocol_version,
            use_byte_order,
            suppress_subnormals,
            max_samples_per_chunk,
        };

        self.transfer_detached.store(true, Ordering::SeqCst);
        let session = Arc::clone(&self);
        let serv_weak = self.serv.clone();
        let spawned = thread::Builder::new()
            .name("lsl-transfer".to_string())
            .spawn(move || transfer_worker(serv_weak, session, sock, feedbuf, queue, params, sync_mode));
        if let Err(e) = spawned {
            self.transfer_detached.store(false, Ordering::SeqCst);
            return Err(Error::Internal(format!("cannot spawn transfer thread: {e}")));
        }
        Ok(())
    }

    async fn read_request_line(&self, reader: &mut BufReader<TcpStream>) -> Result<String> {
        let mut line = String::new();
        tokio::select! {
            _ = self.cancel_notify.notified() => return Err(Error::Cancelled),
            read = reader.read_line(&mut line) => {
                if read? == 0 {
                    return Err(Error::PeerDisconnected);
                }
            }
        }
        Ok(line.trim().to_string())
    }
}

async fn send_status(
    reader: &mut BufReader<TcpStream>,
    server_ver: u32,
    status: &str,
) -> Result<()> {
    let message = format!("LSL/{server_ver} {status}\r\n");
    reader.get_mut().write_all(message.as_bytes()).await?;
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "y")
}

/// Pops samples off the session's cursor, serializes them, and writes the
/// accumulated chunk whenever a pushthrough sample or the chunk cap forces a
/// flush. Runs on its own OS thread so the blocking pop never parks an
/// executor; any write error or a vanished server ends the loop.
fn transfer_worker(
    serv: Weak<TcpServer>,
    session: Arc<ClientSession>,
    sock: Arc<std::net::TcpStream>,
    mut feedbuf: BytesMut,
    queue: Option<ConsumerQueue>,
    params: TransferParams,
    sync_mode: bool,
) {
    if let Err(e) = (&*sock).write_all(&feedbuf) {
        debug!("failed to send feed header: {e}");
    } else {
        feedbuf.clear();
        if sync_mode {
            if let Some(serv) = serv.upgrade() {
                if let Some(handler) = &serv.sync_handler {
                    handler.add_socket(sock.clone());
                }
                serv.unregister_session(session.id.load(Ordering::SeqCst));
            }
            return;
        }
        if let Some(queue) = queue {
            let mut samples_in_chunk = 0usize;
            while serv.upgrade().is_some() && !session.cancelled.load(Ordering::SeqCst) {
                let Some(sample) = queue.pop_sample() else {
                    break;
                };
                // blank samples are wakeup notifiers from end_serving
                if sample.is_ping() {
                    continue;
                }
                if params.data_protocol_version >= 110 {
                    sample.save_streambuf(
                        &mut feedbuf,
                        params.use_byte_order,
                        params.suppress_subnormals,
                    );
                } else {
                    portable::put_sample(&mut feedbuf, &sample);
                }
                samples_in_chunk += 1;
                if sample.pushthrough || samples_in_chunk >= params.max_samples_per_chunk {
                    if let Err(e) = (&*sock).write_all(&feedbuf) {
                        debug!("sample transfer ended: {e}");
                        break;
                    }
                    feedbuf.clear();
                    samples_in_chunk = 0;
                }
            }
        }
    }
    let _ = sock.shutdown(Shutdown::Both);
    if let Some(serv) = serv.upgrade() {
        serv.unregister_session(session.id.load(Ordering::SeqCst));
    }
}
