//! Buffered blocking byte stream over TCP with external cancellation.
//!
//! Reads coalesce into a get buffer with a few bytes of putback headroom;
//! writes collect into a put buffer flushed on overflow or `flush`. A
//! [`cancel_handle`](CancellableStream::cancel_handle) can tear the stream
//! down from any thread: the socket is shut down, which unblocks a reader or
//! writer within the OS wake latency, and the stream refuses further use.

use crate::cancellation::Cancellable;
use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const BUFFER_SIZE: usize = 16384;
const PUTBACK_MAX: usize = 8;

struct Shared {
    sock: TcpStream,
    cancelled: AtomicBool,
    /// Serializes cancellation against connection management so a cancel
    /// issued while the socket is being torn down still observes a closed
    /// socket afterwards.
    lock: Mutex<()>,
}

impl Shared {
    fn cancel(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.sock.shutdown(Shutdown::Both);
    }
}

/// Handle used to cancel a [`CancellableStream`] from another thread.
#[derive(Clone)]
pub struct StreamCancelHandle {
    shared: Arc<Shared>,
}

impl Cancellable for StreamCancelHandle {
    fn cancel(&self) {
        self.shared.cancel();
    }
}

pub struct CancellableStream {
    shared: Arc<Shared>,
    get_buf: Box<[u8]>,
    /// Window of buffered input inside `get_buf`.
    get_begin: usize,
    get_end: usize,
    put_buf: Vec<u8>,
}

impl CancellableStream {
    /// Establishes a connection.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let sock = TcpStream::connect(addr)?;
        Ok(Self::from_stream(sock))
    }

    /// Establishes a connection, giving up after `timeout`.
    pub fn connect_timeout(addr: SocketAddr, timeout: std::time::Duration) -> Result<Self> {
        let sock = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(Self::from_stream(sock))
    }

    /// Wraps an already connected socket.
    pub fn from_stream(sock: TcpStream) -> Self {
        CancellableStream {
            shared: Arc::new(Shared {
                sock,
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
            }),
            get_buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            get_begin: PUTBACK_MAX,
            get_end: PUTBACK_MAX,
            put_buf: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    /// Handle for tearing the stream down from another thread.
    pub fn cancel_handle(&self) -> StreamCancelHandle {
        StreamCancelHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.sock.peer_addr()?)
    }

    /// Number of buffered input bytes available without touching the socket.
    pub fn buffered(&self) -> usize {
        self.get_end - self.get_begin
    }

    /// Pushes up to `PUTBACK_MAX` already-read bytes back into the stream.
    pub fn unread(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.get_begin {
            return Err(Error::InvalidState("putback capacity exceeded"));
        }
        self.get_begin -= bytes.len();
        self.get_buf[self.get_begin..self.get_begin + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn check_cancelled(&self) -> io::Result<()> {
        if self.is_cancelled() {
            Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "stream cancelled",
            ))
        } else {
            Ok(())
        }
    }

    /// Refills the get buffer from the socket. Returns the bytes now
    /// available, 0 at end of stream.
    fn refill(&mut self) -> io::Result<usize> {
        self.check_cancelled()?;
        let n = (&self.shared.sock).read(&mut self.get_buf[PUTBACK_MAX..])?;
        self.check_cancelled()?;
        self.get_begin = PUTBACK_MAX;
        self.get_end = PUTBACK_MAX + n;
        Ok(n)
    }

    fn flush_put_buf(&mut self) -> io::Result<()> {
        self.check_cancelled()?;
        if !self.put_buf.is_empty() {
            (&self.shared.sock).write_all(&self.put_buf)?;
            self.put_buf.clear();
        }
        self.check_cancelled()
    }

    /// Reads a CRLF- or LF-terminated line, stripping the terminator.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.read(&mut byte)? {
                0 => {
                    if line.is_empty() {
                        return Err(Error::PeerDisconnected);
                    }
                    break;
                }
                _ => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Read for CancellableStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.check_cancelled()?;
        if out.is_empty() {
            return Ok(0);
        }
        let buffered = self.buffered();
        if buffered > 0 {
            let n = buffered.min(out.len());
            out[..n].copy_from_slice(&self.get_buf[self.get_begin..self.get_begin + n]);
            self.get_begin += n;
            return Ok(n);
        }
        // large reads bypass the get buffer
        if out.len() >= self.get_buf.len() - PUTBACK_MAX {
            self.check_cancelled()?;
            let n = (&self.shared.sock).read(out)?;
            self.check_cancelled()?;
            return Ok(n);
        }
        let n = self.refill()?;
        if n == 0 {
            return Ok(0);
        }
        let take = n.min(out.len());
        out[..take].copy_from_slice(&self.get_buf[self.get_begin..self.get_begin + take]);
        self.get_begin += take;
        Ok(take)
    }
}

impl Write for CancellableStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_cancelled()?;
        self.put_buf.extend_from_slice(data);
        if self.put_buf.len() >= BUFFER_SIZE {
            self.flush_put_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_put_buf()
    }
}

impl Drop for CancellableStream {
    fn drop(&mut self) {
        if !self.is_cancelled() {
            let _ = self.flush_put_buf();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pair() -> (CancellableStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = CancellableStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_buffered_roundtrip() {
        let (mut client, mut server) = pair();
        client.write_all(b"LSL:fullinfo\r\n").unwrap();
        client.flush().unwrap();

        let mut request = [0u8; 14];
        server.read_exact(&mut request).unwrap();
        assert_eq!(&request, b"LSL:fullinfo\r\n");

        server.write_all(b"hello\r\nworld\r\n").unwrap();
        assert_eq!(client.read_line().unwrap(), "hello");
        assert_eq!(client.read_line().unwrap(), "world");
    }

    #[test]
    fn test_write_is_buffered_until_flush() {
        let (mut client, mut server) = pair();
        client.write_all(b"pending").unwrap();

        server.set_read_timeout(Some(Duration::from_millis(80))).unwrap();
        let mut probe = [0u8; 7];
        assert!(server.read_exact(&mut probe).is_err());

        client.flush().unwrap();
        server.set_read_timeout(None).unwrap();
        server.read_exact(&mut probe).unwrap();
        assert_eq!(&probe, b"pending");
    }

    #[test]
    fn test_putback() {
        let (mut client, mut server) = pair();
        server.write_all(b"abcdef").unwrap();

        let mut first = [0u8; 3];
        client.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"abc");

        client.unread(b"abc").unwrap();
        let mut again = [0u8; 6];
        client.read_exact(&mut again).unwrap();
        assert_eq!(&again, b"abcdef");
    }

    #[test]
    fn test_putback_capacity_is_bounded() {
        let (mut client, _server) = pair();
        assert!(client.unread(&[0u8; PUTBACK_MAX + 1]).is_err());
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let (mut client, _server) = pair();
        let handle = client.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.cancel();
        });

        let started = Instant::now();
        let mut buf = [0u8; 1];
        let outcome = client.read(&mut buf);
        assert!(matches!(outcome, Ok(0) | Err(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();

        // a cancelled stream refuses further use
        assert!(client.read(&mut buf).is_err());
        assert!(client.write_all(b"x").is_err());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (client, _server) = pair();
        let handle = client.cancel_handle();
        handle.cancel();
        handle.cancel();
        assert!(client.is_cancelled());
    }
}
