//! Caller-driven blocking fan-out, used by outlets that opt into
//! synchronous transfers instead of the buffered per-session feed.

use log::{error, info, warn};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};

/// Owns the set of connected sockets in sync mode.
///
/// Sessions hand their socket over once the feed header has been sent;
/// afterwards every push on the outlet turns into one blocking write pass
/// over all sockets on the producer's thread.
#[derive(Default)]
pub struct SyncTransferHandler {
    sockets: Mutex<Vec<Arc<TcpStream>>>,
    /// Joined into the active set at the next push.
    pending: Mutex<Vec<Arc<TcpStream>>>,
}

impl SyncTransferHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a socket for inclusion at the next push.
    pub fn add_socket(&self, sock: Arc<TcpStream>) {
        info!("using synchronous blocking transfers for new client session");
        self.pending.lock().unwrap().push(sock);
    }

    /// Writes all buffers to every socket, blocking until each write has
    /// completed or failed. Sockets whose peer vanished are removed.
    pub fn write_all_blocking(&self, bufs: &[&[u8]]) {
        let mut sockets = self.sockets.lock().unwrap();
        sockets.extend(self.pending.lock().unwrap().drain(..));

        let mut any_session_broken = false;
        let mut broken = vec![false; sockets.len()];
        for (i, sock) in sockets.iter().enumerate() {
            for buf in bufs {
                match (&**sock).write_all(buf) {
                    Ok(()) => {}
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionAborted
                        ) =>
                    {
                        warn!("broken pipe / connection reset detected, closing socket");
                        let _ = sock.shutdown(Shutdown::Both);
                        broken[i] = true;
                        any_session_broken = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        info!("socket write interrupted: {e}");
                        break;
                    }
                    Err(e) => {
                        error!("unhandled sync transfer error: {e}");
                        break;
                    }
                }
            }
        }
        if any_session_broken {
            let mut keep = broken.iter().map(|b| !b);
            sockets.retain(|_| keep.next().unwrap_or(true));
        }
    }

    /// Number of sockets currently receiving pushes.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().unwrap().len() + self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_fan_out_to_all_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client_a, server_a) = socket_pair(&listener);
        let (mut client_b, server_b) = socket_pair(&listener);

        let handler = SyncTransferHandler::new();
        handler.add_socket(Arc::new(server_a));
        handler.add_socket(Arc::new(server_b));
        handler.write_all_blocking(&[b"head", b"body"]);
        assert_eq!(handler.socket_count(), 2);

        for client in [&mut client_a, &mut client_b] {
            let mut got = [0u8; 8];
            client.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"headbody");
        }
    }

    #[test]
    fn test_broken_socket_is_removed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (client_a, server_a) = socket_pair(&listener);
        let (client_b, server_b) = socket_pair(&listener);

        let handler = SyncTransferHandler::new();
        handler.add_socket(Arc::new(server_a));
        handler.add_socket(Arc::new(server_b));
        handler.write_all_blocking(&[b"x"]);

        drop(client_a);
        // the first write after the peer vanished may still land in the TCP
        // buffer; keep pushing until the failure is observed
        for _ in 0..50 {
            handler.write_all_blocking(&[b"x"]);
            if handler.socket_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handler.socket_count(), 1);
        drop(client_b);
    }
}
