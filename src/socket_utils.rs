//! Socket helpers: port-range binding and multicast sender setup.

use crate::api_config::ApiConfig;
use crate::error::{Error, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Opens an unbound UDP socket for the given family.
pub fn udp_socket(domain: Domain) -> Result<Socket> {
    Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::SocketOpenFailed(e.to_string()))
}

/// Binds to the first free port in `[base_port, base_port + port_range)`.
///
/// Returns the bound port, or `BindFailed` when the whole range is taken so
/// the caller can fall back to an OS-assigned port.
pub fn bind_udp_in_range(sock: &Socket, addr: IpAddr, base_port: u16, port_range: u16) -> Result<u16> {
    for port in base_port..base_port.saturating_add(port_range) {
        let target = SocketAddr::new(addr, port);
        if sock.bind(&SockAddr::from(target)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::BindFailed(format!(
        "no free port in [{base_port}, {})",
        base_port.saturating_add(port_range)
    )))
}

/// Binds a listener to the first free port in the range, trying up to
/// `tries` ports, and starts listening.
pub fn tcp_listener_in_range(
    addr: IpAddr,
    base_port: u16,
    tries: u16,
) -> Result<(std::net::TcpListener, u16)> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    for port in base_port..base_port.saturating_add(tries) {
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::SocketOpenFailed(e.to_string()))?;
        if addr.is_ipv6() {
            // the v4 and v6 acceptors are separate objects
            let _ = sock.set_only_v6(true);
        }
        let target = SocketAddr::new(addr, port);
        if sock.bind(&SockAddr::from(target)).is_ok() && sock.listen(128).is_ok() {
            let bound = sock
                .local_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map(|a| a.port())
                .unwrap_or(port);
            debug!("listening on {}", SocketAddr::new(addr, bound));
            return Ok((sock.into(), bound));
        }
    }
    Err(Error::BindFailed(format!(
        "no free listener port in [{base_port}, {})",
        base_port.saturating_add(tries)
    )))
}

/// Opens a multicast sender for one address family and joins the given
/// groups.
///
/// Returns `None` when no group could be joined; individual join failures
/// are soft and logged.
pub fn multicast_sender(cfg: &ApiConfig, groups: &[IpAddr]) -> Option<Socket> {
    let v4 = groups.iter().all(|g| g.is_ipv4());
    let domain = if v4 { Domain::IPV4 } else { Domain::IPV6 };
    let sock = match udp_socket(domain) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open UDP multicast socket for resolves: {e}");
            return None;
        }
    };
    let setup = if v4 {
        sock.set_multicast_ttl_v4(cfg.multicast_ttl)
            .and_then(|_| sock.set_multicast_loop_v4(true))
    } else {
        sock.set_multicast_hops_v6(cfg.multicast_ttl)
            .and_then(|_| sock.set_multicast_loop_v6(true))
    };
    if let Err(e) = setup {
        warn!("cannot configure UDP multicast socket for resolves: {e}");
        return None;
    }
    let mut any_join_succeeded = false;
    for group in groups {
        let joined = match group {
            IpAddr::V4(addr) => sock.join_multicast_v4(addr, &Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(addr) => sock.join_multicast_v6(addr, 0),
        };
        match joined {
            Ok(()) => any_join_succeeded = true,
            Err(e) => warn!("cannot join multicast group {group}: {e}"),
        }
    }
    if !any_join_succeeded {
        return None;
    }
    let bind_addr = if v4 {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    if let Err(e) = sock.bind(&SockAddr::from(SocketAddr::new(bind_addr, 0))) {
        warn!("cannot bind UDP multicast socket for resolves: {e}");
        return None;
    }
    Some(sock)
}

/// Hostname advertised in published stream descriptors.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
