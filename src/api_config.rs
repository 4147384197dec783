//! Frozen process-wide configuration snapshot.
//!
//! Loading from files or the environment happens elsewhere; this record is
//! immutable once built. Components take an `Arc<ApiConfig>` explicitly and
//! fall back to the process-wide snapshot installed by [`ApiConfig::global`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<ApiConfig>> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Whether IPv4 sockets may be used.
    pub allow_ipv4: bool,
    /// Whether IPv6 sockets may be used.
    pub allow_ipv6: bool,
    /// Multicast groups queried during discovery (both families).
    pub multicast_addresses: Vec<IpAddr>,
    /// Port the multicast queries are addressed to.
    pub multicast_port: u16,
    /// TTL / hop limit on outgoing multicast queries.
    pub multicast_ttl: u32,
    /// Hosts queried directly via unicast, expanded across the port range.
    pub known_peers: Vec<String>,
    /// Session id stamped into published stream descriptors.
    pub session_id: String,
    /// First port of the range used for data and discovery sockets.
    pub base_port: u16,
    /// Number of ports in the range starting at `base_port`.
    pub port_range: u16,
    /// Minimum round-trip estimate for unicast queries, in seconds.
    pub unicast_min_rtt: f64,
    /// Minimum round-trip estimate for multicast queries, in seconds.
    pub multicast_min_rtt: f64,
    /// Extra wave spacing used by continuous resolves, in seconds.
    pub continuous_resolve_interval: f64,
    /// Protocol version spoken by servers created with this config.
    pub use_protocol_version: u32,
    /// SO_SNDBUF for data connections; 0 leaves the OS default.
    pub socket_send_buffer_size: usize,
    /// SO_RCVBUF for data connections; 0 leaves the OS default.
    pub socket_receive_buffer_size: usize,
    /// Whether resolve replies are re-checked against the query.
    pub validate_query_responses: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            allow_ipv4: true,
            allow_ipv6: true,
            multicast_addresses: vec![
                IpAddr::V4(Ipv4Addr::new(224, 0, 0, 183)),
                IpAddr::V4(Ipv4Addr::new(239, 255, 172, 215)),
                IpAddr::V6(Ipv6Addr::new(
                    0xff02, 0x113d, 0x6fdd, 0x2c17, 0xa643, 0xffe2, 0x1bd1, 0x3cd2,
                )),
            ],
            multicast_port: 16571,
            multicast_ttl: 1,
            known_peers: Vec::new(),
            session_id: "default".to_string(),
            base_port: 16572,
            port_range: 32,
            unicast_min_rtt: 0.75,
            multicast_min_rtt: 0.5,
            continuous_resolve_interval: 0.5,
            use_protocol_version: 110,
            socket_send_buffer_size: 0,
            socket_receive_buffer_size: 0,
            validate_query_responses: false,
        }
    }
}

impl ApiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide snapshot, installing the defaults on first use.
    pub fn global() -> Arc<ApiConfig> {
        GLOBAL.get_or_init(|| Arc::new(ApiConfig::default())).clone()
    }

    /// Installs this config as the process-wide snapshot.
    ///
    /// Only the first install wins; the snapshot is never re-initialized
    /// during runtime. Returns the effective global config.
    pub fn install(self) -> Arc<ApiConfig> {
        GLOBAL.get_or_init(|| Arc::new(self)).clone()
    }

    pub fn with_allow_ipv4(mut self, allow: bool) -> Self {
        self.allow_ipv4 = allow;
        self
    }

    pub fn with_allow_ipv6(mut self, allow: bool) -> Self {
        self.allow_ipv6 = allow;
        self
    }

    pub fn with_multicast_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.multicast_addresses = addresses;
        self
    }

    pub fn with_multicast_port(mut self, port: u16) -> Self {
        self.multicast_port = port;
        self
    }

    pub fn with_multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn with_known_peers(mut self, peers: Vec<String>) -> Self {
        self.known_peers = peers;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_port_range(mut self, base_port: u16, port_range: u16) -> Self {
        self.base_port = base_port;
        self.port_range = port_range;
        self
    }

    pub fn with_unicast_min_rtt(mut self, rtt: f64) -> Self {
        self.unicast_min_rtt = rtt;
        self
    }

    pub fn with_multicast_min_rtt(mut self, rtt: f64) -> Self {
        self.multicast_min_rtt = rtt;
        self
    }

    pub fn with_continuous_resolve_interval(mut self, interval: f64) -> Self {
        self.continuous_resolve_interval = interval;
        self
    }

    pub fn with_validate_query_responses(mut self, validate: bool) -> Self {
        self.validate_query_responses = validate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = ApiConfig::default();
        assert!(cfg.allow_ipv4 && cfg.allow_ipv6);
        assert!(!cfg.multicast_addresses.is_empty());
        assert!(cfg.port_range > 0);
        assert_eq!(cfg.use_protocol_version, 110);
    }

    #[test]
    fn test_builder_chain() {
        let cfg = ApiConfig::new()
            .with_allow_ipv6(false)
            .with_known_peers(vec!["127.0.0.1".to_string()])
            .with_port_range(17000, 4)
            .with_session_id("lab");
        assert!(!cfg.allow_ipv6);
        assert_eq!(cfg.known_peers.len(), 1);
        assert_eq!(cfg.base_port, 17000);
        assert_eq!(cfg.session_id, "lab");
    }
}
