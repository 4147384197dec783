//! Stream descriptors and their compact wire serializations.
//!
//! A `StreamInfo` is immutable once published: the schema fields never
//! change after the first advertisement, and the `uid` is regenerated for
//! every outlet instance so duplicate replies can be collapsed network-wide.

use crate::error::{Error, Result};
use rand::Rng;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Sample value format of a stream's channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelFormat {
    Float32,
    Double64,
    String,
    Int8,
    Int16,
    Int32,
    Int64,
}

impl ChannelFormat {
    /// Bytes per value for numeric formats; 0 for variable-length strings.
    pub fn value_bytes(self) -> usize {
        match self {
            ChannelFormat::Float32 => 4,
            ChannelFormat::Double64 => 8,
            ChannelFormat::String => 0,
            ChannelFormat::Int8 => 1,
            ChannelFormat::Int16 => 2,
            ChannelFormat::Int32 => 4,
            ChannelFormat::Int64 => 8,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ChannelFormat::String)
    }

    /// Whether the format can carry subnormal values.
    pub fn has_subnormals(self) -> bool {
        matches!(self, ChannelFormat::Float32 | ChannelFormat::Double64)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Double64 => "double64",
            ChannelFormat::String => "string",
            ChannelFormat::Int8 => "int8",
            ChannelFormat::Int16 => "int16",
            ChannelFormat::Int32 => "int32",
            ChannelFormat::Int64 => "int64",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" => Ok(ChannelFormat::Float32),
            "double64" => Ok(ChannelFormat::Double64),
            "string" => Ok(ChannelFormat::String),
            "int8" => Ok(ChannelFormat::Int8),
            "int16" => Ok(ChannelFormat::Int16),
            "int32" => Ok(ChannelFormat::Int32),
            "int64" => Ok(ChannelFormat::Int64),
            other => Err(Error::ProtocolViolation(format!(
                "unknown channel format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of a published time-series stream.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    name: String,
    stype: String,
    channel_count: u32,
    nominal_srate: f64,
    channel_format: ChannelFormat,
    source_id: String,
    uid: String,
    session_id: String,
    hostname: String,
    created_at: f64,
    v4_address: Option<Ipv4Addr>,
    v4_data_port: u16,
    v6_address: Option<Ipv6Addr>,
    v6_data_port: u16,
    /// Free-form XML subtree describing channels, manufacturer, and so on.
    desc: String,
}

impl StreamInfo {
    pub fn new(
        name: impl Into<String>,
        stype: impl Into<String>,
        channel_count: u32,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::ConfigInvalid(
                "stream name must not be empty".to_string(),
            ));
        }
        if channel_count == 0 {
            return Err(Error::ConfigInvalid(
                "channel count must be at least 1".to_string(),
            ));
        }
        if !(nominal_srate >= 0.0) {
            return Err(Error::ConfigInvalid(
                "nominal sampling rate must be non-negative".to_string(),
            ));
        }
        Ok(StreamInfo {
            name,
            stype: stype.into(),
            channel_count,
            nominal_srate,
            channel_format,
            source_id: source_id.into(),
            uid: fresh_uid(),
            session_id: String::new(),
            hostname: String::new(),
            created_at: 0.0,
            v4_address: None,
            v4_data_port: 0,
            v6_address: None,
            v6_data_port: 0,
            desc: String::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stype(&self) -> &str {
        &self.stype
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    pub fn nominal_srate(&self) -> f64 {
        self.nominal_srate
    }

    pub fn channel_format(&self) -> ChannelFormat {
        self.channel_format
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn v4_address(&self) -> Option<Ipv4Addr> {
        self.v4_address
    }

    pub fn v4_data_port(&self) -> u16 {
        self.v4_data_port
    }

    pub fn v6_address(&self) -> Option<Ipv6Addr> {
        self.v6_address
    }

    pub fn v6_data_port(&self) -> u16 {
        self.v6_data_port
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Bytes per sample for numeric formats (0 for string streams).
    pub fn sample_bytes(&self) -> usize {
        self.channel_format.value_bytes() * self.channel_count as usize
    }

    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    pub fn set_created_at(&mut self, created_at: f64) {
        self.created_at = created_at;
    }

    pub fn set_v4_address(&mut self, addr: Ipv4Addr) {
        self.v4_address = Some(addr);
    }

    pub fn set_v4_data_port(&mut self, port: u16) {
        self.v4_data_port = port;
    }

    pub fn set_v6_address(&mut self, addr: Ipv6Addr) {
        self.v6_address = Some(addr);
    }

    pub fn set_v6_data_port(&mut self, port: u16) {
        self.v6_data_port = port;
    }

    pub fn set_desc(&mut self, desc: impl Into<String>) {
        self.desc = desc.into();
    }

    /// Generates a new instance uid, used when an outlet republishes.
    pub fn reset_uid(&mut self) {
        self.uid = fresh_uid();
    }

    /// Evaluates a conjunctive `key='value'` query against this descriptor.
    ///
    /// An empty query matches everything; an unparseable query matches
    /// nothing.
    pub fn matches_query(&self, query: &str) -> bool {
        match parse_query(query) {
            Ok(clauses) => clauses
                .iter()
                .all(|(key, value)| self.property(key).as_deref() == Some(value.as_str())),
            Err(_) => false,
        }
    }

    fn property(&self, key: &str) -> Option<String> {
        match key {
            "name" => Some(self.name.clone()),
            "type" => Some(self.stype.clone()),
            "channel_count" => Some(self.channel_count.to_string()),
            "channel_format" => Some(self.channel_format.to_string()),
            "nominal_srate" => Some(format_f64(self.nominal_srate)),
            "source_id" => Some(self.source_id.clone()),
            "uid" => Some(self.uid.clone()),
            "session_id" => Some(self.session_id.clone()),
            "hostname" => Some(self.hostname.clone()),
            _ => None,
        }
    }

    /// Compact serialization sent in discovery replies and shortinfo
    /// responses.
    pub fn to_shortinfo_message(&self) -> String {
        let mut msg = String::with_capacity(512);
        msg.push_str("<?xml version=\"1.0\"?><info>");
        write_tag(&mut msg, "name", &self.name);
        write_tag(&mut msg, "type", &self.stype);
        write_tag(&mut msg, "channel_count", &self.channel_count.to_string());
        write_tag(&mut msg, "nominal_srate", &format_f64(self.nominal_srate));
        write_tag(&mut msg, "channel_format", self.channel_format.as_str());
        write_tag(&mut msg, "source_id", &self.source_id);
        write_tag(&mut msg, "created_at", &format_f64(self.created_at));
        write_tag(&mut msg, "uid", &self.uid);
        write_tag(&mut msg, "session_id", &self.session_id);
        write_tag(&mut msg, "hostname", &self.hostname);
        let v4addr = self.v4_address.map(|a| a.to_string()).unwrap_or_default();
        write_tag(&mut msg, "v4address", &v4addr);
        write_tag(&mut msg, "v4data_port", &self.v4_data_port.to_string());
        let v6addr = self.v6_address.map(|a| a.to_string()).unwrap_or_default();
        write_tag(&mut msg, "v6address", &v6addr);
        write_tag(&mut msg, "v6data_port", &self.v6_data_port.to_string());
        msg.push_str("</info>");
        msg
    }

    /// Extended serialization with the free-form `desc` subtree included.
    pub fn to_fullinfo_message(&self) -> String {
        let mut msg = self.to_shortinfo_message();
        let insert_at = msg.len() - "</info>".len();
        let desc = if self.desc.is_empty() {
            "<desc></desc>".to_string()
        } else {
            format!("<desc>{}</desc>", self.desc)
        };
        msg.insert_str(insert_at, &desc);
        msg
    }

    /// Parses a shortinfo message back into a descriptor.
    pub fn from_shortinfo_message(msg: &str) -> Result<Self> {
        let name = read_tag(msg, "name")
            .ok_or_else(|| Error::ProtocolViolation("shortinfo lacks <name>".to_string()))?;
        let channel_count: u32 = read_tag(msg, "channel_count")
            .ok_or_else(|| Error::ProtocolViolation("shortinfo lacks <channel_count>".to_string()))?
            .parse()
            .map_err(|_| Error::ProtocolViolation("bad <channel_count>".to_string()))?;
        let format_str = read_tag(msg, "channel_format")
            .ok_or_else(|| Error::ProtocolViolation("shortinfo lacks <channel_format>".to_string()))?;
        let channel_format = ChannelFormat::from_str(&format_str)?;
        let nominal_srate: f64 = read_tag(msg, "nominal_srate")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .map_err(|_| Error::ProtocolViolation("bad <nominal_srate>".to_string()))?;

        let mut info = StreamInfo::new(
            name,
            read_tag(msg, "type").unwrap_or_default(),
            channel_count,
            nominal_srate,
            channel_format,
            read_tag(msg, "source_id").unwrap_or_default(),
        )?;
        if let Some(uid) = read_tag(msg, "uid") {
            info.uid = uid;
        }
        info.session_id = read_tag(msg, "session_id").unwrap_or_default();
        info.hostname = read_tag(msg, "hostname").unwrap_or_default();
        info.created_at = read_tag(msg, "created_at")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        info.v4_address = read_tag(msg, "v4address").and_then(|s| s.parse().ok());
        info.v4_data_port = read_tag(msg, "v4data_port")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        info.v6_address = read_tag(msg, "v6address").and_then(|s| s.parse().ok());
        info.v6_data_port = read_tag(msg, "v6data_port")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(info)
    }
}

fn fresh_uid() -> String {
    let raw: u128 = rand::rng().random();
    format!("{raw:032x}")
}

fn format_f64(v: f64) -> String {
    // integral rates print without a trailing ".0" so queries can say
    // nominal_srate='100'
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn write_tag(out: &mut String, tag: &str, value: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

fn read_tag(msg: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = msg.find(&open)? + open.len();
    let end = msg[start..].find(&close)? + start;
    let raw = &msg[start..end];
    Some(
        raw.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&"),
    )
}

/// Validates a query without evaluating it.
pub fn check_query(query: &str) -> Result<()> {
    parse_query(query).map(|_| ()).map_err(|reason| Error::QueryInvalid {
        query: query.to_string(),
        reason,
    })
}

/// Splits a query into `(key, value)` clauses joined by `and`.
fn parse_query(query: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let mut clauses = Vec::new();
    for part in query.split(" and ") {
        let part = part.trim();
        if part.is_empty() {
            return Err("empty clause".to_string());
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("clause '{part}' lacks '='"))?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(format!("clause '{part}' lacks a property name"));
        }
        if value.len() < 2 || !value.starts_with('\'') || !value.ends_with('\'') {
            return Err(format!("value in clause '{part}' must be single-quoted"));
        }
        clauses.push((
            key.to_ascii_lowercase(),
            value[1..value.len() - 1].to_string(),
        ));
    }
    Ok(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> StreamInfo {
        let mut info = StreamInfo::new(
            "BioSemi",
            "EEG",
            8,
            100.0,
            ChannelFormat::Float32,
            "dev-42",
        )
        .unwrap();
        info.set_session_id("default");
        info.set_hostname("labhost");
        info.set_created_at(12345.5);
        info.set_v4_data_port(16572);
        info
    }

    #[test]
    fn test_new_rejects_bad_schemas() {
        assert!(StreamInfo::new("", "EEG", 1, 0.0, ChannelFormat::Float32, "").is_err());
        assert!(StreamInfo::new("x", "EEG", 0, 0.0, ChannelFormat::Float32, "").is_err());
        assert!(StreamInfo::new("x", "EEG", 1, -1.0, ChannelFormat::Float32, "").is_err());
    }

    #[test]
    fn test_uids_are_unique_per_instance() {
        let a = sample_info();
        let mut b = sample_info();
        assert_ne!(a.uid(), b.uid());
        let before = b.uid().to_string();
        b.reset_uid();
        assert_ne!(b.uid(), before);
    }

    #[test]
    fn test_shortinfo_roundtrip() {
        let info = sample_info();
        let msg = info.to_shortinfo_message();
        let parsed = StreamInfo::from_shortinfo_message(&msg).unwrap();
        assert_eq!(parsed.name(), "BioSemi");
        assert_eq!(parsed.stype(), "EEG");
        assert_eq!(parsed.channel_count(), 8);
        assert_eq!(parsed.nominal_srate(), 100.0);
        assert_eq!(parsed.channel_format(), ChannelFormat::Float32);
        assert_eq!(parsed.uid(), info.uid());
        assert_eq!(parsed.hostname(), "labhost");
        assert_eq!(parsed.v4_data_port(), 16572);
        assert_eq!(parsed.v4_address(), None);
    }

    #[test]
    fn test_fullinfo_contains_desc() {
        let mut info = sample_info();
        info.set_desc("<manufacturer>ACME</manufacturer>");
        let msg = info.to_fullinfo_message();
        assert!(msg.contains("<desc><manufacturer>ACME</manufacturer></desc>"));
        assert!(msg.ends_with("</info>"));
    }

    #[test]
    fn test_escaping_roundtrip() {
        let mut info = sample_info();
        info.name = "a<b&c".to_string();
        let parsed = StreamInfo::from_shortinfo_message(&info.to_shortinfo_message()).unwrap();
        assert_eq!(parsed.name(), "a<b&c");
    }

    #[test]
    fn test_matches_query() {
        let info = sample_info();
        assert!(info.matches_query("name='BioSemi'"));
        assert!(info.matches_query("name='BioSemi' and type='EEG'"));
        assert!(info.matches_query("channel_count='8' and nominal_srate='100'"));
        assert!(info.matches_query(""));
        assert!(!info.matches_query("name='OtherStream'"));
        assert!(!info.matches_query("name='BioSemi' and type='Audio'"));
        assert!(!info.matches_query("garbage"));
    }

    #[test]
    fn test_check_query() {
        assert!(check_query("name='BioSemi' and type='EEG'").is_ok());
        assert!(check_query("").is_ok());
        assert!(matches!(
            check_query("name=BioSemi"),
            Err(Error::QueryInvalid { .. })
        ));
        assert!(check_query("name='x' and ").is_err());
    }
}
