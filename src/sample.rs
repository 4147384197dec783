//! Samples, the sample factory, and wire framing of the data feed.
//!
//! A sample is one timestamped row of a stream. On the wire (protocol 1.10
//! and later) each sample is a tag byte, an optional 8-byte timestamp, and
//! the channel values in the negotiated byte order; string channels are
//! length-prefixed. Protocol 1.00 frames go through the portable archive in
//! [`portable`] instead.

use crate::stream_info::ChannelFormat;
use crate::util::endian::{self, ByteOrder};
use bytes::{BufMut, BytesMut};

/// Timestamp value meaning "to be deduced by the receiver".
pub const DEDUCED_TIMESTAMP: f64 = -1.0;

/// Frame tag: the timestamp is deduced from the previous sample.
pub const TAG_DEDUCED_TIMESTAMP: u8 = 1;
/// Frame tag: an explicit timestamp follows.
pub const TAG_TRANSMITTED_TIMESTAMP: u8 = 2;

/// Channel payload of a sample.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    String(Vec<Vec<u8>>),
    /// Blank wakeup sentinel; receivers skip it.
    Ping,
}

#[derive(Clone, Debug)]
pub struct Sample {
    pub timestamp: f64,
    /// Forces the accumulated chunk to be flushed right after this sample.
    pub pushthrough: bool,
    pub data: SampleData,
}

impl Sample {
    pub fn is_ping(&self) -> bool {
        matches!(self.data, SampleData::Ping)
    }

    /// Serializes this sample in the 1.10 binary framing.
    ///
    /// Values are emitted in `to_order`; when `suppress_subnormals` is set,
    /// float values below the normal range are flushed to zero before
    /// transmission.
    pub fn save_streambuf(&self, buf: &mut BytesMut, to_order: ByteOrder, suppress_subnormals: bool) {
        if self.is_ping() {
            return;
        }
        if self.timestamp == DEDUCED_TIMESTAMP {
            buf.put_u8(TAG_DEDUCED_TIMESTAMP);
        } else {
            buf.put_u8(TAG_TRANSMITTED_TIMESTAMP);
            put_f64(buf, self.timestamp, to_order);
        }
        match &self.data {
            SampleData::Float32(values) => {
                for &v in values {
                    let v = if suppress_subnormals && v.is_subnormal() {
                        0.0
                    } else {
                        v
                    };
                    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
                    buf.put_slice(&v.to_ne_bytes());
                }
            }
            SampleData::Double64(values) => {
                for &v in values {
                    let v = if suppress_subnormals && v.is_subnormal() {
                        0.0
                    } else {
                        v
                    };
                    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
                    buf.put_slice(&v.to_ne_bytes());
                }
            }
            SampleData::Int8(values) => {
                for &v in values {
                    buf.put_i8(v);
                }
            }
            SampleData::Int16(values) => {
                for &v in values {
                    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
                    buf.put_slice(&v.to_ne_bytes());
                }
            }
            SampleData::Int32(values) => {
                for &v in values {
                    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
                    buf.put_slice(&v.to_ne_bytes());
                }
            }
            SampleData::Int64(values) => {
                for &v in values {
                    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
                    buf.put_slice(&v.to_ne_bytes());
                }
            }
            SampleData::String(values) => {
                for s in values {
                    put_length(buf, s.len() as u64, to_order);
                    buf.put_slice(s);
                }
            }
            SampleData::Ping => unreachable!(),
        }
    }
}

fn put_f64(buf: &mut BytesMut, v: f64, to_order: ByteOrder) {
    let v = endian::conditional_reverse(v, ByteOrder::native(), to_order);
    buf.put_slice(&v.to_ne_bytes());
}

/// Length prefix: one byte giving the width of the length field, then the
/// length itself in the negotiated byte order.
fn put_length(buf: &mut BytesMut, len: u64, to_order: ByteOrder) {
    let nbytes: usize = if len <= 0xff {
        1
    } else if len <= 0xffff {
        2
    } else if len <= 0xffff_ffff {
        4
    } else {
        8
    };
    buf.put_u8(nbytes as u8);
    let mut tmp = [0u8; 8];
    match to_order {
        ByteOrder::Little => endian::store_le(&mut tmp[..nbytes], len),
        ByteOrder::Big => endian::store_be(&mut tmp[..nbytes], len),
    }
    buf.put_slice(&tmp[..nbytes]);
}

/// Allocates samples matching one stream's schema.
#[derive(Clone, Debug)]
pub struct SampleFactory {
    format: ChannelFormat,
    channel_count: usize,
}

impl SampleFactory {
    pub fn new(format: ChannelFormat, channel_count: usize) -> Self {
        SampleFactory {
            format,
            channel_count,
        }
    }

    pub fn format(&self) -> ChannelFormat {
        self.format
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Allocates a zero-filled sample.
    pub fn new_sample(&self, timestamp: f64, pushthrough: bool) -> Sample {
        let n = self.channel_count;
        let data = match self.format {
            ChannelFormat::Float32 => SampleData::Float32(vec![0.0; n]),
            ChannelFormat::Double64 => SampleData::Double64(vec![0.0; n]),
            ChannelFormat::Int8 => SampleData::Int8(vec![0; n]),
            ChannelFormat::Int16 => SampleData::Int16(vec![0; n]),
            ChannelFormat::Int32 => SampleData::Int32(vec![0; n]),
            ChannelFormat::Int64 => SampleData::Int64(vec![0; n]),
            ChannelFormat::String => SampleData::String(vec![Vec::new(); n]),
        };
        Sample {
            timestamp,
            pushthrough,
            data,
        }
    }

    /// Allocates the blank wakeup sentinel.
    pub fn new_ping(&self, timestamp: f64) -> Sample {
        Sample {
            timestamp,
            pushthrough: true,
            data: SampleData::Ping,
        }
    }

    /// A deterministic fill derived from the channel index and `offset`.
    ///
    /// Receivers regenerate the same sequence to detect transport
    /// corruption, so the rule must stay stable across versions.
    pub fn test_pattern(&self, offset: u32) -> Sample {
        let n = self.channel_count;
        let data = match self.format {
            ChannelFormat::Float32 => {
                SampleData::Float32((0..n).map(|k| pattern_value(offset, k) as f32 + 0.5).collect())
            }
            ChannelFormat::Double64 => SampleData::Double64(
                (0..n).map(|k| pattern_value(offset, k) as f64 + 0.25).collect(),
            ),
            ChannelFormat::Int8 => {
                SampleData::Int8((0..n).map(|k| (pattern_value(offset, k) % 127) as i8).collect())
            }
            ChannelFormat::Int16 => SampleData::Int16(
                (0..n).map(|k| (pattern_value(offset, k) % 32_767) as i16).collect(),
            ),
            ChannelFormat::Int32 => {
                SampleData::Int32((0..n).map(|k| pattern_value(offset, k) as i32).collect())
            }
            ChannelFormat::Int64 => {
                SampleData::Int64((0..n).map(|k| pattern_value(offset, k)).collect())
            }
            ChannelFormat::String => SampleData::String(
                (0..n)
                    .map(|k| pattern_value(offset, k).to_string().into_bytes())
                    .collect(),
            ),
        };
        Sample {
            timestamp: 0.0,
            pushthrough: false,
            data,
        }
    }
}

fn pattern_value(offset: u32, k: usize) -> i64 {
    let seed = offset as i64 + k as i64;
    if seed % 2 == 0 {
        seed
    } else {
        -seed
    }
}

pub mod portable {
    //! Self-contained little-endian archive used by the protocol 1.00 feed.
    //!
    //! Kept only for backward compatibility with legacy consumers; new
    //! sessions negotiate the binary framing above.

    use super::{Sample, SampleData, DEDUCED_TIMESTAMP, TAG_DEDUCED_TIMESTAMP, TAG_TRANSMITTED_TIMESTAMP};
    use bytes::{BufMut, BytesMut};

    /// Archives a length-prefixed byte string.
    pub fn put_string(buf: &mut BytesMut, s: &[u8]) {
        buf.put_u64_le(s.len() as u64);
        buf.put_slice(s);
    }

    /// Archives one sample; all fixed-width values are little-endian.
    pub fn put_sample(buf: &mut BytesMut, sample: &Sample) {
        if sample.is_ping() {
            return;
        }
        if sample.timestamp == DEDUCED_TIMESTAMP {
            buf.put_u8(TAG_DEDUCED_TIMESTAMP);
        } else {
            buf.put_u8(TAG_TRANSMITTED_TIMESTAMP);
            buf.put_f64_le(sample.timestamp);
        }
        match &sample.data {
            SampleData::Float32(values) => {
                for &v in values {
                    buf.put_f32_le(v);
                }
            }
            SampleData::Double64(values) => {
                for &v in values {
                    buf.put_f64_le(v);
                }
            }
            SampleData::Int8(values) => {
                for &v in values {
                    buf.put_i8(v);
                }
            }
            SampleData::Int16(values) => {
                for &v in values {
                    buf.put_i16_le(v);
                }
            }
            SampleData::Int32(values) => {
                for &v in values {
                    buf.put_i32_le(v);
                }
            }
            SampleData::Int64(values) => {
                for &v in values {
                    buf.put_i64_le(v);
                }
            }
            SampleData::String(values) => {
                for s in values {
                    put_string(buf, s);
                }
            }
            SampleData::Ping => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_framing_native_order() {
        let sample = Sample {
            timestamp: 2.0,
            pushthrough: false,
            data: SampleData::Float32(vec![1.5, -2.5]),
        };
        let mut buf = BytesMut::new();
        sample.save_streambuf(&mut buf, ByteOrder::native(), false);
        assert_eq!(buf.len(), 1 + 8 + 2 * 4);
        assert_eq!(buf[0], TAG_TRANSMITTED_TIMESTAMP);
        assert_eq!(&buf[1..9], &2.0f64.to_ne_bytes());
        assert_eq!(&buf[9..13], &1.5f32.to_ne_bytes());
    }

    #[test]
    fn test_numeric_framing_reversed_order() {
        let other = match ByteOrder::native() {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let sample = Sample {
            timestamp: 1.0,
            pushthrough: false,
            data: SampleData::Int32(vec![0x0102_0304]),
        };
        let mut buf = BytesMut::new();
        sample.save_streambuf(&mut buf, other, false);
        let value_bytes = &buf[9..13];
        let native = 0x0102_0304i32.to_ne_bytes();
        let mut reversed = native;
        reversed.reverse();
        assert_eq!(value_bytes, &reversed);
    }

    #[test]
    fn test_deduced_timestamp_is_elided() {
        let sample = Sample {
            timestamp: DEDUCED_TIMESTAMP,
            pushthrough: false,
            data: SampleData::Int8(vec![7]),
        };
        let mut buf = BytesMut::new();
        sample.save_streambuf(&mut buf, ByteOrder::native(), false);
        assert_eq!(&buf[..], &[TAG_DEDUCED_TIMESTAMP, 7]);
    }

    #[test]
    fn test_string_length_prefix() {
        let sample = Sample {
            timestamp: DEDUCED_TIMESTAMP,
            pushthrough: false,
            data: SampleData::String(vec![b"hey".to_vec(), vec![b'x'; 300]]),
        };
        let mut buf = BytesMut::new();
        sample.save_streambuf(&mut buf, ByteOrder::Little, false);
        // tag, then (1, 3, "hey"), then (2, 300le, "xxx...")
        assert_eq!(buf[0], TAG_DEDUCED_TIMESTAMP);
        assert_eq!(buf[1], 1);
        assert_eq!(buf[2], 3);
        assert_eq!(&buf[3..6], b"hey");
        assert_eq!(buf[6], 2);
        assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 300);
        assert_eq!(buf.len(), 9 + 300);
    }

    #[test]
    fn test_subnormal_flush() {
        let sub = f32::from_bits(1); // smallest positive subnormal
        assert!(sub.is_subnormal());
        let sample = Sample {
            timestamp: DEDUCED_TIMESTAMP,
            pushthrough: false,
            data: SampleData::Float32(vec![sub, 1.0]),
        };
        let mut buf = BytesMut::new();
        sample.save_streambuf(&mut buf, ByteOrder::native(), true);
        assert_eq!(&buf[1..5], &0.0f32.to_ne_bytes());
        assert_eq!(&buf[5..9], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn test_ping_serializes_to_nothing() {
        let factory = SampleFactory::new(ChannelFormat::Float32, 4);
        let ping = factory.new_ping(1.0);
        assert!(ping.is_ping());
        let mut buf = BytesMut::new();
        ping.save_streambuf(&mut buf, ByteOrder::native(), false);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_factory_allocation_matches_schema() {
        let factory = SampleFactory::new(ChannelFormat::Int16, 3);
        let sample = factory.new_sample(5.0, true);
        assert!(sample.pushthrough);
        assert_eq!(sample.data, SampleData::Int16(vec![0, 0, 0]));
    }

    #[test]
    fn test_test_pattern_deterministic() {
        let factory = SampleFactory::new(ChannelFormat::Float32, 4);
        let a = factory.test_pattern(4);
        let b = factory.test_pattern(4);
        assert_eq!(a.data, b.data);
        assert_eq!(
            a.data,
            SampleData::Float32(vec![4.5, -4.5, 6.5, -6.5])
        );
        let c = factory.test_pattern(2);
        assert_eq!(c.data, SampleData::Float32(vec![2.5, -2.5, 4.5, -4.5]));
    }

    #[test]
    fn test_portable_archive_layout() {
        let mut buf = BytesMut::new();
        portable::put_string(&mut buf, b"info");
        assert_eq!(&buf[..8], &4u64.to_le_bytes());
        assert_eq!(&buf[8..12], b"info");

        let sample = Sample {
            timestamp: 3.0,
            pushthrough: false,
            data: SampleData::Int16(vec![0x1234]),
        };
        let mut buf = BytesMut::new();
        portable::put_sample(&mut buf, &sample);
        assert_eq!(buf[0], TAG_TRANSMITTED_TIMESTAMP);
        assert_eq!(&buf[1..9], &3.0f64.to_le_bytes());
        assert_eq!(&buf[9..11], &0x1234i16.to_le_bytes());
    }
}
