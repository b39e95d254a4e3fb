//! Dataplane wire format
//!
//! The single codec used by both the segmenter and the reassembler:
//! - LB header: balancer steering, stripped by hardware before delivery
//! - RE header: reassembly addressing, always present on delivered datagrams
//! - Sync header: periodic send-rate report to the balancer
//!
//! All multi-byte fields are big-endian. The layout is fixed by the balancer
//! firmware, so headers are packed by hand rather than run through a
//! serialization framework.

use bytes::Bytes;

use crate::{Error, Result};

/// Magic prefix of the balancer header
pub const LB_MAGIC: [u8; 2] = *b"LB";

/// Magic prefix of the sync header
pub const SYNC_MAGIC: [u8; 2] = *b"LC";

/// Balancer header version
pub const LB_VERSION: u8 = 2;

/// Reassembly header version (carried in the high nibble)
pub const RE_VERSION: u8 = 1;

/// Sync header version
pub const SYNC_VERSION: u8 = 1;

/// Balancer header length (bytes)
pub const LB_HDR_LEN: usize = 16;

/// Reassembly header length (bytes)
pub const RE_HDR_LEN: usize = 20;

/// Sync message length (bytes)
pub const SYNC_HDR_LEN: usize = 28;

/// IPv4 + UDP header length assumed in MTU math
const IP4_UDP_LEN: usize = 20 + 8;

/// IPv6 + UDP header length assumed in MTU math
const IP6_UDP_LEN: usize = 40 + 8;

/// Bytes of a datagram consumed by headers before any payload: IP + UDP on
/// the wire, plus the LB and RE framing inside the UDP payload.
pub const fn header_overhead(ipv6: bool) -> usize {
    let ip_udp = if ipv6 { IP6_UDP_LEN } else { IP4_UDP_LEN };
    ip_udp + LB_HDR_LEN + RE_HDR_LEN
}

/// Number of datagrams needed to carry `payload_len` bytes at the given MTU.
///
/// Fails when the MTU leaves no room for payload.
pub fn fragment_count(payload_len: usize, mtu: usize, overhead: usize) -> Result<usize> {
    let per_fragment = max_payload(mtu, overhead)?;
    Ok((payload_len + per_fragment - 1) / per_fragment)
}

/// Largest payload slice a single datagram can carry at the given MTU.
pub fn max_payload(mtu: usize, overhead: usize) -> Result<usize> {
    if mtu <= overhead {
        return Err(Error::Config(format!(
            "mtu {} leaves no payload room under {} bytes of headers",
            mtu, overhead
        )));
    }
    Ok(mtu - overhead)
}

/// Entropy used for every fragment of one event. Zero asks the library to
/// pick a random value so the balancer still sees flow diversity.
pub fn event_entropy(requested: u16) -> u16 {
    if requested != 0 {
        requested
    } else {
        rand::random::<u16>()
    }
}

/// Balancer steering header. Present on every datagram the segmenter emits;
/// the balancer strips it before forwarding to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbHeader {
    /// Flow-steering entropy for this event
    pub entropy: u16,

    /// Event number used for epoch steering
    pub event_number: u64,
}

impl LbHeader {
    pub fn encode(&self) -> [u8; LB_HDR_LEN] {
        let mut buf = [0u8; LB_HDR_LEN];
        buf[0..2].copy_from_slice(&LB_MAGIC);
        buf[2] = LB_VERSION;
        buf[3] = 1; // next protocol: RE
        buf[6..8].copy_from_slice(&self.entropy.to_be_bytes());
        buf[8..16].copy_from_slice(&self.event_number.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LB_HDR_LEN {
            return Err(Error::Protocol(format!(
                "balancer header truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0..2] != LB_MAGIC {
            return Err(Error::Protocol("bad balancer header magic".into()));
        }
        if buf[2] != LB_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported balancer header version {}",
                buf[2]
            )));
        }
        Ok(Self {
            entropy: u16::from_be_bytes([buf[6], buf[7]]),
            event_number: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Reassembly header: addresses one payload slice within one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReHeader {
    /// Source data stream id
    pub data_id: u16,

    /// Byte offset of this slice within the event
    pub offset: u32,

    /// Total event length in bytes
    pub length: u32,

    /// Event number
    pub event_number: u64,
}

impl ReHeader {
    pub fn encode(&self) -> [u8; RE_HDR_LEN] {
        let mut buf = [0u8; RE_HDR_LEN];
        buf[0] = RE_VERSION << 4;
        buf[2..4].copy_from_slice(&self.data_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf[12..20].copy_from_slice(&self.event_number.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RE_HDR_LEN {
            return Err(Error::Protocol(format!(
                "reassembly header truncated: {} bytes",
                buf.len()
            )));
        }
        let version = buf[0] >> 4;
        if version != RE_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported reassembly header version {}",
                version
            )));
        }
        Ok(Self {
            data_id: u16::from_be_bytes([buf[2], buf[3]]),
            offset: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            length: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            event_number: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// Periodic sync message advertising the sender's event rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHeader {
    /// Sender source id
    pub event_src_id: u32,

    /// Most recent event number (or microsecond clock sample)
    pub event_number: u64,

    /// Smoothed event rate in Hz
    pub avg_rate_hz: u32,

    /// Sender wall clock, nanoseconds since the Unix epoch
    pub unix_time_ns: u64,
}

impl SyncHeader {
    pub fn encode(&self) -> [u8; SYNC_HDR_LEN] {
        let mut buf = [0u8; SYNC_HDR_LEN];
        buf[0..2].copy_from_slice(&SYNC_MAGIC);
        buf[2] = SYNC_VERSION;
        buf[4..8].copy_from_slice(&self.event_src_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.event_number.to_be_bytes());
        buf[16..20].copy_from_slice(&self.avg_rate_hz.to_be_bytes());
        buf[20..28].copy_from_slice(&self.unix_time_ns.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SYNC_HDR_LEN {
            return Err(Error::Protocol(format!(
                "sync header truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0..2] != SYNC_MAGIC {
            return Err(Error::Protocol("bad sync header magic".into()));
        }
        if buf[2] != SYNC_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported sync header version {}",
                buf[2]
            )));
        }
        Ok(Self {
            event_src_id: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            event_number: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            avg_rate_hz: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            unix_time_ns: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// One decoded datagram: framing fields plus the payload slice it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Event number
    pub event_number: u64,

    /// Source data stream id
    pub data_id: u16,

    /// Byte offset of the payload within the event
    pub offset: u32,

    /// Total event length
    pub total_length: u32,

    /// Flow-steering entropy (zero when the balancer header was stripped)
    pub entropy: u16,

    /// Payload slice
    pub payload: Bytes,
}

impl Fragment {
    /// Serialize as a full on-wire datagram (LB header + RE header + payload).
    pub fn encode(&self) -> Vec<u8> {
        encode_fragment(
            self.event_number,
            self.data_id,
            self.offset,
            self.total_length,
            self.entropy,
            &self.payload,
        )
    }

    /// Parse a received datagram. `with_lb_header` must be true only when the
    /// datagram did not pass through the balancer (test harnesses).
    pub fn decode(buf: &[u8], with_lb_header: bool) -> Result<Self> {
        let (entropy, rest) = if with_lb_header {
            let lb = LbHeader::decode(buf)?;
            (lb.entropy, &buf[LB_HDR_LEN..])
        } else {
            (0, buf)
        };

        let re = ReHeader::decode(rest)?;
        Ok(Self {
            event_number: re.event_number,
            data_id: re.data_id,
            offset: re.offset,
            total_length: re.length,
            entropy,
            payload: Bytes::copy_from_slice(&rest[RE_HDR_LEN..]),
        })
    }
}

/// Build a full on-wire datagram without an intermediate [`Fragment`].
pub fn encode_fragment(
    event_number: u64,
    data_id: u16,
    offset: u32,
    total_length: u32,
    entropy: u16,
    payload: &[u8],
) -> Vec<u8> {
    let lb = LbHeader {
        entropy,
        event_number,
    };
    let re = ReHeader {
        data_id,
        offset,
        length: total_length,
        event_number,
    };

    let mut buf = Vec::with_capacity(LB_HDR_LEN + RE_HDR_LEN + payload.len());
    buf.extend_from_slice(&lb.encode());
    buf.extend_from_slice(&re.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_count_formula() {
        // 104-byte MTU minus 64 bytes of headers leaves 40 bytes per datagram
        assert_eq!(fragment_count(69, 104, 64).unwrap(), 2);
        assert_eq!(fragment_count(40, 104, 64).unwrap(), 1);
        assert_eq!(fragment_count(41, 104, 64).unwrap(), 2);
        assert_eq!(fragment_count(0, 104, 64).unwrap(), 0);
        assert_eq!(fragment_count(1_000_000, 1500, 64).unwrap(), 697);
    }

    #[test]
    fn test_fragment_count_rejects_tiny_mtu() {
        assert!(matches!(fragment_count(10, 64, 64), Err(Error::Config(_))));
        assert!(matches!(fragment_count(10, 63, 64), Err(Error::Config(_))));
    }

    #[test]
    fn test_header_overhead() {
        assert_eq!(header_overhead(false), 64);
        assert_eq!(header_overhead(true), 84);
    }

    #[test]
    fn test_fragment_encode_decode() {
        let frag = Fragment {
            event_number: 77,
            data_id: 5,
            offset: 40,
            total_length: 69,
            entropy: 0x1234,
            payload: Bytes::from_static(b"the last 29 bytes of an event"),
        };

        let wire = frag.encode();
        assert_eq!(wire.len(), LB_HDR_LEN + RE_HDR_LEN + 29);

        // with the balancer header still attached
        let decoded = Fragment::decode(&wire, true).unwrap();
        assert_eq!(decoded, frag);

        // as a worker sees it, balancer header stripped
        let decoded = Fragment::decode(&wire[LB_HDR_LEN..], false).unwrap();
        assert_eq!(decoded.event_number, 77);
        assert_eq!(decoded.entropy, 0);
        assert_eq!(decoded.payload, frag.payload);
    }

    #[test]
    fn test_decode_rejects_truncated_and_wrong_version() {
        let wire = encode_fragment(1, 1, 0, 4, 9, b"abcd");

        assert!(matches!(
            Fragment::decode(&wire[..LB_HDR_LEN + 3], true),
            Err(Error::Protocol(_))
        ));

        let mut bad_version = wire.clone();
        bad_version[LB_HDR_LEN] = 7 << 4;
        assert!(matches!(
            Fragment::decode(&bad_version, true),
            Err(Error::Protocol(_))
        ));

        let mut bad_magic = wire;
        bad_magic[0] = b'X';
        assert!(matches!(
            Fragment::decode(&bad_magic, true),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_sync_round_trip() {
        let sync = SyncHeader {
            event_src_id: 42,
            event_number: 1_000_000,
            avg_rate_hz: 25_000,
            unix_time_ns: 1_700_000_000_000_000_000,
        };
        let wire = sync.encode();
        assert_eq!(wire.len(), SYNC_HDR_LEN);
        assert_eq!(SyncHeader::decode(&wire).unwrap(), sync);
    }

    #[test]
    fn test_event_entropy() {
        assert_eq!(event_entropy(9), 9);
        // zero means pick one; drawing twice is overwhelmingly non-constant,
        // but all we can assert deterministically is that a value came back
        let _ = event_entropy(0);
    }
}
