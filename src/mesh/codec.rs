//! Packet codec: fixed 23-byte header, typed payloads, trailing CRC.
//!
//! ## On-air frame
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────────┐
//! │ Header (23B) │ Payload (0-255B, maybe AEAD) │ CRC-16 (2B)  │
//! └──────────────┴──────────────────────────────┴──────────────┘
//!
//! Header (little-endian):
//! ┌─────────┬─────┬───────┬────────┬───────┬───────┬──────────┐
//! │ ver|typ │ TTL │ flags │ pkt id │ src   │ dest  │ next hop │
//! │  (1B)   │ 1B  │  1B   │  2B    │ 4B    │ 4B    │ 4B       │
//! ├─────────┼─────┼───────┼────────┼───────┼───────┴──────────┤
//! │ hops 1B │ seq │ len   │ chan   │ net id 2B                │
//! │         │ 1B  │ 1B    │ 1B     │                          │
//! └─────────┴─────┴───────┴────────┴──────────────────────────┘
//! ```
//!
//! The codec never touches the AEAD: an encrypted payload is opaque bytes
//! here. Parsing a typed payload happens after decryption, through
//! [`Payload::parse`].

use crate::types::{MAX_PAYLOAD, NodeAddr, PROTOCOL_VERSION};
use thiserror::Error;

/// Fixed header length on the air.
pub const HEADER_LEN: usize = 23;

/// Trailing CRC length.
pub const CRC_LEN: usize = 2;

/// Smallest valid frame: bare header plus CRC.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;

/// Largest valid frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD + CRC_LEN;

/// Destinations carried in a single ROUTE_ERR.
pub const MAX_ROUTE_ERR_DESTS: usize = 8;

/// Friendly-name cap in BEACON payloads.
pub const MAX_NODE_NAME_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    #[error("unsupported version {0}")]
    UnknownVersion(u8),

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("declared payload length {declared} disagrees with frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,

    #[error("crc mismatch")]
    BadCrc,

    #[error("malformed {0} payload")]
    BadPayload(&'static str),
}

// =============================================================================
// PACKET TYPES AND FLAGS
// =============================================================================

/// Wire packet types. Values 10-15 are reserved for future link, group and
/// store-and-forward extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    RouteReq = 3,
    RouteRep = 4,
    RouteErr = 5,
    Hello = 6,
    Telemetry = 7,
    Beacon = 8,
    TimeSync = 9,
}

impl PacketType {
    pub fn from_nibble(value: u8) -> Result<Self, CodecError> {
        Ok(match value {
            1 => PacketType::Data,
            2 => PacketType::Ack,
            3 => PacketType::RouteReq,
            4 => PacketType::RouteRep,
            5 => PacketType::RouteErr,
            6 => PacketType::Hello,
            7 => PacketType::Telemetry,
            8 => PacketType::Beacon,
            9 => PacketType::TimeSync,
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Data => "data",
            PacketType::Ack => "ack",
            PacketType::RouteReq => "route_req",
            PacketType::RouteRep => "route_rep",
            PacketType::RouteErr => "route_err",
            PacketType::Hello => "hello",
            PacketType::Telemetry => "telemetry",
            PacketType::Beacon => "beacon",
            PacketType::TimeSync => "time_sync",
        }
    }
}

/// Header flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    const ACK_REQ: u8 = 1 << 0;
    const ENCRYPTED: u8 = 1 << 1;
    const IS_RETRY: u8 = 1 << 2;
    const PRIORITY: u8 = 1 << 3;

    pub fn new() -> Self {
        Flags(0)
    }

    pub fn from_byte(byte: u8) -> Self {
        Flags(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn ack_req(self) -> bool {
        self.0 & Self::ACK_REQ != 0
    }

    pub fn set_ack_req(&mut self, value: bool) {
        self.set(Self::ACK_REQ, value);
    }

    pub fn encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn set_encrypted(&mut self, value: bool) {
        self.set(Self::ENCRYPTED, value);
    }

    pub fn is_retry(self) -> bool {
        self.0 & Self::IS_RETRY != 0
    }

    pub fn set_is_retry(&mut self, value: bool) {
        self.set(Self::IS_RETRY, value);
    }

    pub fn priority(self) -> bool {
        self.0 & Self::PRIORITY != 0
    }

    pub fn set_priority(&mut self, value: bool) {
        self.set(Self::PRIORITY, value);
    }

    /// Flags that stay authenticated end to end. IS_RETRY and PRIORITY are
    /// sender/relay-local and excluded from the AAD.
    pub fn aad_mask(self) -> Flags {
        Flags(self.0 & (Self::ACK_REQ | Self::ENCRYPTED))
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

// =============================================================================
// HEADER
// =============================================================================

/// The fixed mesh header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub ptype: PacketType,
    pub ttl: u8,
    pub flags: Flags,
    pub packet_id: u16,
    pub source: NodeAddr,
    pub dest: NodeAddr,
    pub next_hop: NodeAddr,
    pub hop_count: u8,
    pub sequence: u8,
    pub payload_len: u8,
    pub channel: u8,
    pub network_id: u16,
}

impl PacketHeader {
    pub fn new(ptype: PacketType, source: NodeAddr, dest: NodeAddr) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ptype,
            ttl: 0,
            flags: Flags::new(),
            packet_id: 0,
            source,
            dest,
            next_hop: NodeAddr::UNSET,
            hop_count: 0,
            sequence: 0,
            payload_len: 0,
            channel: 0,
            network_id: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.version << 4) | (self.ptype as u8 & 0x0F);
        buf[1] = self.ttl;
        buf[2] = self.flags.as_byte();
        buf[3..5].copy_from_slice(&self.packet_id.to_le_bytes());
        buf[5..9].copy_from_slice(&self.source.to_u32().to_le_bytes());
        buf[9..13].copy_from_slice(&self.dest.to_u32().to_le_bytes());
        buf[13..17].copy_from_slice(&self.next_hop.to_u32().to_le_bytes());
        buf[17] = self.hop_count;
        buf[18] = self.sequence;
        buf[19] = self.payload_len;
        buf[20] = self.channel;
        buf[21..23].copy_from_slice(&self.network_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated(buf.len()));
        }
        let version = buf[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        let ptype = PacketType::from_nibble(buf[0] & 0x0F)?;
        Ok(Self {
            version,
            ptype,
            ttl: buf[1],
            flags: Flags::from_byte(buf[2]),
            packet_id: u16::from_le_bytes([buf[3], buf[4]]),
            source: NodeAddr(u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]])),
            dest: NodeAddr(u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]])),
            next_hop: NodeAddr(u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]])),
            hop_count: buf[17],
            sequence: buf[18],
            payload_len: buf[19],
            channel: buf[20],
            network_id: u16::from_le_bytes([buf[21], buf[22]]),
        })
    }

    /// Associated data for the AEAD: the header with every in-flight-mutable
    /// field zeroed (TTL, hop count, next hop, relay-local flags), so a
    /// forwarder can rewrite those without re-sealing while source,
    /// destination, id, sequence, length, channel and network id stay bound
    /// to the ciphertext.
    pub fn aad_bytes(&self) -> [u8; HEADER_LEN] {
        let mut stable = *self;
        stable.ttl = 0;
        stable.hop_count = 0;
        stable.next_hop = NodeAddr::UNSET;
        stable.flags = self.flags.aad_mask();
        stable.encode()
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest.is_broadcast()
    }

    /// Peek at the network id of a raw frame without a full parse; used to
    /// drop foreign-network frames before any crypto work.
    pub fn peek_network_id(buf: &[u8]) -> Option<u16> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(u16::from_le_bytes([buf[21], buf[22]]))
    }
}

// =============================================================================
// FRAME
// =============================================================================

/// A header plus (possibly sealed) payload bytes, as they travel on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(mut header: PacketHeader, payload: Vec<u8>) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge);
        }
        header.payload_len = payload.len() as u8;
        Ok(Self { header, payload })
    }

    /// Serialize with a freshly computed CRC. Always called again after any
    /// header rewrite (TTL decrement, next-hop change), so a forwarded frame
    /// never carries a stale checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        let mut header = self.header;
        header.payload_len = self.payload.len() as u8;
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.payload);
        let crc = crc16_ccitt(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse and verify a received frame. Rejects unknown versions, declared
    /// lengths that disagree with the bytes actually received, and CRC
    /// mismatches — all before anything downstream runs.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(CodecError::Truncated(buf.len()));
        }
        if buf.len() > MAX_FRAME_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        let header = PacketHeader::decode(buf)?;
        let declared = header.payload_len as usize;
        let actual = buf.len() - MIN_FRAME_LEN;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }

        let body = &buf[..HEADER_LEN + declared];
        let wire_crc = u16::from_le_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
        if crc16_ccitt(body) != wire_crc {
            return Err(CodecError::BadCrc);
        }

        Ok(Self { header, payload: body[HEADER_LEN..].to_vec() })
    }
}

// =============================================================================
// TYPED PAYLOADS
// =============================================================================

/// Decoded payload, one variant per packet type. `Data` stays raw bytes —
/// its meaning belongs to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    Ack {
        acked_id: u16,
        from: NodeAddr,
    },
    RouteReq {
        origin: NodeAddr,
        target: NodeAddr,
        request_id: u16,
        path_quality: u8,
    },
    RouteRep {
        origin: NodeAddr,
        target: NodeAddr,
        request_id: u16,
        hop_count: u8,
        path_quality: u8,
    },
    RouteErr {
        unreachable: Vec<NodeAddr>,
    },
    Hello {
        topology_hash: u32,
        neighbor_count: u8,
        reply_requested: bool,
    },
    Telemetry {
        uptime_secs: u32,
        battery_mv: u16,
        tx_count: u32,
        rx_count: u32,
        airtime_ms: u32,
    },
    Beacon {
        addr: NodeAddr,
        name: String,
    },
    TimeSync {
        unix_secs: u64,
        stratum: u8,
        quality: u8,
    },
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Data(_) => PacketType::Data,
            Payload::Ack { .. } => PacketType::Ack,
            Payload::RouteReq { .. } => PacketType::RouteReq,
            Payload::RouteRep { .. } => PacketType::RouteRep,
            Payload::RouteErr { .. } => PacketType::RouteErr,
            Payload::Hello { .. } => PacketType::Hello,
            Payload::Telemetry { .. } => PacketType::Telemetry,
            Payload::Beacon { .. } => PacketType::Beacon,
            Payload::TimeSync { .. } => PacketType::TimeSync,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Data(bytes) => bytes.clone(),
            Payload::Ack { acked_id, from } => {
                let mut out = Vec::with_capacity(6);
                out.extend_from_slice(&acked_id.to_le_bytes());
                out.extend_from_slice(&from.to_u32().to_le_bytes());
                out
            }
            Payload::RouteReq { origin, target, request_id, path_quality } => {
                let mut out = Vec::with_capacity(11);
                out.extend_from_slice(&origin.to_u32().to_le_bytes());
                out.extend_from_slice(&target.to_u32().to_le_bytes());
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*path_quality);
                out
            }
            Payload::RouteRep { origin, target, request_id, hop_count, path_quality } => {
                let mut out = Vec::with_capacity(12);
                out.extend_from_slice(&origin.to_u32().to_le_bytes());
                out.extend_from_slice(&target.to_u32().to_le_bytes());
                out.extend_from_slice(&request_id.to_le_bytes());
                out.push(*hop_count);
                out.push(*path_quality);
                out
            }
            Payload::RouteErr { unreachable } => {
                let mut out = Vec::with_capacity(1 + unreachable.len() * 4);
                out.push(unreachable.len().min(MAX_ROUTE_ERR_DESTS) as u8);
                for dest in unreachable.iter().take(MAX_ROUTE_ERR_DESTS) {
                    out.extend_from_slice(&dest.to_u32().to_le_bytes());
                }
                out
            }
            Payload::Hello { topology_hash, neighbor_count, reply_requested } => {
                let mut out = Vec::with_capacity(6);
                out.extend_from_slice(&topology_hash.to_le_bytes());
                out.push(*neighbor_count);
                out.push(u8::from(*reply_requested));
                out
            }
            Payload::Telemetry { uptime_secs, battery_mv, tx_count, rx_count, airtime_ms } => {
                let mut out = Vec::with_capacity(18);
                out.extend_from_slice(&uptime_secs.to_le_bytes());
                out.extend_from_slice(&battery_mv.to_le_bytes());
                out.extend_from_slice(&tx_count.to_le_bytes());
                out.extend_from_slice(&rx_count.to_le_bytes());
                out.extend_from_slice(&airtime_ms.to_le_bytes());
                out
            }
            Payload::Beacon { addr, name } => {
                let name_bytes = name.as_bytes();
                let len = name_bytes.len().min(MAX_NODE_NAME_LEN);
                let mut out = Vec::with_capacity(5 + len);
                out.extend_from_slice(&addr.to_u32().to_le_bytes());
                out.push(len as u8);
                out.extend_from_slice(&name_bytes[..len]);
                out
            }
            Payload::TimeSync { unix_secs, stratum, quality } => {
                let mut out = Vec::with_capacity(10);
                out.extend_from_slice(&unix_secs.to_le_bytes());
                out.push(*stratum);
                out.push(*quality);
                out
            }
        }
    }

    /// Parse a (decrypted) payload for the given packet type.
    pub fn parse(ptype: PacketType, bytes: &[u8]) -> Result<Self, CodecError> {
        match ptype {
            PacketType::Data => Ok(Payload::Data(bytes.to_vec())),
            PacketType::Ack => {
                if bytes.len() != 6 {
                    return Err(CodecError::BadPayload("ack"));
                }
                Ok(Payload::Ack {
                    acked_id: u16::from_le_bytes([bytes[0], bytes[1]]),
                    from: NodeAddr(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])),
                })
            }
            PacketType::RouteReq => {
                if bytes.len() != 11 {
                    return Err(CodecError::BadPayload("route_req"));
                }
                Ok(Payload::RouteReq {
                    origin: NodeAddr(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                    target: NodeAddr(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
                    request_id: u16::from_le_bytes([bytes[8], bytes[9]]),
                    path_quality: bytes[10],
                })
            }
            PacketType::RouteRep => {
                if bytes.len() != 12 {
                    return Err(CodecError::BadPayload("route_rep"));
                }
                Ok(Payload::RouteRep {
                    origin: NodeAddr(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                    target: NodeAddr(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])),
                    request_id: u16::from_le_bytes([bytes[8], bytes[9]]),
                    hop_count: bytes[10],
                    path_quality: bytes[11],
                })
            }
            PacketType::RouteErr => {
                let Some((&count, rest)) = bytes.split_first() else {
                    return Err(CodecError::BadPayload("route_err"));
                };
                let count = count as usize;
                if count > MAX_ROUTE_ERR_DESTS || rest.len() != count * 4 {
                    return Err(CodecError::BadPayload("route_err"));
                }
                let unreachable = rest
                    .chunks_exact(4)
                    .map(|c| NodeAddr(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect();
                Ok(Payload::RouteErr { unreachable })
            }
            PacketType::Hello => {
                if bytes.len() != 6 {
                    return Err(CodecError::BadPayload("hello"));
                }
                Ok(Payload::Hello {
                    topology_hash: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    neighbor_count: bytes[4],
                    reply_requested: bytes[5] != 0,
                })
            }
            PacketType::Telemetry => {
                if bytes.len() != 18 {
                    return Err(CodecError::BadPayload("telemetry"));
                }
                Ok(Payload::Telemetry {
                    uptime_secs: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                    battery_mv: u16::from_le_bytes([bytes[4], bytes[5]]),
                    tx_count: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
                    rx_count: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]),
                    airtime_ms: u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]),
                })
            }
            PacketType::Beacon => {
                if bytes.len() < 5 {
                    return Err(CodecError::BadPayload("beacon"));
                }
                let len = bytes[4] as usize;
                if len > MAX_NODE_NAME_LEN || bytes.len() != 5 + len {
                    return Err(CodecError::BadPayload("beacon"));
                }
                let name = std::str::from_utf8(&bytes[5..])
                    .map_err(|_| CodecError::BadPayload("beacon"))?
                    .to_string();
                Ok(Payload::Beacon {
                    addr: NodeAddr(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                    name,
                })
            }
            PacketType::TimeSync => {
                if bytes.len() != 10 {
                    return Err(CodecError::BadPayload("time_sync"));
                }
                Ok(Payload::TimeSync {
                    unix_secs: u64::from_le_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                        bytes[7],
                    ]),
                    stratum: bytes[8],
                    quality: bytes[9],
                })
            }
        }
    }
}

/// CRC-16-CCITT (poly 0x1021, init 0xFFFF) over header and payload.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        let mut header = PacketHeader::new(
            PacketType::Data,
            NodeAddr(0x1122_3344),
            NodeAddr(0x5566_7788),
        );
        header.ttl = 3;
        header.packet_id = 0xBEEF;
        header.next_hop = NodeAddr(0x0A0B_0C0D);
        header.hop_count = 1;
        header.sequence = 42;
        header.channel = 2;
        header.network_id = 0xCAFE;
        header.flags.set_ack_req(true);
        header.flags.set_encrypted(true);
        header
    }

    #[test]
    fn test_crc16_known_vector() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_header_roundtrip_identity() {
        let header = sample_header();
        let decoded = PacketHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_is_23_bytes() {
        assert_eq!(sample_header().encode().len(), HEADER_LEN);
        assert_eq!(HEADER_LEN, 23);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(sample_header(), b"hi".to_vec()).unwrap();
        let wire = frame.encode();
        assert_eq!(wire.len(), HEADER_LEN + 2 + CRC_LEN);
        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(decoded.payload, b"hi");
        assert_eq!(decoded.header.packet_id, 0xBEEF);
    }

    #[test]
    fn test_empty_payload_accepted() {
        let frame = Frame::new(sample_header(), Vec::new()).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_max_payload_boundary() {
        assert!(Frame::new(sample_header(), vec![0u8; MAX_PAYLOAD]).is_ok());
        assert_eq!(
            Frame::new(sample_header(), vec![0u8; MAX_PAYLOAD + 1]),
            Err(CodecError::PayloadTooLarge)
        );
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let mut wire = Frame::new(sample_header(), b"payload".to_vec()).unwrap().encode();
        let mid = HEADER_LEN + 2;
        wire[mid] ^= 0x40;
        assert_eq!(Frame::decode(&wire), Err(CodecError::BadCrc));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut wire = Frame::new(sample_header(), Vec::new()).unwrap().encode();
        wire[0] = (0x07 << 4) | (wire[0] & 0x0F);
        assert_eq!(Frame::decode(&wire), Err(CodecError::UnknownVersion(7)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        // Declare 5 payload bytes but ship 3.
        let mut wire = Frame::new(sample_header(), vec![1, 2, 3]).unwrap().encode();
        wire[19] = 5;
        assert!(matches!(
            Frame::decode(&wire),
            Err(CodecError::LengthMismatch { declared: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_forwarding_rewrite_recomputes_crc() {
        let frame = Frame::new(sample_header(), b"fwd".to_vec()).unwrap();
        let mut relayed = Frame::decode(&frame.encode()).unwrap();
        relayed.header.ttl -= 1;
        relayed.header.hop_count += 1;
        relayed.header.next_hop = NodeAddr(0x9999_9999);
        // A rewritten header still decodes cleanly because encode() always
        // recomputes the CRC.
        let decoded = Frame::decode(&relayed.encode()).unwrap();
        assert_eq!(decoded.header.ttl, 2);
        assert_eq!(decoded.header.next_hop, NodeAddr(0x9999_9999));
    }

    #[test]
    fn test_aad_excludes_mutable_fields() {
        let frame = Frame::new(sample_header(), b"x".to_vec()).unwrap();
        let mut relayed = Frame::decode(&frame.encode()).unwrap();
        let aad_before = relayed.header.aad_bytes();
        relayed.header.ttl -= 1;
        relayed.header.hop_count += 1;
        relayed.header.next_hop = NodeAddr(0x1234_5678);
        relayed.header.flags.set_is_retry(true);
        assert_eq!(relayed.header.aad_bytes(), aad_before);

        // But rewriting an end-to-end field does change the AAD.
        relayed.header.dest = NodeAddr(0x4444_4444);
        assert_ne!(relayed.header.aad_bytes(), aad_before);
    }

    #[test]
    fn test_ack_payload_roundtrip() {
        let payload = Payload::Ack { acked_id: 77, from: NodeAddr(9) };
        let parsed = Payload::parse(PacketType::Ack, &payload.encode()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_route_payloads_roundtrip() {
        let req = Payload::RouteReq {
            origin: NodeAddr(1),
            target: NodeAddr(3),
            request_id: 512,
            path_quality: 180,
        };
        assert_eq!(Payload::parse(PacketType::RouteReq, &req.encode()).unwrap(), req);

        let err = Payload::RouteErr {
            unreachable: vec![NodeAddr(3), NodeAddr(4)],
        };
        assert_eq!(Payload::parse(PacketType::RouteErr, &err.encode()).unwrap(), err);
    }

    #[test]
    fn test_route_err_over_capacity_rejected() {
        let mut bytes = vec![MAX_ROUTE_ERR_DESTS as u8 + 1];
        bytes.extend_from_slice(&vec![0u8; (MAX_ROUTE_ERR_DESTS + 1) * 4]);
        assert_eq!(
            Payload::parse(PacketType::RouteErr, &bytes),
            Err(CodecError::BadPayload("route_err"))
        );
    }

    #[test]
    fn test_beacon_name_bounds() {
        let payload = Payload::Beacon { addr: NodeAddr(5), name: "basecamp".into() };
        assert_eq!(Payload::parse(PacketType::Beacon, &payload.encode()).unwrap(), payload);

        // Oversized declared name length is refused.
        let mut bytes = 5u32.to_le_bytes().to_vec();
        bytes.push(MAX_NODE_NAME_LEN as u8 + 1);
        bytes.extend_from_slice(&[b'x'; MAX_NODE_NAME_LEN + 1]);
        assert_eq!(
            Payload::parse(PacketType::Beacon, &bytes),
            Err(CodecError::BadPayload("beacon"))
        );
    }
}
