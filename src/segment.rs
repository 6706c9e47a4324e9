//! Wire format for RDT segments.
//!
//! Every segment starts with a fixed 20-byte header of five big-endian
//! `u32` fields, followed by the payload (no length field, the payload
//! runs to the end of the frame):
//!
//! ```text
//!  0               4               8               12              16              20
//!  +---------------+---------------+---------------+---------------+---------------+
//!  |   src_port    |   dst_port    |      seq      |     flag      |   checksum    |
//!  +---------------+---------------+---------------+---------------+---------------+
//!  |                                   payload ...                                 |
//!  +-------------------------------------------------------------------------------+
//! ```
//!
//! Ports occupy a full field each even though they fit in 16 bits, and
//! `seq` is a full field even though the protocol only ever uses the
//! values 0 and 1. The checksum is the sum of the other four header
//! fields plus every payload byte, reduced modulo `2^32 - 1`.

use std::fmt;

use thiserror::Error;

/// Size of the fixed segment header in bytes.
pub const HEADER_LEN: usize = 20;

/// Divisor for the additive checksum.
const CHECKSUM_MODULUS: u64 = 0xFFFF_FFFF;

// Byte offsets of the header fields.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 4;
const OFF_SEQ: usize = 8;
const OFF_FLAG: usize = 12;
const OFF_CHECKSUM: usize = 16;

/// Segment kind, carried in the `flag` header field.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Application data, acknowledged per segment.
    Data = 0,
    /// Connection request.
    Syn = 1,
    /// Acceptance of a connection request.
    SynAck = 2,
    /// Acknowledgment of a data segment.
    Ack = 3,
}

impl Flag {
    pub fn from_u32(value: u32) -> Option<Flag> {
        match value {
            0 => Some(Flag::Data),
            1 => Some(Flag::Syn),
            2 => Some(Flag::SynAck),
            3 => Some(Flag::Ack),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::Data => "DATA",
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN-ACK",
            Flag::Ack => "ACK",
        };
        write!(f, "{}", name)
    }
}

/// Errors produced while decoding a frame into a [`Segment`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("frame shorter than the {HEADER_LEN}-byte header ({0} bytes)")]
    Truncated(usize),
    #[error("port field out of range: {0}")]
    PortOutOfRange(u32),
    #[error("unknown flag value: {0}")]
    UnknownFlag(u32),
}

/// Decoded header fields of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub flag: Flag,
    pub checksum: u32,
}

/// A full segment: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Builds a segment with the checksum left at zero. [`to_bytes`]
    /// computes the real value when the segment is serialized.
    ///
    /// [`to_bytes`]: Segment::to_bytes
    pub fn new(src_port: u16, dst_port: u16, seq: u32, flag: Flag, payload: Vec<u8>) -> Segment {
        Segment {
            header: SegmentHeader {
                src_port,
                dst_port,
                seq,
                flag,
                checksum: 0,
            },
            payload,
        }
    }

    /// Serializes the segment, computing the checksum over the header
    /// fields and payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let h = &self.header;
        let sum = checksum(h.src_port, h.dst_port, h.seq, h.flag, &self.payload);
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&(h.src_port as u32).to_be_bytes());
        buf.extend_from_slice(&(h.dst_port as u32).to_be_bytes());
        buf.extend_from_slice(&h.seq.to_be_bytes());
        buf.extend_from_slice(&h.flag.to_u32().to_be_bytes());
        buf.extend_from_slice(&sum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses a frame. Fails on short frames, ports that do not fit in
    /// 16 bits, and flag values outside the known set. The checksum is
    /// parsed but not verified here, see [`checksum_valid`].
    ///
    /// [`checksum_valid`]: Segment::checksum_valid
    pub fn decode(frame: &[u8]) -> Result<Segment, SegmentError> {
        if frame.len() < HEADER_LEN {
            return Err(SegmentError::Truncated(frame.len()));
        }
        let field = |off: usize| {
            let bytes: [u8; 4] = frame[off..off + 4].try_into().unwrap();
            u32::from_be_bytes(bytes)
        };
        let src_raw = field(OFF_SRC_PORT);
        let dst_raw = field(OFF_DST_PORT);
        let src_port =
            u16::try_from(src_raw).map_err(|_| SegmentError::PortOutOfRange(src_raw))?;
        let dst_port =
            u16::try_from(dst_raw).map_err(|_| SegmentError::PortOutOfRange(dst_raw))?;
        let flag_raw = field(OFF_FLAG);
        let flag = Flag::from_u32(flag_raw).ok_or(SegmentError::UnknownFlag(flag_raw))?;
        Ok(Segment {
            header: SegmentHeader {
                src_port,
                dst_port,
                seq: field(OFF_SEQ),
                flag,
                checksum: field(OFF_CHECKSUM),
            },
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// True when the stored checksum matches one recomputed from the
    /// decoded fields.
    pub fn checksum_valid(&self) -> bool {
        let h = &self.header;
        h.checksum == checksum(h.src_port, h.dst_port, h.seq, h.flag, &self.payload)
    }
}

/// Additive checksum: header fields plus payload bytes, summed into a
/// `u64` and reduced modulo `2^32 - 1`.
pub fn checksum(src_port: u16, dst_port: u16, seq: u32, flag: Flag, payload: &[u8]) -> u32 {
    let mut sum = src_port as u64 + dst_port as u64 + seq as u64 + flag.to_u32() as u64;
    sum += payload.iter().map(|&b| b as u64).sum::<u64>();
    (sum % CHECKSUM_MODULUS) as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        Segment::new(5000, 49200, 1, Flag::Data, b"hello".to_vec())
    }

    #[test]
    fn header_len_matches_layout() {
        let seg = Segment::new(1, 2, 0, Flag::Syn, Vec::new());
        assert_eq!(seg.to_bytes().len(), HEADER_LEN);
    }

    #[test]
    fn fields_are_big_endian_u32() {
        let bytes = Segment::new(0x0102, 0x0304, 1, Flag::Ack, Vec::new()).to_bytes();
        assert_eq!(&bytes[OFF_SRC_PORT..OFF_SRC_PORT + 4], &[0, 0, 1, 2]);
        assert_eq!(&bytes[OFF_DST_PORT..OFF_DST_PORT + 4], &[0, 0, 3, 4]);
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[OFF_FLAG..OFF_FLAG + 4], &[0, 0, 0, 3]);
    }

    #[test]
    fn checksum_known_vector() {
        // 1 + 2 + 1 + 3 + (1 + 2) = 10, well below the modulus.
        assert_eq!(checksum(1, 2, 1, Flag::Ack, &[1, 2]), 10);
    }

    #[test]
    fn checksum_covers_payload() {
        let a = checksum(5000, 5001, 0, Flag::Data, b"abc");
        let b = checksum(5000, 5001, 0, Flag::Data, b"abd");
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrip_preserves_fields_and_payload() {
        let seg = sample();
        let decoded = Segment::decode(&seg.to_bytes()).unwrap();
        assert_eq!(decoded.header.src_port, 5000);
        assert_eq!(decoded.header.dst_port, 49200);
        assert_eq!(decoded.header.seq, 1);
        assert_eq!(decoded.header.flag, Flag::Data);
        assert_eq!(decoded.payload, b"hello");
        assert!(decoded.checksum_valid());
    }

    #[test]
    fn reencoding_a_decoded_segment_is_identical() {
        let bytes = sample().to_bytes();
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.to_bytes(), bytes);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let seg = Segment::new(1, 2, 0, Flag::Data, Vec::new());
        let decoded = Segment::decode(&seg.to_bytes()).unwrap();
        assert!(decoded.payload.is_empty());
        assert!(decoded.checksum_valid());
    }

    #[test]
    fn bit_flip_invalidates_checksum() {
        let mut bytes = sample().to_bytes();
        bytes[HEADER_LEN + 1] ^= 0x20;
        let decoded = Segment::decode(&bytes).unwrap();
        assert!(!decoded.checksum_valid());
    }

    #[test]
    fn decode_rejects_short_frame() {
        assert_eq!(
            Segment::decode(&[0u8; HEADER_LEN - 1]),
            Err(SegmentError::Truncated(HEADER_LEN - 1))
        );
    }

    #[test]
    fn decode_rejects_oversized_port() {
        let mut bytes = sample().to_bytes();
        bytes[OFF_SRC_PORT] = 0xff;
        assert!(matches!(
            Segment::decode(&bytes),
            Err(SegmentError::PortOutOfRange(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_flag() {
        let mut bytes = sample().to_bytes();
        bytes[OFF_FLAG + 3] = 9;
        assert_eq!(Segment::decode(&bytes), Err(SegmentError::UnknownFlag(9)));
    }

    #[test]
    fn flag_u32_conversions_invert() {
        for flag in [Flag::Data, Flag::Syn, Flag::SynAck, Flag::Ack] {
            assert_eq!(Flag::from_u32(flag.to_u32()), Some(flag));
        }
        assert_eq!(Flag::from_u32(4), None);
    }
}
