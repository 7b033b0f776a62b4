//! Segment codec.
//!
//! A [`Segment`] travels as one datagram: a 15-byte header followed by the
//! payload.  Integers are big-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  seq          first payload byte, or the SYN / FIN marker
//!      4     4  ack          next byte expected from the peer
//!      8     1  flags        SYN, ACK, FIN, RST bits
//!      9     2  window       free space in the sender's receive buffer
//!     11     2  payload_len  bytes following the header
//!     13     2  checksum     RFC 1071 over header and payload
//! ```
//!
//! Decoding rejects short buffers, length mismatches and bad checksums; the
//! connection counts such datagrams and drops them.

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Opens a connection; carries the initial sequence number.
    pub const SYN: u8 = 1;
    pub const ACK: u8 = 1 << 1;
    /// End of the sender's byte stream.
    pub const FIN: u8 = 1 << 2;
    /// Tear down without a handshake.
    pub const RST: u8 = 1 << 3;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 15;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_WINDOW: usize = 9;
const OFF_PAYLOAD_LEN: usize = 11;
const OFF_CHECKSUM: usize = 13;

/// Fixed-size segment header, fields in host byte order.
///
/// The payload length and checksum are not stored here: they are derived
/// from the payload on encode and verified on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Sequence number of the first payload byte, or of the SYN/FIN marker.
    pub seq: u32,
    /// Next sequence number expected from the peer (valid with `ACK`).
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window in bytes.
    pub window: u16,
}

/// One immutable unit on the wire: header plus (possibly empty) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Errors that can arise when framing or parsing a segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Buffer shorter than the fixed header size.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// `payload_len` field does not match the actual remaining bytes.
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    /// Checksum did not match the recomputed value.
    #[error("checksum verification failed")]
    ChecksumFailed,
    /// Payload cannot be described by the 16-bit length field.
    #[error("payload of {0} bytes exceeds the wire limit")]
    PayloadTooLarge(usize),
}

impl Segment {
    /// A segment with an empty payload.
    pub fn control(seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                window,
            },
            payload: Vec::new(),
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }

    /// Sequence space consumed by this segment: payload bytes plus one for
    /// each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(flags::SYN) {
            len += 1;
        }
        if self.has(flags::FIN) {
            len += 1;
        }
        len
    }

    /// Frame the segment for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| SegmentError::PayloadTooLarge(self.payload.len()))?;
        let Header {
            seq,
            ack,
            flags,
            window,
        } = self.header;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ack.to_be_bytes());
        buf.push(flags);
        buf.extend_from_slice(&window.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.payload);

        let sum = checksum(&buf);
        buf[OFF_CHECKSUM..HEADER_LEN].copy_from_slice(&sum.to_be_bytes());
        Ok(buf)
    }

    /// Parse one received datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort);
        }
        let (head, payload) = buf.split_at(HEADER_LEN);
        if usize::from(read_u16(head, OFF_PAYLOAD_LEN)) != payload.len() {
            return Err(SegmentError::LengthMismatch);
        }
        if checksum(buf) != read_u16(head, OFF_CHECKSUM) {
            return Err(SegmentError::ChecksumFailed);
        }
        Ok(Segment {
            header: Header {
                seq: read_u32(head, OFF_SEQ),
                ack: read_u32(head, OFF_ACK),
                flags: head[OFF_FLAGS],
                window: read_u16(head, OFF_WINDOW),
            },
            payload: payload.to_vec(),
        })
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (flags::SYN, "SYN"),
            (flags::ACK, "ACK"),
            (flags::FIN, "FIN"),
            (flags::RST, "RST"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.has(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        write!(
            f,
            " seq={} ack={} wnd={} len={}",
            self.header.seq,
            self.header.ack,
            self.header.window,
            self.payload.len()
        )
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// RFC 1071 one's-complement checksum of a framed segment, reading the
/// checksum field itself as zero.
fn checksum(framed: &[u8]) -> u16 {
    let byte = |i: usize| -> u32 {
        if (OFF_CHECKSUM..HEADER_LEN).contains(&i) {
            0
        } else {
            framed.get(i).map_or(0, |&b| u32::from(b))
        }
    };
    let mut sum: u32 = (0..framed.len())
        .step_by(2)
        .map(|i| (byte(i) << 8) | byte(i + 1))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
