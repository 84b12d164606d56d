use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message types route inbound requests to handlers. The type is a small
/// integer carried in every datagram header.
pub const MAX_MSG_TYPES: usize = 64;

/// Number of datagrams a sender may have on the wire, per transaction,
/// before it must see the first one's ACK. Shared by both endpoints.
pub const ACK_WINDOW_SIZE: u16 = 4;

const FLAG_ACK: u8 = 1 << 0;
const FLAG_REPLY: u8 = 1 << 1;
const FLAG_NICENESS: u8 = 1 << 2;
const FLAG_ERROR: u8 = 1 << 3;
const FLAG_RESERVED_MASK: u8 = 0xf0;

/// Priority class of a transaction. `High` gets an (approximately) constant
/// retransmit backoff to minimize tail latency, `Low` backs off
/// exponentially.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Niceness {
    High = 0,
    Low = 1,
}

/// The parsed form of a datagram header, independent of the wire framing
/// that produced it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DgramHeader {
    pub trans_id: u32,
    pub msg_type: u8,
    /// Sequence number of this datagram within its message half.
    pub dgram_num: u16,
    /// Total datagram count of the message half this datagram belongs to;
    /// zero in ACK datagrams.
    pub total_dgrams: u16,
    pub is_ack: bool,
    /// Set on reply-half data datagrams, and on ACKs that acknowledge
    /// reply-half data.
    pub is_reply: bool,
    pub niceness: Niceness,
    /// Marks an error reply; the payload is a big-endian `u32` error code.
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("datagram shorter than the header")]
    Truncated,
    #[error("checksum mismatch")]
    Checksum,
    #[error("reserved header bits set")]
    ReservedBits,
}

/// The framing seam. The transport never touches raw header bytes itself,
/// so an overlay with a different datagram shape (e.g. DNS-framed traffic)
/// can reuse the slot table, scheduler and retransmit machinery by
/// substituting its own codec.
pub trait WireCodec: Send + Sync + 'static {
    /// Serialized header length in bytes.
    fn header_len(&self) -> usize;

    /// Largest datagram this codec will emit or accept, header included.
    fn max_dgram_len(&self) -> usize;

    /// Largest data payload of a single datagram.
    fn max_payload_len(&self) -> usize {
        self.max_dgram_len() - self.header_len()
    }

    /// The ACK window both endpoints agree on.
    fn ack_window(&self) -> u16;

    /// Parse the header of a received datagram, verifying whatever
    /// integrity the codec defines. The payload is `dgram[header_len()..]`.
    fn parse(&self, dgram: &[u8]) -> Result<DgramHeader, CodecError>;

    /// Write header plus payload into `out`, finalizing checksums.
    fn encode(&self, header: &DgramHeader, payload: &[u8], out: &mut BytesMut);
}

/// The default wire framing: a fixed 16-byte header, all integers
/// big-endian.
///
/// ```ascii
///  0: checksum (u32)     CRC-32/iSCSI over bytes 4.. of the datagram
///  4: transaction id (u32)
///  8: flags (u8)         bit 0 ACK, bit 1 reply, bit 2 niceness,
///                        bit 3 error reply; bits 4-7 reserved, zero
///  9: msg_type (u8)
/// 10: dgram_num (u16)
/// 12: total_dgrams (u16) zero in ACK datagrams
/// 14: reserved (u16)     zero
/// ```
///
/// A checksum mismatch drops the datagram (counted, not reported to any
/// slot); a codec built with [`StandardCodec::without_checksums`] writes
/// zeros and skips verification, for overlays that carry their own
/// integrity.
pub struct StandardCodec {
    verify_checksums: bool,
}

impl StandardCodec {
    pub const HEADER_LEN: usize = 16;

    /// 1500-byte Ethernet frame minus IPv4 and UDP headers. Chosen so the
    /// IP layer never fragments on standard-MTU paths.
    pub const MAX_DGRAM_LEN: usize = 1472;

    const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

    pub fn new() -> StandardCodec {
        StandardCodec { verify_checksums: true }
    }

    pub fn without_checksums() -> StandardCodec {
        StandardCodec { verify_checksums: false }
    }

    fn checksum(payload_after_checksum: &[u8]) -> u32 {
        let mut digest = Self::CRC.digest();
        digest.update(payload_after_checksum);
        digest.finalize()
    }
}

impl Default for StandardCodec {
    fn default() -> Self {
        StandardCodec::new()
    }
}

impl WireCodec for StandardCodec {
    fn header_len(&self) -> usize {
        Self::HEADER_LEN
    }

    fn max_dgram_len(&self) -> usize {
        Self::MAX_DGRAM_LEN
    }

    fn ack_window(&self) -> u16 {
        ACK_WINDOW_SIZE
    }

    fn parse(&self, dgram: &[u8]) -> Result<DgramHeader, CodecError> {
        let mut buf = dgram;

        let checksum = buf.try_get_u32().map_err(|_| CodecError::Truncated)?;
        let trans_id = buf.try_get_u32().map_err(|_| CodecError::Truncated)?;
        let flags = buf.try_get_u8().map_err(|_| CodecError::Truncated)?;
        let msg_type = buf.try_get_u8().map_err(|_| CodecError::Truncated)?;
        let dgram_num = buf.try_get_u16().map_err(|_| CodecError::Truncated)?;
        let total_dgrams = buf.try_get_u16().map_err(|_| CodecError::Truncated)?;
        let reserved = buf.try_get_u16().map_err(|_| CodecError::Truncated)?;

        if flags & FLAG_RESERVED_MASK != 0 || reserved != 0 {
            return Err(CodecError::ReservedBits);
        }
        if self.verify_checksums && checksum != Self::checksum(&dgram[4..]) {
            return Err(CodecError::Checksum);
        }

        let niceness = if flags & FLAG_NICENESS != 0 { Niceness::Low } else { Niceness::High };

        Ok(DgramHeader {
            trans_id,
            msg_type,
            dgram_num,
            total_dgrams,
            is_ack: flags & FLAG_ACK != 0,
            is_reply: flags & FLAG_REPLY != 0,
            niceness,
            is_error: flags & FLAG_ERROR != 0,
        })
    }

    fn encode(&self, header: &DgramHeader, payload: &[u8], out: &mut BytesMut) {
        let mut flags = 0u8;
        if header.is_ack {
            flags |= FLAG_ACK;
        }
        if header.is_reply {
            flags |= FLAG_REPLY;
        }
        if header.niceness == Niceness::Low {
            flags |= FLAG_NICENESS;
        }
        if header.is_error {
            flags |= FLAG_ERROR;
        }

        let start = out.len();
        out.put_u32(0); // checksum, patched below
        out.put_u32(header.trans_id);
        out.put_u8(flags);
        out.put_u8(header.msg_type);
        out.put_u16(header.dgram_num);
        out.put_u16(header.total_dgrams);
        out.put_u16(0);
        out.put_slice(payload);

        if self.verify_checksums {
            let checksum = Self::checksum(&out[start + 4..]);
            out[start..start + 4].copy_from_slice(&checksum.to_be_bytes());
        }
    }
}

/// Number of datagrams a message of `msg_size` bytes occupies on the wire.
/// An empty message still takes one datagram.
pub fn dgram_count(msg_size: usize, max_payload: usize) -> usize {
    if msg_size == 0 {
        1
    } else {
        msg_size.div_ceil(max_payload)
    }
}
