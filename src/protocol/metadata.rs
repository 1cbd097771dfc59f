//! Segment metadata structures and their wire layout.
//!
//! Metadata is always exactly [`METADATA_LEN`] bytes before encryption.
//! The first byte partitions the protocol space into two classes with two
//! different segment layouts on the wire:
//!
//! ```text
//! session-control:  [metadata] [payload?] [suffix padding]
//! data-ack:         [metadata] [prefix padding] [payload?] [suffix padding]
//! ```
//!
//! Both classes share a common header so that a receiver can skip a
//! segment whose tag it does not recognize:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Protocol (1) │ Session ID (4) │ Seq (4) │ Prefix Len (1)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload Len (2) │ Suffix Len (1) │ class-specific fields     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ zero padding up to 32 bytes                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Session-control metadata carries a status byte after the common
//! header (its prefix length is always zero); data-ack metadata carries
//! the peer's unacknowledged sequence number and receive window.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Metadata length in bytes, before encryption.
pub const METADATA_LEN: usize = 32;

/// Offset of the prefix padding length in the common header.
const PREFIX_LEN_OFFSET: usize = 9;
/// Offset of the payload length in the common header.
const PAYLOAD_LEN_OFFSET: usize = 10;
/// Offset of the suffix padding length in the common header.
const SUFFIX_LEN_OFFSET: usize = 12;

/// Protocol tags.
///
/// Tags `0..=5` are session-control; `6..=8` are data-ack. Higher values
/// belong to future versions and are skipped on ingress.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Ask the peer to drop the whole underlay.
    CloseConnRequest = 0,
    /// Peer acknowledged a connection close.
    CloseConnResponse = 1,
    /// Open a new session on this underlay.
    OpenSessionRequest = 2,
    /// Acknowledge a session open.
    OpenSessionResponse = 3,
    /// Close one session.
    CloseSessionRequest = 4,
    /// Acknowledge a session close.
    CloseSessionResponse = 5,
    /// Ordered payload bytes for a session.
    Data = 6,
    /// Acknowledgment without payload.
    Ack = 7,
    /// Liveness signal on an idle session.
    Heartbeat = 8,
}

impl Protocol {
    /// Whether a raw tag byte belongs to the session-control class.
    pub fn is_session_control_byte(b: u8) -> bool {
        b <= Protocol::CloseSessionResponse as u8
    }

    /// Whether a raw tag byte belongs to the data-ack class.
    pub fn is_data_ack_byte(b: u8) -> bool {
        (Protocol::Data as u8..=Protocol::Heartbeat as u8).contains(&b)
    }

    /// Whether this tag belongs to the session-control class.
    pub fn is_session_control(self) -> bool {
        Self::is_session_control_byte(self as u8)
    }

    /// Whether this tag belongs to the data-ack class.
    pub fn is_data_ack(self) -> bool {
        Self::is_data_ack_byte(self as u8)
    }
}

impl TryFrom<u8> for Protocol {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Protocol::CloseConnRequest),
            1 => Ok(Protocol::CloseConnResponse),
            2 => Ok(Protocol::OpenSessionRequest),
            3 => Ok(Protocol::OpenSessionResponse),
            4 => Ok(Protocol::CloseSessionRequest),
            5 => Ok(Protocol::CloseSessionResponse),
            6 => Ok(Protocol::Data),
            7 => Ok(Protocol::Ack),
            8 => Ok(Protocol::Heartbeat),
            other => Err(Error::UnknownProtocol(other)),
        }
    }
}

/// Metadata of a session-control segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionControl {
    /// One of the six session-control tags.
    pub protocol: Protocol,
    /// Target session; 0 is reserved.
    pub session_id: u32,
    /// Sender's sequence number for this segment.
    pub seq: u32,
    /// Status code; 0 means success.
    pub status: u8,
    /// Length of the encrypted payload, 0 for pure control.
    pub payload_len: u16,
    /// Length of the trailing random padding.
    pub suffix_len: u8,
}

impl SessionControl {
    /// Serialize into the fixed metadata block.
    pub fn marshal(&self) -> [u8; METADATA_LEN] {
        let mut block = [0u8; METADATA_LEN];
        let mut buf = &mut block[..];
        buf.put_u8(self.protocol as u8);
        buf.put_u32(self.session_id);
        buf.put_u32(self.seq);
        buf.put_u8(0); // no prefix padding in this class
        buf.put_u16(self.payload_len);
        buf.put_u8(self.suffix_len);
        buf.put_u8(self.status);
        block
    }

    /// Parse from a decrypted metadata block.
    pub fn unmarshal(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != METADATA_LEN {
            return Err(Error::Framing {
                expected: METADATA_LEN,
                actual: buf.len(),
            });
        }
        let protocol = Protocol::try_from(buf.get_u8())?;
        let session_id = buf.get_u32();
        let seq = buf.get_u32();
        let _prefix = buf.get_u8();
        let payload_len = buf.get_u16();
        let suffix_len = buf.get_u8();
        let status = buf.get_u8();
        Ok(Self {
            protocol,
            session_id,
            seq,
            status,
            payload_len,
            suffix_len,
        })
    }
}

/// Metadata of a data-ack segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    /// Data, Ack, or Heartbeat.
    pub protocol: Protocol,
    /// Target session.
    pub session_id: u32,
    /// Sender's sequence number for this segment.
    pub seq: u32,
    /// Next sequence number the sender expects from the peer.
    pub unack_seq: u32,
    /// Sender's remaining receive window, in segments.
    pub window: u16,
    /// Length of the leading random padding.
    pub prefix_len: u8,
    /// Length of the encrypted payload.
    pub payload_len: u16,
    /// Length of the trailing random padding.
    pub suffix_len: u8,
}

impl DataAck {
    /// Serialize into the fixed metadata block.
    pub fn marshal(&self) -> [u8; METADATA_LEN] {
        let mut block = [0u8; METADATA_LEN];
        let mut buf = &mut block[..];
        buf.put_u8(self.protocol as u8);
        buf.put_u32(self.session_id);
        buf.put_u32(self.seq);
        buf.put_u8(self.prefix_len);
        buf.put_u16(self.payload_len);
        buf.put_u8(self.suffix_len);
        buf.put_u32(self.unack_seq);
        buf.put_u16(self.window);
        block
    }

    /// Parse from a decrypted metadata block.
    pub fn unmarshal(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != METADATA_LEN {
            return Err(Error::Framing {
                expected: METADATA_LEN,
                actual: buf.len(),
            });
        }
        let protocol = Protocol::try_from(buf.get_u8())?;
        let session_id = buf.get_u32();
        let seq = buf.get_u32();
        let prefix_len = buf.get_u8();
        let payload_len = buf.get_u16();
        let suffix_len = buf.get_u8();
        let unack_seq = buf.get_u32();
        let window = buf.get_u16();
        Ok(Self {
            protocol,
            session_id,
            seq,
            unack_seq,
            window,
            prefix_len,
            payload_len,
            suffix_len,
        })
    }
}

/// Decoded metadata of either class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    /// Session-control metadata.
    SessionControl(SessionControl),
    /// Data-ack metadata.
    DataAck(DataAck),
}

impl Metadata {
    /// The protocol tag.
    pub fn protocol(&self) -> Protocol {
        match self {
            Metadata::SessionControl(sc) => sc.protocol,
            Metadata::DataAck(da) => da.protocol,
        }
    }

    /// The target session ID.
    pub fn session_id(&self) -> u32 {
        match self {
            Metadata::SessionControl(sc) => sc.session_id,
            Metadata::DataAck(da) => da.session_id,
        }
    }

    /// The encrypted payload length announced by this metadata.
    pub fn payload_len(&self) -> u16 {
        match self {
            Metadata::SessionControl(sc) => sc.payload_len,
            Metadata::DataAck(da) => da.payload_len,
        }
    }

    /// Serialize into the fixed metadata block.
    pub fn marshal(&self) -> [u8; METADATA_LEN] {
        match self {
            Metadata::SessionControl(sc) => sc.marshal(),
            Metadata::DataAck(da) => da.marshal(),
        }
    }

    /// Parse a decrypted metadata block by inspecting its protocol tag.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() != METADATA_LEN {
            return Err(Error::Framing {
                expected: METADATA_LEN,
                actual: buf.len(),
            });
        }
        let tag = buf[0];
        if Protocol::is_session_control_byte(tag) {
            Ok(Metadata::SessionControl(SessionControl::unmarshal(buf)?))
        } else if Protocol::is_data_ack_byte(tag) {
            Ok(Metadata::DataAck(DataAck::unmarshal(buf)?))
        } else {
            Err(Error::UnknownProtocol(tag))
        }
    }
}

/// Lengths a receiver needs to skip a segment with an unrecognized tag.
///
/// Reads the common header fields only, so it works for any future
/// protocol class that keeps the shared layout.
pub(crate) fn skip_lengths(buf: &[u8]) -> (usize, usize, usize) {
    debug_assert_eq!(buf.len(), METADATA_LEN);
    let prefix = buf[PREFIX_LEN_OFFSET] as usize;
    let payload =
        u16::from_be_bytes([buf[PAYLOAD_LEN_OFFSET], buf[PAYLOAD_LEN_OFFSET + 1]]) as usize;
    let suffix = buf[SUFFIX_LEN_OFFSET] as usize;
    (prefix, payload, suffix)
}
