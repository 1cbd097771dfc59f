//! Framed units carried by an underlay.

use bytes::Bytes;

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::protocol::metadata::{DataAck, Metadata, Protocol, SessionControl, METADATA_LEN};

/// One framed unit: metadata plus an opaque payload.
///
/// Padding lengths inside the metadata are chosen by the underlay at
/// write time; constructors leave them zero.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Authenticated metadata.
    pub metadata: Metadata,
    /// Opaque payload bytes; may be empty.
    pub payload: Bytes,
}

impl Segment {
    /// The protocol tag of this segment.
    pub fn protocol(&self) -> Protocol {
        self.metadata.protocol()
    }

    /// The session this segment addresses.
    pub fn session_id(&self) -> u32 {
        self.metadata.session_id()
    }

    /// Largest payload that fits a segment within `mtu` on-wire bytes,
    /// accounting for metadata, two authentication tags, and the nonce a
    /// first segment carries.
    pub fn max_payload(mtu: usize) -> usize {
        mtu.saturating_sub(METADATA_LEN + 2 * TAG_SIZE + NONCE_SIZE)
    }

    fn session_control(protocol: Protocol, session_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            metadata: Metadata::SessionControl(SessionControl {
                protocol,
                session_id,
                seq,
                status: 0,
                payload_len: payload.len() as u16,
                suffix_len: 0,
            }),
            payload,
        }
    }

    fn data_ack(
        protocol: Protocol,
        session_id: u32,
        seq: u32,
        unack_seq: u32,
        window: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            metadata: Metadata::DataAck(DataAck {
                protocol,
                session_id,
                seq,
                unack_seq,
                window,
                prefix_len: 0,
                payload_len: payload.len() as u16,
                suffix_len: 0,
            }),
            payload,
        }
    }

    /// Request opening a session.
    pub fn open_session_request(session_id: u32, payload: Bytes) -> Self {
        Self::session_control(Protocol::OpenSessionRequest, session_id, 0, payload)
    }

    /// Acknowledge a session open.
    pub fn open_session_response(session_id: u32) -> Self {
        Self::session_control(Protocol::OpenSessionResponse, session_id, 0, Bytes::new())
    }

    /// Request closing a session.
    pub fn close_session_request(session_id: u32, seq: u32) -> Self {
        Self::session_control(Protocol::CloseSessionRequest, session_id, seq, Bytes::new())
    }

    /// Acknowledge a session close.
    pub fn close_session_response(session_id: u32, seq: u32) -> Self {
        Self::session_control(Protocol::CloseSessionResponse, session_id, seq, Bytes::new())
    }

    /// Ordered payload bytes.
    pub fn data(session_id: u32, seq: u32, unack_seq: u32, window: u16, payload: Bytes) -> Self {
        Self::data_ack(Protocol::Data, session_id, seq, unack_seq, window, payload)
    }

    /// Acknowledgment without payload.
    pub fn ack(session_id: u32, seq: u32, unack_seq: u32, window: u16) -> Self {
        Self::data_ack(Protocol::Ack, session_id, seq, unack_seq, window, Bytes::new())
    }

    /// Liveness signal on an idle session.
    pub fn heartbeat(session_id: u32, seq: u32, unack_seq: u32, window: u16) -> Self {
        Self::data_ack(
            Protocol::Heartbeat,
            session_id,
            seq,
            unack_seq,
            window,
            Bytes::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_payload_len() {
        let seg = Segment::data(9, 3, 2, 64, Bytes::from_static(b"abcdef"));
        assert_eq!(seg.protocol(), Protocol::Data);
        assert_eq!(seg.session_id(), 9);
        assert_eq!(seg.metadata.payload_len(), 6);

        let seg = Segment::open_session_request(1, Bytes::new());
        assert_eq!(seg.metadata.payload_len(), 0);
        assert!(seg.protocol().is_session_control());
    }

    #[test]
    fn test_max_payload_accounts_for_overhead() {
        let max = Segment::max_payload(1400);
        assert_eq!(max, 1400 - METADATA_LEN - 2 * TAG_SIZE - NONCE_SIZE);
        assert_eq!(Segment::max_payload(10), 0);
    }
}
