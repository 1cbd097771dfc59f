//! Error types for the transport core.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the underlay, session, and mux layers.
///
/// Session-scoped errors (reserved or duplicate session IDs, segments for
/// unknown sessions) never terminate an underlay; crypto, framing, and I/O
/// errors on the shared stream always do.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport read or write failure
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Cryptographic operation failed outside of authentication
    #[error("cryptographic error: {0}")]
    Crypto(&'static str),

    /// No candidate cipher authenticated the first inbound segment
    #[error("no candidate cipher authenticates the peer")]
    CipherSelection,

    /// A segment after the first failed authentication
    #[error("decryption/authentication failed")]
    Decrypt,

    /// First-read authentication tag was already seen within the window
    #[error("possible replay attack detected")]
    Replay,

    /// Decrypted metadata has the wrong length
    #[error("framing error: expected {expected} metadata bytes, got {actual}")]
    Framing {
        /// The fixed metadata length.
        expected: usize,
        /// What actually came out of the cipher.
        actual: usize,
    },

    /// Protocol tag from a future version
    #[error("unknown protocol tag: 0x{0:02x}")]
    UnknownProtocol(u8),

    /// Session ID 0 is reserved
    #[error("session ID 0 is reserved")]
    SessionIdReserved,

    /// Open request for a session ID already registered on this underlay
    #[error("session ID {0} is already in use")]
    SessionIdInUse(u32),

    /// Segment addressed to a session this underlay does not know
    #[error("session ID {0} is not registered")]
    SessionNotFound(u32),

    /// A role-restricted operation arrived at the wrong peer
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Server tried to send before receiving anything
    #[error("receive cipher is not ready")]
    RecvCipherNotReady,

    /// A stateless cipher was offered to the TCP underlay
    #[error("TCP underlay requires a stateful (implicit-nonce) cipher")]
    StatelessCipher,

    /// Handshake or shutdown wait expired
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The owning underlay terminated while the session was active
    #[error("connection reset by underlay termination")]
    ConnectionReset,
}

impl Error {
    /// Whether this error terminates the whole underlay (and, transitively,
    /// every session multiplexed on it).
    pub fn is_fatal_to_underlay(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::CipherSelection
                | Error::Decrypt
                | Error::Replay
                | Error::Framing { .. }
                | Error::InvalidOperation(_)
                | Error::RecvCipherNotReady
        )
    }

    /// Whether this error indicates an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::CipherSelection | Error::Decrypt)
    }
}
