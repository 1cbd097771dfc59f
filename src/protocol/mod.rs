//! Multiplexed transport protocol.
//!
//! This module implements the framed, encrypted wire protocol and the
//! machinery around it:
//!
//! 1. **Segment codec**: fixed-length authenticated metadata, optional
//!    payload, random padding ([`metadata`], [`segment`])
//! 2. **Sessions**: ordered logical byte streams with open/close
//!    handshakes ([`session`])
//! 3. **Underlays**: transport connections carrying many sessions, with a
//!    single read event loop and serialized writes ([`underlay`], [`tcp`])
//! 4. **Mux**: endpoint selection and the client's multiplex factor
//!    ([`mux`])

pub mod metadata;
pub mod mux;
pub mod segment;
pub mod session;
pub mod tcp;
pub mod underlay;

pub use metadata::{DataAck, Metadata, Protocol, SessionControl, METADATA_LEN};
pub use mux::{Mux, MuxConfig, UserCredential};
pub use segment::Segment;
pub use session::{Session, SessionId, SessionState};
pub use tcp::TcpUnderlay;
pub use underlay::{IpVersion, TransportProtocol, Underlay};
