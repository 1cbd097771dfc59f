//! # veilmux
//!
//! Packet-encrypted multiplexed transport for censorship-resistant proxies.
//!
//! A single TCP connection (an *underlay*) carries many independent logical
//! byte streams (*sessions*). Every framed unit (*segment*) on the wire is
//! an authenticated ciphertext surrounded by random padding, so a passive
//! observer sees neither structure nor stable lengths, and an active
//! attacker replaying captured bytes is rejected by a bounded,
//! time-windowed replay cache shared across all underlays.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Application byte streams                 │
//! ├─────────────────────────────────────────────────────────┤
//! │  Sessions (ordered delivery, open/close handshakes)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Mux (endpoint selection, multiplex factor, accept)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  TCP underlay (event loop, segment codec, padding)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto layer (ChaCha20-Poly1305, implicit nonces)      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: no magic bytes, no negotiation preamble; the
//!    AEAD tag is the only indicator of validity
//! 2. **Replay defense**: first-segment tags are deduplicated across all
//!    underlays of the process
//! 3. **Isolation**: a failing session never disturbs its siblings on the
//!    same underlay; a failing underlay resets all of its sessions

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod protocol;
pub mod replay;

pub use error::{Error, Result};

/// Default maximum transmission unit for segments on an underlay.
pub const DEFAULT_MTU: usize = 1400;

/// Default number of live underlays a client maintains.
pub const DEFAULT_MULTIPLEX_FACTOR: u8 = 1;

/// Default time to wait for a session open handshake (milliseconds).
pub const OPEN_TIMEOUT_MS: u64 = 10_000;
