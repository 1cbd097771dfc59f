//! TCP underlay: one encrypted stream carrying many sessions.
//!
//! A single event loop task reads segments sequentially and dispatches
//! them: session-control segments drive the session table, data-ack
//! segments are routed to their session's inbox. Writes from session
//! output loops are serialized by a mutex around the write half, and each
//! segment goes out in a single write call so captures never show a
//! segment split across syscalls.
//!
//! Cipher lifecycle on the shared stream:
//! - the client clones its sole candidate for both directions;
//! - the server picks its receive cipher by trial decryption of the first
//!   inbound segment, then derives the send cipher from it with a fresh
//!   nonce counter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::crypto::{
    new_padding, padding_len, select_decrypt, BlockCipher, NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::metadata::{
    skip_lengths, DataAck, Metadata, Protocol, SessionControl, METADATA_LEN,
};
use crate::protocol::segment::Segment;
use crate::protocol::session::{Session, SessionId};
use crate::protocol::underlay::{wait_until, IpVersion, TransportProtocol, Underlay};
use crate::replay::ReplayCache;

/// Server-side sessions awaiting an accept call.
const READY_BACKLOG: usize = 16;

struct RecvState {
    reader: OwnedReadHalf,
    cipher: Option<BlockCipher>,
}

struct SendState {
    writer: OwnedWriteHalf,
    cipher: Option<BlockCipher>,
}

/// One TCP connection multiplexing encrypted segments for many sessions.
pub struct TcpUnderlay {
    me: Weak<TcpUnderlay>,
    is_client: bool,
    mtu: usize,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    // Reads happen solely in the event loop, which holds this lock for
    // its whole lifetime.
    recv: tokio::sync::Mutex<RecvState>,
    // Writes are serialized across all session output loops.
    send: tokio::sync::Mutex<SendState>,

    // Exactly one candidate on the client; one per user on the server.
    candidates: Vec<BlockCipher>,
    // Primed clone of the selected receive cipher; the server derives its
    // send cipher from it.
    recv_template: Mutex<Option<BlockCipher>>,

    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    ready_tx: mpsc::Sender<Arc<Session>>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,

    done: watch::Sender<bool>,
    replay: Arc<ReplayCache>,
}

impl TcpUnderlay {
    /// Connect to a remote endpoint with packet encryption.
    ///
    /// `cipher` becomes the sole candidate for both directions.
    pub async fn dial(
        addr: SocketAddr,
        mtu: usize,
        cipher: BlockCipher,
        replay: Arc<ReplayCache>,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        let underlay = Self::build(stream, true, mtu, vec![cipher], replay)?;
        tracing::debug!(underlay = %underlay, "created new client TCP underlay");
        Ok(underlay)
    }

    /// Wrap an accepted connection on the server side.
    ///
    /// `candidates` holds one cipher per user enabled on this listener.
    pub fn from_accepted(
        stream: TcpStream,
        mtu: usize,
        candidates: Vec<BlockCipher>,
        replay: Arc<ReplayCache>,
    ) -> Result<Arc<Self>> {
        let underlay = Self::build(stream, false, mtu, candidates, replay)?;
        tracing::debug!(underlay = %underlay, "created new server TCP underlay");
        Ok(underlay)
    }

    fn build(
        stream: TcpStream,
        is_client: bool,
        mtu: usize,
        candidates: Vec<BlockCipher>,
        replay: Arc<ReplayCache>,
    ) -> Result<Arc<Self>> {
        if candidates.is_empty() {
            return Err(Error::InvalidOperation("at least one candidate cipher is required"));
        }
        if is_client && candidates.len() != 1 {
            return Err(Error::InvalidOperation("client must have exactly one candidate cipher"));
        }
        if candidates.iter().any(|c| c.is_stateless()) {
            return Err(Error::StatelessCipher);
        }

        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (ready_tx, ready_rx) = mpsc::channel(READY_BACKLOG);
        let (done, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            is_client,
            mtu,
            local_addr,
            peer_addr,
            recv: tokio::sync::Mutex::new(RecvState {
                reader,
                cipher: None,
            }),
            send: tokio::sync::Mutex::new(SendState {
                writer,
                cipher: None,
            }),
            candidates,
            recv_template: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            done,
            replay,
        }))
    }

    /// Whether this is the dialing side.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Number of sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the underlay has terminated.
    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait for the next server-side session created by a peer's open
    /// request. Returns `None` once the underlay terminates.
    pub async fn accept_session(&self) -> Option<Arc<Session>> {
        let mut rx = self.ready_rx.lock().await;
        rx.recv().await
    }

    /// Register a session, bind it to this underlay, and start its loops.
    pub fn add_session(&self, session: Arc<Session>) -> Result<()> {
        if session.id() == 0 {
            return Err(Error::SessionIdReserved);
        }
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&session.id()) {
                return Err(Error::SessionIdInUse(session.id()));
            }
            sessions.insert(session.id(), Arc::clone(&session));
        }
        session.attach(self.me.clone())?;
        tracing::debug!(session = session.id(), underlay = %self, "adding session");

        let input = tokio::spawn(Arc::clone(&session).run_input_loop(self.done.subscribe()));
        let output = tokio::spawn(Arc::clone(&session).run_output_loop(self.done.subscribe()));
        let me = self.me.clone();
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            // The session lives until both loops have exited.
            let _ = input.await;
            let _ = output.await;
            if let Some(underlay) = me.upgrade() {
                let _ = underlay.remove_session(watched.id());
            }
        });
        Ok(())
    }

    /// Drop a session from the table; the underlay closes itself once the
    /// table is empty.
    pub fn remove_session(&self, session_id: SessionId) -> Result<()> {
        let (removed, empty) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&session_id).is_some();
            (removed, sessions.is_empty())
        };
        if removed {
            tracing::debug!(session = session_id, underlay = %self, "removed session");
            if empty {
                // The last session is gone; nothing else can close an
                // otherwise healthy underlay.
                self.close();
            }
            Ok(())
        } else {
            Err(Error::SessionNotFound(session_id))
        }
    }

    /// Tear down the underlay. Idempotent; the event loop observes the
    /// signal and releases the transport.
    pub fn close(&self) {
        if !self.done.send_replace(true) {
            tracing::debug!(underlay = %self, "closing");
        }
    }

    /// Read segments sequentially and dispatch them until the transport
    /// fails, the underlay closes, or `shutdown` fires.
    pub async fn run_event_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut done = self.done.subscribe();
        let mut recv = self
            .recv
            .try_lock()
            .map_err(|_| Error::InvalidOperation("event loop is already running"))?;

        let result = loop {
            tokio::select! {
                biased;
                _ = wait_until(&mut shutdown, |s| *s) => break Ok(()),
                _ = wait_until(&mut done, |d| *d) => break Ok(()),
                seg = self.read_segment(&mut recv) => match seg {
                    // A segment with an unknown future tag was skipped.
                    Ok(None) => continue,
                    Ok(Some(seg)) => {
                        tracing::trace!(
                            underlay = %self,
                            protocol = ?seg.protocol(),
                            payload = seg.payload.len(),
                            "received segment"
                        );
                        if matches!(
                            seg.protocol(),
                            Protocol::CloseConnRequest | Protocol::CloseConnResponse
                        ) {
                            // Acknowledged by dropping the transport.
                            break Ok(());
                        }
                        if let Err(e) = self.dispatch(seg).await {
                            if e.is_fatal_to_underlay() {
                                break Err(e);
                            }
                            // Session-scoped problems never kill the
                            // shared stream.
                            tracing::debug!(underlay = %self, error = %e, "dropped segment");
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        if let Err(e) = &result {
            tracing::debug!(underlay = %self, error = %e, "event loop failed");
        }
        self.terminate().await;
        result
    }

    async fn dispatch(&self, seg: Segment) -> Result<()> {
        match seg.protocol() {
            Protocol::OpenSessionRequest => self.on_open_session_request(seg).await,
            Protocol::OpenSessionResponse => self.on_open_session_response(seg).await,
            Protocol::CloseSessionRequest | Protocol::CloseSessionResponse => {
                self.on_close_session(seg).await
            }
            Protocol::Data | Protocol::Ack | Protocol::Heartbeat => {
                let session_id = seg.session_id();
                let session = self.sessions.lock().get(&session_id).cloned();
                match session {
                    Some(session) => session.deliver(seg).await,
                    // Late arrivals after a local close are expected.
                    None => Err(Error::SessionNotFound(session_id)),
                }
            }
            Protocol::CloseConnRequest | Protocol::CloseConnResponse => Ok(()),
        }
    }

    async fn on_open_session_request(&self, seg: Segment) -> Result<()> {
        if self.is_client {
            return Err(Error::InvalidOperation("open session request reached a client"));
        }
        let session_id = seg.session_id();
        if session_id == 0 {
            return Err(Error::SessionIdReserved);
        }
        if self.sessions.lock().contains_key(&session_id) {
            return Err(Error::SessionIdInUse(session_id));
        }
        let session = Session::new(session_id, false, self.mtu);
        self.add_session(Arc::clone(&session))?;
        session.deliver(seg).await?;
        self.ready_tx
            .send(session)
            .await
            .map_err(|_| Error::ConnectionReset)?;
        Ok(())
    }

    async fn on_open_session_response(&self, seg: Segment) -> Result<()> {
        if !self.is_client {
            return Err(Error::InvalidOperation("open session response reached a server"));
        }
        let session_id = seg.session_id();
        let session = self.sessions.lock().get(&session_id).cloned();
        match session {
            Some(session) => session.deliver(seg).await,
            None => Err(Error::SessionNotFound(session_id)),
        }
    }

    async fn on_close_session(&self, seg: Segment) -> Result<()> {
        let session_id = seg.session_id();
        let session = self.sessions.lock().get(&session_id).cloned();
        match session {
            Some(session) => session.deliver(seg).await,
            None => Err(Error::SessionNotFound(session_id)),
        }
    }

    /// Read one segment off the stream.
    ///
    /// Returns `Ok(None)` when a segment carried an unrecognized future
    /// protocol tag and was skipped in full.
    async fn read_segment(&self, recv: &mut RecvState) -> Result<Option<Segment>> {
        // Read encrypted metadata; the first read also carries the nonce.
        let first_read = recv.cipher.is_none();
        let mut read_len = METADATA_LEN + TAG_SIZE;
        if first_read {
            read_len += NONCE_SIZE;
        }
        let mut encrypted_meta = vec![0u8; read_len];
        recv.reader.read_exact(&mut encrypted_meta).await?;

        if self.replay.is_duplicate(&encrypted_meta) {
            if first_read {
                self.replay.record_new_session_replay();
                return Err(Error::Replay);
            }
            // The reverse direction of the same flow can legitimately
            // reproduce tags; count it, keep going.
            self.replay.record_known_session_replay();
        }

        let decrypted_meta = match recv.cipher.as_mut() {
            Some(cipher) => cipher.decrypt(&encrypted_meta)?,
            None if self.is_client => {
                let mut cipher = self.candidates[0].clone();
                let meta = cipher.decrypt(&encrypted_meta)?;
                recv.cipher = Some(cipher);
                meta
            }
            None => {
                let (cipher, meta) = select_decrypt(&encrypted_meta, &self.candidates)?;
                *self.recv_template.lock() = Some(cipher.clone());
                recv.cipher = Some(cipher);
                meta
            }
        };
        if decrypted_meta.len() != METADATA_LEN {
            return Err(Error::Framing {
                expected: METADATA_LEN,
                actual: decrypted_meta.len(),
            });
        }

        let tag = decrypted_meta[0];
        if Protocol::is_session_control_byte(tag) {
            let sc = SessionControl::unmarshal(&decrypted_meta)?;
            let payload = self.read_payload(recv, sc.payload_len as usize).await?;
            self.discard_padding(recv, sc.suffix_len as usize).await?;
            Ok(Some(Segment {
                metadata: Metadata::SessionControl(sc),
                payload,
            }))
        } else if Protocol::is_data_ack_byte(tag) {
            let da = DataAck::unmarshal(&decrypted_meta)?;
            self.discard_padding(recv, da.prefix_len as usize).await?;
            let payload = self.read_payload(recv, da.payload_len as usize).await?;
            self.discard_padding(recv, da.suffix_len as usize).await?;
            Ok(Some(Segment {
                metadata: Metadata::DataAck(da),
                payload,
            }))
        } else {
            // Unknown tag from a future version: the shared header still
            // tells us how much to consume, so skip the whole segment.
            let (prefix, payload_len, suffix) = skip_lengths(&decrypted_meta);
            self.discard_padding(recv, prefix).await?;
            let _ = self.read_payload(recv, payload_len).await?;
            self.discard_padding(recv, suffix).await?;
            tracing::debug!(underlay = %self, tag, "skipped segment with unknown protocol");
            Ok(None)
        }
    }

    async fn read_payload(&self, recv: &mut RecvState, len: usize) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut encrypted = vec![0u8; len + TAG_SIZE];
        recv.reader.read_exact(&mut encrypted).await?;
        if self.replay.is_duplicate(&encrypted) {
            self.replay.record_known_session_replay();
        }
        let cipher = recv.cipher.as_mut().ok_or(Error::RecvCipherNotReady)?;
        Ok(Bytes::from(cipher.decrypt(&encrypted)?))
    }

    async fn discard_padding(&self, recv: &mut RecvState, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let mut padding = vec![0u8; len];
        recv.reader.read_exact(&mut padding).await?;
        Ok(())
    }

    /// Encrypt and write one segment as a single transport write.
    ///
    /// Padding lengths are chosen here, uniform in `[0, 255)`.
    pub(crate) async fn write_segment(&self, seg: &Segment) -> Result<()> {
        let mut send = self.send.lock().await;
        let state = &mut *send;
        self.maybe_init_send_cipher(state)?;
        let cipher = state.cipher.as_mut().ok_or(Error::RecvCipherNotReady)?;

        let data = match &seg.metadata {
            Metadata::SessionControl(sc) => {
                let mut sc = *sc;
                let suffix = padding_len();
                sc.suffix_len = suffix as u8;
                sc.payload_len = seg.payload.len() as u16;

                let meta = cipher.encrypt(&sc.marshal())?;
                let mut data =
                    Vec::with_capacity(meta.len() + seg.payload.len() + TAG_SIZE + suffix);
                data.extend_from_slice(&meta);
                if !seg.payload.is_empty() {
                    data.extend_from_slice(&cipher.encrypt(&seg.payload)?);
                }
                data.extend_from_slice(&new_padding(suffix));
                data
            }
            Metadata::DataAck(da) => {
                let mut da = *da;
                let prefix = padding_len();
                let suffix = padding_len();
                da.prefix_len = prefix as u8;
                da.suffix_len = suffix as u8;
                da.payload_len = seg.payload.len() as u16;

                let meta = cipher.encrypt(&da.marshal())?;
                let mut data = Vec::with_capacity(
                    meta.len() + prefix + seg.payload.len() + TAG_SIZE + suffix,
                );
                data.extend_from_slice(&meta);
                data.extend_from_slice(&new_padding(prefix));
                if !seg.payload.is_empty() {
                    data.extend_from_slice(&cipher.encrypt(&seg.payload)?);
                }
                data.extend_from_slice(&new_padding(suffix));
                data
            }
        };

        state.writer.write_all(&data).await?;
        Ok(())
    }

    fn maybe_init_send_cipher(&self, state: &mut SendState) -> Result<()> {
        if state.cipher.is_some() {
            return Ok(());
        }
        if self.is_client {
            state.cipher = Some(self.candidates[0].clone());
            return Ok(());
        }
        let template = self.recv_template.lock();
        let Some(template) = template.as_ref() else {
            return Err(Error::RecvCipherNotReady);
        };
        // Same key as the receive direction, independent nonce counter.
        let mut cipher = template.clone();
        cipher.reset_nonce_counter();
        state.cipher = Some(cipher);
        Ok(())
    }

    async fn terminate(&self) {
        self.close();
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.abort();
        }
        // Half-close so the peer sees FIN promptly rather than waiting
        // for the last Arc to drop.
        let mut send = self.send.lock().await;
        let _ = send.writer.shutdown().await;
    }
}

impl std::fmt::Display for TcpUnderlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpUnderlay{{{} - {}}}", self.local_addr, self.peer_addr)
    }
}

impl Underlay for TcpUnderlay {
    fn add_session(&self, session: Arc<Session>) -> Result<()> {
        TcpUnderlay::add_session(self, session)
    }

    fn remove_session(&self, session_id: u32) -> Result<()> {
        TcpUnderlay::remove_session(self, session_id)
    }

    async fn run_event_loop(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        TcpUnderlay::run_event_loop(self, shutdown).await
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }

    fn ip_version(&self) -> IpVersion {
        IpVersion::from(self.local_addr)
    }

    fn close(&self) {
        TcpUnderlay::close(self)
    }
}
