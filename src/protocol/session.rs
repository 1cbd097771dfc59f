//! Logical sessions multiplexed over an underlay.
//!
//! A session is one ordered byte stream with its own ID and lifecycle:
//!
//! ```text
//! INIT ──open request sent/received──▶ OPENING
//! OPENING ──open response matched──▶ ESTABLISHED
//! ESTABLISHED ──close request sent/received──▶ CLOSING
//! CLOSING ──peer ack / drain complete──▶ CLOSED
//! any state ──underlay fatal error──▶ CLOSED
//! ```
//!
//! Two cooperating loops run per session: the input loop drains segments
//! delivered by the underlay's event loop and reassembles ordered bytes
//! for the application reader; the output loop frames application writes
//! into MTU-sized data segments and hands them to the underlay writer.
//! Every queue between the layers is bounded, so a slow reader
//! backpressures all the way to the peer's TCP send window.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::protocol::metadata::{Metadata, Protocol};
use crate::protocol::segment::Segment;
use crate::protocol::tcp::TcpUnderlay;
use crate::protocol::underlay::wait_until;

/// Session identifier; 0 is reserved.
pub type SessionId = u32;

/// Segments buffered between the event loop and the input loop.
const INBOX_CAPACITY: usize = 64;
/// Application write chunks buffered ahead of framing.
const EGRESS_CAPACITY: usize = 16;
/// Ordered chunks buffered ahead of the application reader.
const INGRESS_CAPACITY: usize = 64;
/// Idle interval between liveness segments.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Session lifecycle state, strictly advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, not yet attached to an underlay.
    Init,
    /// Open handshake in flight.
    Opening,
    /// Both peers agree the session exists.
    Established,
    /// Close handshake in flight.
    Closing,
    /// Both loops are done; the underlay may drop the session.
    Closed,
}

/// Directives the input loop hands to the output loop.
enum Control {
    SendOpenResponse,
    SendCloseRequest,
    SendCloseResponse,
}

/// One logical ordered byte stream on an underlay.
///
/// The session does not own its underlay; it holds a weak back-reference
/// and must not outlive the underlay's session-table entry.
pub struct Session {
    id: SessionId,
    is_client: bool,
    mtu: usize,
    state: watch::Sender<SessionState>,

    // Segments from the underlay event loop, drained by the input loop.
    inbox_tx: mpsc::Sender<Segment>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Segment>>>,

    // Application writes awaiting framing, drained by the output loop.
    egress_tx: mpsc::Sender<Bytes>,
    egress_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    // Ordered inbound bytes; the sender is dropped to signal EOF.
    ingress_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    ingress_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    ctrl_tx: mpsc::Sender<Control>,
    ctrl_rx: Mutex<Option<mpsc::Receiver<Control>>>,

    conn: OnceLock<Weak<TcpUnderlay>>,

    // Next inbound data sequence number we expect; doubles as the
    // unacknowledged-sequence field on everything we send.
    next_recv_seq: AtomicU32,
    peer_unack: AtomicU32,
    peer_window: AtomicU32,
    reset: AtomicBool,
}

impl Session {
    /// Create a detached session.
    pub fn new(id: SessionId, is_client: bool, mtu: usize) -> Arc<Self> {
        debug_assert_ne!(id, 0, "session ID 0 is reserved");
        let (state, _) = watch::channel(SessionState::Init);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_CAPACITY);
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
        Arc::new(Self {
            id,
            is_client,
            mtu,
            state,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            egress_tx,
            egress_rx: Mutex::new(Some(egress_rx)),
            ingress_tx: Mutex::new(Some(ingress_tx)),
            ingress_rx: tokio::sync::Mutex::new(ingress_rx),
            ctrl_tx,
            ctrl_rx: Mutex::new(Some(ctrl_rx)),
            conn: OnceLock::new(),
            next_recv_seq: AtomicU32::new(0),
            peer_unack: AtomicU32::new(0),
            peer_window: AtomicU32::new(0),
            reset: AtomicBool::new(false),
        })
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether this is the dialing peer's half of the session.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Bind this session to its owning underlay. Fails if already bound.
    pub(crate) fn attach(&self, conn: Weak<TcpUnderlay>) -> Result<()> {
        self.conn
            .set(conn)
            .map_err(|_| Error::InvalidOperation("session is already attached to an underlay"))
    }

    /// Hand a segment from the underlay event loop to this session.
    ///
    /// Blocks when the inbox is full, propagating backpressure upstream
    /// to the transport receive window.
    pub(crate) async fn deliver(&self, seg: Segment) -> Result<()> {
        self.inbox_tx
            .send(seg)
            .await
            .map_err(|_| Error::ConnectionReset)
    }

    /// Queue application bytes for transmission.
    ///
    /// Blocks when the egress queue is full.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.state() > SessionState::Established {
            return Err(Error::ConnectionReset);
        }
        self.egress_tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| Error::ConnectionReset)
    }

    /// Receive the next ordered chunk of bytes.
    ///
    /// Returns `Ok(None)` after a clean close and
    /// [`Error::ConnectionReset`] if the underlay terminated underneath
    /// the session.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let mut rx = self.ingress_rx.lock().await;
        match rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None if self.reset.load(Ordering::Acquire) => Err(Error::ConnectionReset),
            None => Ok(None),
        }
    }

    /// Initiate a close handshake and wait for the session to finish.
    pub async fn close(&self) {
        if self.state() < SessionState::Closing {
            let _ = self.ctrl_tx.send(Control::SendCloseRequest).await;
        }
        self.wait_closed().await;
    }

    /// Wait until the open handshake resolves.
    ///
    /// Returns [`Error::ConnectionReset`] if the session died first.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s >= SessionState::Established)
            .await
            .map_err(|_| Error::ConnectionReset)?;
        if *state == SessionState::Established {
            Ok(())
        } else {
            Err(Error::ConnectionReset)
        }
    }

    /// Wait until both loops have finished.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Terminate immediately because the owning underlay died.
    pub(crate) fn abort(&self) {
        self.reset.store(true, Ordering::Release);
        self.set_state(SessionState::Closed);
    }

    /// Advance the lifecycle state; transitions never regress.
    fn set_state(&self, next: SessionState) {
        self.state.send_modify(|s| {
            if next > *s {
                *s = next;
            }
        });
    }

    /// Remaining inbound buffering, advertised to the peer.
    fn recv_window(&self) -> u16 {
        self.ingress_tx
            .lock()
            .as_ref()
            .map(|tx| tx.capacity().min(u16::MAX as usize) as u16)
            .unwrap_or(0)
    }

    fn close_ingress(&self) {
        self.ingress_tx.lock().take();
    }

    /// Drain the inbox: handshake segments drive the state machine, data
    /// segments become ordered bytes for the application reader.
    pub(crate) async fn run_input_loop(
        self: Arc<Self>,
        mut done: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut inbox = self
            .inbox_rx
            .lock()
            .take()
            .ok_or(Error::InvalidOperation("input loop is already running"))?;
        let mut state_rx = self.state.subscribe();

        let result = loop {
            let seg = tokio::select! {
                biased;
                _ = wait_until(&mut done, |d| *d) => break Err(Error::ConnectionReset),
                _ = wait_until(&mut state_rx, |s| *s == SessionState::Closed) => break Ok(()),
                seg = inbox.recv() => match seg {
                    Some(seg) => seg,
                    None => break Err(Error::ConnectionReset),
                },
            };

            match seg.metadata {
                Metadata::SessionControl(sc) => match sc.protocol {
                    Protocol::OpenSessionRequest => {
                        if self.is_client {
                            tracing::debug!(session = self.id, "ignoring open request on client");
                            continue;
                        }
                        self.set_state(SessionState::Established);
                        let _ = self.ctrl_tx.send(Control::SendOpenResponse).await;
                        if !seg.payload.is_empty() {
                            self.deliver_payload(seg.payload).await;
                        }
                    }
                    Protocol::OpenSessionResponse => {
                        if !self.is_client {
                            tracing::debug!(session = self.id, "ignoring open response on server");
                            continue;
                        }
                        self.set_state(SessionState::Established);
                        if !seg.payload.is_empty() {
                            self.deliver_payload(seg.payload).await;
                        }
                    }
                    Protocol::CloseSessionRequest => {
                        self.set_state(SessionState::Closing);
                        let _ = self.ctrl_tx.send(Control::SendCloseResponse).await;
                    }
                    Protocol::CloseSessionResponse => {
                        self.set_state(SessionState::Closed);
                        break Ok(());
                    }
                    // Connection-scoped tags are handled by the underlay
                    // and never reach a session.
                    Protocol::CloseConnRequest | Protocol::CloseConnResponse => {}
                    _ => {}
                },
                Metadata::DataAck(da) => {
                    self.peer_unack.store(da.unack_seq, Ordering::Relaxed);
                    self.peer_window.store(da.window as u32, Ordering::Relaxed);
                    match da.protocol {
                        Protocol::Data => {
                            let expected = self.next_recv_seq.load(Ordering::Relaxed);
                            // The stream delivers in order; anything below
                            // the cursor is a duplicate.
                            if da.seq.wrapping_sub(expected) > u32::MAX / 2 {
                                tracing::trace!(
                                    session = self.id,
                                    seq = da.seq,
                                    expected,
                                    "dropping duplicate data segment"
                                );
                                continue;
                            }
                            self.next_recv_seq
                                .store(da.seq.wrapping_add(1), Ordering::Relaxed);
                            self.deliver_payload(seg.payload).await;
                        }
                        Protocol::Ack | Protocol::Heartbeat => {}
                        _ => {}
                    }
                }
            }
        };

        if result.is_err() {
            self.reset.store(true, Ordering::Release);
        }
        self.close_ingress();
        self.set_state(SessionState::Closed);
        result
    }

    async fn deliver_payload(&self, payload: Bytes) {
        let tx = self.ingress_tx.lock().clone();
        if let Some(tx) = tx {
            // The reader may be slow or gone; give up once the session
            // closes so the loop is never wedged on a full buffer.
            let mut state_rx = self.state.subscribe();
            tokio::select! {
                res = tx.send(payload) => {
                    let _ = res;
                }
                _ = wait_until(&mut state_rx, |s| *s == SessionState::Closed) => {}
            }
        }
    }

    /// Frame application writes into data segments and hand them to the
    /// underlay writer; also emits handshake and liveness segments.
    pub(crate) async fn run_output_loop(
        self: Arc<Self>,
        mut done: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut egress = self
            .egress_rx
            .lock()
            .take()
            .ok_or(Error::InvalidOperation("output loop is already running"))?;
        let mut ctrl = self
            .ctrl_rx
            .lock()
            .take()
            .ok_or(Error::InvalidOperation("output loop is already running"))?;
        let conn = self
            .conn
            .get()
            .cloned()
            .ok_or(Error::InvalidOperation("session is not attached"))?;
        let mut state_rx = self.state.subscribe();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let max_payload = Segment::max_payload(self.mtu).max(1);
        let mut next_seq: u32 = 0;

        if self.is_client {
            self.set_state(SessionState::Opening);
            let open = Segment::open_session_request(self.id, Bytes::new());
            if let Err(e) = self.write_via(&conn, open).await {
                self.reset.store(true, Ordering::Release);
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = wait_until(&mut done, |d| *d) => break Err(Error::ConnectionReset),
                _ = wait_until(&mut state_rx, |s| *s == SessionState::Closed) => break Ok(()),
                directive = ctrl.recv() => {
                    let Some(directive) = directive else { break Ok(()) };
                    match directive {
                        Control::SendOpenResponse => {
                            let seg = Segment::open_session_response(self.id);
                            if let Err(e) = self.write_via(&conn, seg).await {
                                break Err(e);
                            }
                        }
                        Control::SendCloseRequest => {
                            self.set_state(SessionState::Closing);
                            let seg = Segment::close_session_request(self.id, next_seq);
                            if let Err(e) = self.write_via(&conn, seg).await {
                                break Err(e);
                            }
                        }
                        Control::SendCloseResponse => {
                            let seg = Segment::close_session_response(self.id, next_seq);
                            let res = self.write_via(&conn, seg).await;
                            self.set_state(SessionState::Closed);
                            break res;
                        }
                    }
                }
                chunk = egress.recv() => {
                    let Some(chunk) = chunk else { break Ok(()) };
                    let mut failed = None;
                    for piece in chunk.chunks(max_payload) {
                        let seg = Segment::data(
                            self.id,
                            next_seq,
                            self.next_recv_seq.load(Ordering::Relaxed),
                            self.recv_window(),
                            Bytes::copy_from_slice(piece),
                        );
                        next_seq = next_seq.wrapping_add(1);
                        if let Err(e) = self.write_via(&conn, seg).await {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if self.state() == SessionState::Established {
                        let seg = Segment::heartbeat(
                            self.id,
                            next_seq,
                            self.next_recv_seq.load(Ordering::Relaxed),
                            self.recv_window(),
                        );
                        if let Err(e) = self.write_via(&conn, seg).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        if result.is_err() {
            self.reset.store(true, Ordering::Release);
        }
        self.set_state(SessionState::Closed);
        result
    }

    async fn write_via(&self, conn: &Weak<TcpUnderlay>, seg: Segment) -> Result<()> {
        let Some(underlay) = conn.upgrade() else {
            return Err(Error::ConnectionReset);
        };
        match underlay.write_segment(&seg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A write failure on the shared stream is fatal to every
                // session on the underlay, not just this one.
                underlay.close();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering_matches_lifecycle() {
        assert!(SessionState::Init < SessionState::Opening);
        assert!(SessionState::Opening < SessionState::Established);
        assert!(SessionState::Established < SessionState::Closing);
        assert!(SessionState::Closing < SessionState::Closed);
    }

    #[test]
    fn test_state_never_regresses() {
        let session = Session::new(1, true, 1400);
        session.set_state(SessionState::Established);
        session.set_state(SessionState::Opening);
        assert_eq!(session.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_abort_resets_reader_and_waiters() {
        let session = Session::new(1, true, 1400);
        session.abort();

        assert!(matches!(
            session.wait_established().await,
            Err(Error::ConnectionReset)
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let session = Session::new(1, true, 1400);
        session.abort();
        assert!(matches!(
            session.write(b"late").await,
            Err(Error::ConnectionReset)
        ));
    }
}
