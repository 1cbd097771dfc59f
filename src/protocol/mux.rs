//! Session-to-underlay routing.
//!
//! The client mux maintains a target number of live underlays (the
//! *multiplex factor*) and spreads new sessions over them; factor 0
//! disables multiplexing and gives every session its own underlay.
//! Endpoints are dialed round-robin, so the order is deterministic for a
//! given endpoint list; reuse among live underlays is randomized, weighted
//! by capacity headroom.
//!
//! The server mux wraps accepted connections in underlays and aggregates
//! their incoming sessions behind a single accept call for the proxy
//! front-end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::crypto::{derive_user_key, BlockCipher};
use crate::error::{Error, Result};
use crate::protocol::session::{Session, SessionId};
use crate::protocol::tcp::TcpUnderlay;
use crate::protocol::underlay::wait_until;
use crate::replay::ReplayCache;

/// Sessions accepted across all underlays, awaiting the front-end.
const ACCEPT_BACKLOG: usize = 64;

/// The highest supported multiplex factor.
const MAX_MULTIPLEX_FACTOR: u8 = 3;

/// One user allowed on a listener, stored as a password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    /// User name; salts the key derivation.
    pub name: String,
    /// SHA-256 of the user's password.
    pub password_hash: [u8; 32],
}

impl UserCredential {
    /// Build a credential from a raw password.
    pub fn new(name: impl Into<String>, password: &str) -> Self {
        Self {
            name: name.into(),
            password_hash: crate::crypto::hash_password(password),
        }
    }

    /// Derive this user's candidate cipher for TCP underlays.
    pub(crate) fn cipher(&self) -> BlockCipher {
        let key = derive_user_key(&self.name, &self.password_hash);
        let mut cipher = BlockCipher::new(&key);
        cipher.set_implicit_nonce_mode(true);
        cipher
    }
}

/// Mux configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Candidate remote endpoints (client side).
    pub endpoints: Vec<SocketAddr>,
    /// Users: exactly one on the client, one per allowed user on the
    /// server.
    pub users: Vec<UserCredential>,
    /// Target number of live underlays, `0..=3`; 0 disables multiplexing.
    pub multiplex_factor: u8,
    /// Maximum transmission unit for segments.
    pub mtu: usize,
    /// Sessions an underlay is considered full at; drives the headroom
    /// weighting when reusing underlays.
    pub max_sessions_per_underlay: usize,
    /// How long to wait for an open handshake.
    pub open_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            users: Vec::new(),
            multiplex_factor: crate::DEFAULT_MULTIPLEX_FACTOR,
            mtu: crate::DEFAULT_MTU,
            max_sessions_per_underlay: 32,
            open_timeout: Duration::from_millis(crate::OPEN_TIMEOUT_MS),
        }
    }
}

/// Routes sessions onto underlays; one instance per role per process.
pub struct Mux {
    is_client: bool,
    config: MuxConfig,
    candidates: Vec<BlockCipher>,
    replay: Arc<ReplayCache>,
    underlays: Mutex<Vec<Arc<TcpUnderlay>>>,
    next_endpoint: AtomicUsize,
    next_session_id: AtomicU32,
    shutdown: watch::Sender<bool>,
    accepted_tx: mpsc::Sender<Arc<Session>>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
}

impl Mux {
    /// Create a client mux.
    ///
    /// Requires at least one endpoint and exactly one user, whose
    /// credential derives the sole candidate cipher.
    pub fn new_client(config: MuxConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::InvalidOperation("client mux needs at least one endpoint"));
        }
        if config.users.len() != 1 {
            return Err(Error::InvalidOperation("client mux needs exactly one user"));
        }
        let candidates = vec![config.users[0].cipher()];
        Ok(Self::build(true, config, candidates, Arc::new(ReplayCache::default())))
    }

    /// Create a server mux over an externally owned replay cache.
    ///
    /// Candidate ciphers are derived from every configured user; the
    /// first inbound segment of each connection identifies which one the
    /// peer holds.
    pub fn new_server(config: MuxConfig, replay: Arc<ReplayCache>) -> Result<Self> {
        if config.users.is_empty() {
            return Err(Error::InvalidOperation("server mux needs at least one user"));
        }
        let candidates = config.users.iter().map(|u| u.cipher()).collect();
        Ok(Self::build(false, config, candidates, replay))
    }

    fn build(
        is_client: bool,
        config: MuxConfig,
        candidates: Vec<BlockCipher>,
        replay: Arc<ReplayCache>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Self {
            is_client,
            config,
            candidates,
            replay,
            underlays: Mutex::new(Vec::new()),
            next_endpoint: AtomicUsize::new(0),
            next_session_id: AtomicU32::new(1),
            shutdown,
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        }
    }

    /// The replay cache shared by this mux's underlays.
    pub fn replay(&self) -> &ReplayCache {
        &self.replay
    }

    /// Number of live underlays.
    pub fn underlay_count(&self) -> usize {
        let mut underlays = self.underlays.lock();
        underlays.retain(|u| !u.is_closed());
        underlays.len()
    }

    /// Open a new outbound session, dialing or reusing an underlay per
    /// the multiplex factor, and wait for the open handshake.
    pub async fn open_session(&self) -> Result<Arc<Session>> {
        if !self.is_client {
            return Err(Error::InvalidOperation("server mux cannot open sessions"));
        }
        let underlay = self.pick_underlay().await?;
        let session = Session::new(self.alloc_session_id(), true, self.config.mtu);
        underlay.add_session(Arc::clone(&session))?;

        match tokio::time::timeout(self.config.open_timeout, session.wait_established()).await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                session.abort();
                Err(Error::Timeout(self.config.open_timeout.as_millis() as u64))
            }
        }
    }

    async fn pick_underlay(&self) -> Result<Arc<TcpUnderlay>> {
        let factor = self.config.multiplex_factor.min(MAX_MULTIPLEX_FACTOR) as usize;
        let live: Vec<Arc<TcpUnderlay>> = {
            let mut underlays = self.underlays.lock();
            underlays.retain(|u| !u.is_closed());
            underlays.clone()
        };

        if factor == 0 || live.len() < factor {
            return self.dial_underlay().await;
        }

        // Reuse an existing underlay, favoring the ones with headroom.
        let max = self.config.max_sessions_per_underlay.max(1);
        let weights: Vec<usize> = live
            .iter()
            .map(|u| max.saturating_sub(u.session_count()) + 1)
            .collect();
        let total: usize = weights.iter().sum();
        let mut pick = rand::thread_rng().gen_range(0..total);
        for (underlay, weight) in live.iter().zip(&weights) {
            if pick < *weight {
                return Ok(Arc::clone(underlay));
            }
            pick -= weight;
        }
        Ok(Arc::clone(&live[live.len() - 1]))
    }

    async fn dial_underlay(&self) -> Result<Arc<TcpUnderlay>> {
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let endpoint = self.config.endpoints[index % self.config.endpoints.len()];
        let underlay = TcpUnderlay::dial(
            endpoint,
            self.config.mtu,
            self.candidates[0].clone(),
            Arc::clone(&self.replay),
        )
        .await?;

        let event_underlay = Arc::clone(&underlay);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = event_underlay.run_event_loop(shutdown).await {
                tracing::debug!(underlay = %event_underlay, error = %e, "client event loop exited");
            }
        });

        let mut underlays = self.underlays.lock();
        underlays.retain(|u| !u.is_closed());
        underlays.push(Arc::clone(&underlay));
        Ok(underlay)
    }

    fn alloc_session_id(&self) -> SessionId {
        loop {
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Accept connections on `listener`, wrapping each in a server
    /// underlay, until the mux is closed.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.is_client {
            return Err(Error::InvalidOperation("client mux cannot serve"));
        }
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = wait_until(&mut shutdown, |s| *s) => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = self.spawn_underlay(stream) {
                        tracing::warn!(peer = %peer, error = %e, "rejected connection");
                    }
                }
            }
        }
    }

    fn spawn_underlay(&self, stream: tokio::net::TcpStream) -> Result<()> {
        let underlay = TcpUnderlay::from_accepted(
            stream,
            self.config.mtu,
            self.candidates.clone(),
            Arc::clone(&self.replay),
        )?;
        {
            let mut underlays = self.underlays.lock();
            underlays.retain(|u| !u.is_closed());
            underlays.push(Arc::clone(&underlay));
        }

        let event_underlay = Arc::clone(&underlay);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = event_underlay.run_event_loop(shutdown).await {
                tracing::debug!(underlay = %event_underlay, error = %e, "server event loop exited");
            }
        });

        let accepted_tx = self.accepted_tx.clone();
        tokio::spawn(async move {
            while let Some(session) = underlay.accept_session().await {
                if accepted_tx.send(session).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Wait for the next session opened by a peer, across all underlays.
    pub async fn accept_session(&self) -> Option<Arc<Session>> {
        let mut rx = self.accepted_rx.lock().await;
        rx.recv().await
    }

    /// Tear down every underlay and stop serving. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send_replace(true);
        let underlays: Vec<Arc<TcpUnderlay>> = {
            let mut guard = self.underlays.lock();
            guard.drain(..).collect()
        };
        for underlay in underlays {
            underlay.close();
        }
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn client_config(endpoints: Vec<SocketAddr>, factor: u8) -> MuxConfig {
        MuxConfig {
            endpoints,
            users: vec![UserCredential::new("alice", "pw-alice")],
            multiplex_factor: factor,
            ..MuxConfig::default()
        }
    }

    fn server_config() -> MuxConfig {
        MuxConfig {
            users: vec![UserCredential::new("alice", "pw-alice")],
            ..MuxConfig::default()
        }
    }

    /// Server mux plus a task echoing every accepted session.
    async fn start_server() -> (SocketAddr, Arc<Mux>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mux = Arc::new(
            Mux::new_server(server_config(), Arc::new(ReplayCache::default())).unwrap(),
        );

        let serve_mux = Arc::clone(&mux);
        tokio::spawn(async move {
            let _ = serve_mux.serve(listener).await;
        });
        let accept_mux = Arc::clone(&mux);
        tokio::spawn(async move {
            while let Some(session) = accept_mux.accept_session().await {
                tokio::spawn(async move {
                    while let Ok(Some(chunk)) = session.read().await {
                        if session.write(&chunk).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, mux)
    }

    #[tokio::test]
    async fn test_echo_through_mux() {
        let (addr, _server) = start_server().await;
        let client = Mux::new_client(client_config(vec![addr], 1)).unwrap();

        let session = client.open_session().await.unwrap();
        session.write(b"ping over the mux").await.unwrap();

        let chunk = timeout(Duration::from_secs(5), session.read())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"ping over the mux");
    }

    #[tokio::test]
    async fn test_factor_zero_dials_per_session() {
        let (addr, _server) = start_server().await;
        let client = Mux::new_client(client_config(vec![addr], 0)).unwrap();

        let _one = client.open_session().await.unwrap();
        let _two = client.open_session().await.unwrap();
        assert_eq!(client.underlay_count(), 2);
    }

    #[tokio::test]
    async fn test_factor_bounds_live_underlays() {
        let (addr, _server) = start_server().await;
        let client = Mux::new_client(client_config(vec![addr], 2)).unwrap();

        let mut sessions = Vec::new();
        for _ in 0..5 {
            sessions.push(client.open_session().await.unwrap());
        }
        assert_eq!(client.underlay_count(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_endpoint_order() {
        let (addr_a, _server_a) = start_server().await;
        let (addr_b, _server_b) = start_server().await;
        let client = Mux::new_client(client_config(vec![addr_a, addr_b], 0)).unwrap();

        use crate::protocol::underlay::Underlay as _;
        let one = client.open_session().await.unwrap();
        let two = client.open_session().await.unwrap();
        let remotes: Vec<SocketAddr> = {
            let underlays = client.underlays.lock();
            underlays.iter().map(|u| u.remote_addr()).collect()
        };
        assert_eq!(remotes, vec![addr_a, addr_b]);
        drop((one, two));
    }

    #[tokio::test]
    async fn test_new_underlay_after_teardown() {
        let (addr, _server) = start_server().await;
        let client = Mux::new_client(client_config(vec![addr], 1)).unwrap();

        let session = client.open_session().await.unwrap();
        assert_eq!(client.underlay_count(), 1);
        timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close timed out");

        // The emptied underlay closed itself; the next open dials anew.
        timeout(Duration::from_secs(1), async {
            while client.underlay_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("underlay survived its last session");

        let session = client.open_session().await.unwrap();
        assert_eq!(client.underlay_count(), 1);
        drop(session);
    }

    #[tokio::test]
    async fn test_open_session_times_out_without_server() {
        // A listener that accepts but never runs an event loop.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // Hold the socket open, answer nothing.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(stream);
                });
            }
        });

        let mut config = client_config(vec![addr], 1);
        config.open_timeout = Duration::from_millis(200);
        let client = Mux::new_client(config).unwrap();
        assert!(matches!(
            client.open_session().await,
            Err(Error::Timeout(200))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(Mux::new_client(MuxConfig::default()).is_err());
        assert!(Mux::new_server(MuxConfig::default(), Arc::new(ReplayCache::default())).is_err());

        let mut two_users = client_config(vec!["127.0.0.1:1".parse().unwrap()], 1);
        two_users.users.push(UserCredential::new("bob", "pw"));
        assert!(Mux::new_client(two_users).is_err());
    }
}
