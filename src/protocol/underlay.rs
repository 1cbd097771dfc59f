//! The contract between the mux and a transport connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Result;
use crate::protocol::session::Session;

/// Transport carrying an underlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    /// Stream transport; ordered, reliable.
    Tcp,
    /// Datagram transport; implemented by a sibling underlay.
    Udp,
}

/// IP version of an underlay's local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl From<SocketAddr> for IpVersion {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => IpVersion::V4,
            SocketAddr::V6(_) => IpVersion::V6,
        }
    }
}

/// Equivalent to `rx.wait_for(pred).await.map(|_| ())`, but without
/// holding the returned `Ref`'s internal lock guard alive past the
/// predicate check. `Ref` wraps a `std::sync::RwLockReadGuard`, which is
/// not `Send`; keeping one around inside a `tokio::select!` branch makes
/// the whole branch future non-`Send`, which then poisons every future
/// that `select!`s on it.
pub(crate) async fn wait_until<T, F>(
    rx: &mut watch::Receiver<T>,
    mut pred: F,
) -> std::result::Result<(), watch::error::RecvError>
where
    F: FnMut(&T) -> bool,
{
    if pred(&rx.borrow()) {
        return Ok(());
    }
    loop {
        rx.changed().await?;
        if pred(&rx.borrow()) {
            return Ok(());
        }
    }
}

/// One transport connection carrying framed, encrypted segments for one
/// or more sessions.
///
/// Implementations own the connection, the cipher state, and a session
/// table; the mux routes new sessions onto whichever underlay has
/// headroom. All methods other than the event loop are non-blocking.
pub trait Underlay: Send + Sync {
    /// Register a session and start its loops.
    fn add_session(&self, session: Arc<Session>) -> Result<()>;

    /// Drop a session from the table. The underlay closes itself when the
    /// table drains to zero.
    fn remove_session(&self, session_id: u32) -> Result<()>;

    /// Read segments sequentially and dispatch them until the transport
    /// fails, the underlay closes, or `shutdown` fires.
    fn run_event_loop(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Maximum transmission unit for segments on this underlay.
    fn mtu(&self) -> usize;

    /// Local endpoint of the transport.
    fn local_addr(&self) -> SocketAddr;

    /// Remote endpoint of the transport.
    fn remote_addr(&self) -> SocketAddr;

    /// The transport this underlay runs on.
    fn transport_protocol(&self) -> TransportProtocol;

    /// IP version of the local endpoint.
    fn ip_version(&self) -> IpVersion;

    /// Tear down the underlay. Idempotent.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_version_from_addr() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(IpVersion::from(v4), IpVersion::V4);
        assert_eq!(IpVersion::from(v6), IpVersion::V6);
    }
}
