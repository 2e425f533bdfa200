//! Connection identity and the server-side connection table.
//!
//! A server assigns every accepted peer a [`ConnectionId`] that is unique and
//! strictly increasing for the lifetime of that server instance; ids are never
//! reused and never persisted. The table keeps two maps — id to peer and poll
//! token to id — and every mutation goes through [`ConnTable`] so the two can
//! never drift apart.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use mio::Token;

use crate::error::{NetError, Result};

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only snapshot of a peer's address, rendered as dotted-decimal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    ip: Ipv4Addr,
    port: u16,
}

impl RemoteInfo {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddrV4> for RemoteInfo {
    fn from(addr: SocketAddrV4) -> Self {
        RemoteInfo {
            ip: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for RemoteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Public view of one accepted connection.
///
/// The socket itself stays inside the server; this snapshot carries the
/// identity, the remote address, and an opaque user-data handle. The handle is
/// shared with the caller: the core never inspects it, and the caller's clone
/// outlives the table entry.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    addr: SocketAddrV4,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, addr: SocketAddrV4) -> Self {
        Connection {
            id,
            addr,
            user_data: None,
        }
    }

    pub fn remote(&self) -> RemoteInfo {
        RemoteInfo::from(self.addr)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("user_data", &self.user_data.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Server-internal state for one accepted peer.
pub(crate) struct Peer {
    pub stream: Arc<Mutex<TcpStream>>,
    pub token: Token,
    pub info: Connection,
    /// Set once teardown for this peer has begun; keeps concurrent closes
    /// single-shot while the close callback still observes a live id.
    pub closing: bool,
}

/// The id/token double bookkeeping for a server instance.
///
/// Invariant: every token in `by_token` maps to a live entry in `peers` and
/// vice versa. Ordered by id so broadcast walks peers in accept order.
#[derive(Default)]
pub(crate) struct ConnTable {
    peers: BTreeMap<u64, Peer>,
    by_token: HashMap<Token, u64>,
}

impl ConnTable {
    pub fn insert(&mut self, peer: Peer) {
        self.by_token.insert(peer.token, peer.info.id.as_u64());
        self.peers.insert(peer.info.id.as_u64(), peer);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&id.as_u64())?;
        self.by_token.remove(&peer.token);
        Some(peer)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id.as_u64())
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Peer> {
        self.peers.get_mut(&id.as_u64())
    }

    pub fn id_for(&self, token: Token) -> Option<ConnectionId> {
        self.by_token.get(&token).copied().map(ConnectionId::new)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.by_token.clear();
    }
}

/// How a read drain ended.
pub(crate) enum DrainEnd {
    WouldBlock,
    Eof,
    Error(io::Error),
}

/// Writes the whole payload through a non-blocking stream.
///
/// `WouldBlock` backs off for `backoff` and retries, at most `retry_limit`
/// times per stall; any write progress resets the budget. Exhausting the
/// budget yields [`NetError::Backpressure`] instead of blocking the caller
/// forever.
pub(crate) fn write_all_retry(
    stream: &mut TcpStream,
    mut data: &[u8],
    backoff: Duration,
    retry_limit: usize,
) -> Result<()> {
    let mut retries = 0usize;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(NetError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => {
                data = &data[n..];
                retries = 0;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > retry_limit {
                    return Err(NetError::Backpressure);
                }
                thread::sleep(backoff);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = std::net::TcpStream::connect(addr).unwrap();
        let (theirs, _) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        (TcpStream::from_std(ours), theirs)
    }

    fn peer_for(id: u64) -> Peer {
        let (stream, other) = loopback_pair();
        // keep the far end alive long enough for the test body
        std::mem::forget(other);
        Peer {
            stream: Arc::new(Mutex::new(stream)),
            token: Token(id as usize),
            info: Connection::new(
                ConnectionId::new(id),
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
            ),
            closing: false,
        }
    }

    #[test]
    fn table_keeps_both_maps_consistent() {
        let mut table = ConnTable::default();
        table.insert(peer_for(1));
        table.insert(peer_for(2));

        assert_eq!(table.len(), 2);
        assert_eq!(table.id_for(Token(1)), Some(ConnectionId::new(1)));
        assert_eq!(table.id_for(Token(2)), Some(ConnectionId::new(2)));

        let removed = table.remove(ConnectionId::new(1)).unwrap();
        assert_eq!(removed.info.id, ConnectionId::new(1));
        assert_eq!(table.id_for(Token(1)), None);
        assert!(table.get(ConnectionId::new(1)).is_none());
        assert_eq!(table.len(), 1);

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.id_for(Token(2)), None);
    }

    #[test]
    fn table_iterates_in_accept_order() {
        let mut table = ConnTable::default();
        for id in [3u64, 1, 2] {
            table.insert(peer_for(id));
        }
        let ids: Vec<u64> = table.iter().map(|p| p.info.id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn remote_info_renders_dotted_decimal() {
        let info = RemoteInfo::from(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4242));
        assert_eq!(info.to_string(), "10.1.2.3:4242");
        assert_eq!(info.ip(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(info.port(), 4242);
    }

    #[test]
    fn write_all_retry_delivers_everything() {
        use std::io::Read;

        let (mut ours, mut theirs) = loopback_pair();
        let payload = vec![7u8; 64 * 1024];
        write_all_retry(&mut ours, &payload, Duration::from_millis(1), 3000).unwrap();

        let mut received = Vec::new();
        theirs
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut chunk = [0u8; 8192];
        while received.len() < payload.len() {
            let n = theirs.read(&mut chunk).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(received, payload);
    }
}
