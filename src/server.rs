//! TCP server: listener, readiness multiplexer, and the connection table.
//!
//! One breathe call performs a zero-timeout readiness check and then services
//! every ready descriptor: the listener drains pending accepts, each ready
//! peer drains pending input. Readiness is edge-triggered, so every drain
//! runs until the socket would block.

use std::any::Any;
use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::breather::{Breathe, Breather};
use crate::config::ServerConfig;
use crate::conn::{write_all_retry, ConnTable, Connection, ConnectionId, DrainEnd, Peer, RemoteInfo};
use crate::error::{CloseReason, NetError, Result};
use crate::handler::ServerHandler;

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 512;

struct ServerIo {
    listener: Arc<TcpListener>,
    poll: Poll,
    events: Events,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
}

/// Owns the listening socket, the multiplexer, and all accepted peers.
pub(crate) struct ServerContext {
    handler: Arc<dyn ServerHandler>,
    config: ServerConfig,
    io: Mutex<Option<ServerIo>>,
    conns: Mutex<ConnTable>,
    /// Shared receive scratch, reused for every drained peer per tick.
    buffer: Mutex<Vec<u8>>,
    /// Next connection id; strictly increasing for this instance's lifetime,
    /// never reset across listen/shutdown cycles. Starts at 1 so peer tokens
    /// can never collide with the listener token.
    next_id: AtomicU64,
}

impl ServerContext {
    pub fn new(handler: Arc<dyn ServerHandler>, config: ServerConfig) -> Self {
        let buffer = vec![0u8; config.buffer_size];
        Self {
            handler,
            config,
            io: Mutex::new(None),
            conns: Mutex::new(ConnTable::default()),
            buffer: Mutex::new(buffer),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn listen(&self, ip: &str, port: u16) -> Result<()> {
        if ip.is_empty() {
            return Err(NetError::BadParam);
        }
        let addr: Ipv4Addr = ip.parse().map_err(|_| NetError::BadParam)?;

        let mut io = self.io.lock().unwrap();
        if io.is_some() {
            return Err(NetError::Running);
        }

        let std_listener = bind_listener(SocketAddrV4::new(addr, port), self.config.backlog)?;
        let mut listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new().map_err(NetError::PollSetup)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(NetError::PollSetup)?;
        let registry = Arc::new(poll.registry().try_clone().map_err(NetError::PollSetup)?);

        *io = Some(ServerIo {
            listener: Arc::new(listener),
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registry,
            local_addr,
        });
        info!(%local_addr, "listening");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.io.lock().unwrap().as_ref().map(|io| io.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn is_valid(&self, id: ConnectionId) -> bool {
        self.conns.lock().unwrap().get(id).is_some()
    }

    pub fn find(&self, id: ConnectionId) -> Option<Connection> {
        self.conns
            .lock()
            .unwrap()
            .get(id)
            .map(|peer| peer.info.clone())
    }

    /// Attaches an opaque handle to a connection. The handle is shared, never
    /// inspected, and survives the table entry through the caller's clone.
    pub fn set_user_data(&self, id: ConnectionId, data: Arc<dyn Any + Send + Sync>) -> bool {
        match self.conns.lock().unwrap().get_mut(id) {
            Some(peer) => {
                peer.info.user_data = Some(data);
                true
            }
            None => false,
        }
    }

    pub fn send(&self, id: ConnectionId, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(NetError::BadParam);
        }
        let stream = {
            let conns = self.conns.lock().unwrap();
            let peer = conns.get(id).ok_or(NetError::Closed)?;
            Arc::clone(&peer.stream)
        };
        let mut stream = stream.lock().unwrap();
        write_all_retry(
            &mut stream,
            data,
            self.config.retry_backoff,
            self.config.send_retry_limit,
        )
    }

    /// Sends to every connection, sequentially in accept order.
    ///
    /// A peer that will not accept data burns its own retry budget before the
    /// walk moves on, so a stalled peer still delays delivery to everyone
    /// after it in the same call. Per-peer failures are logged and skipped.
    pub fn broadcast(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let targets: Vec<(ConnectionId, Arc<Mutex<TcpStream>>)> = {
            let conns = self.conns.lock().unwrap();
            conns
                .iter()
                .map(|peer| (peer.info.id, Arc::clone(&peer.stream)))
                .collect()
        };
        for (id, stream) in targets {
            let mut stream = stream.lock().unwrap();
            if let Err(err) = write_all_retry(
                &mut stream,
                data,
                self.config.retry_backoff,
                self.config.send_retry_limit,
            ) {
                debug!(%id, error = %err, "broadcast delivery failed");
            }
        }
    }

    pub fn close(&self, id: ConnectionId) {
        self.close_with(id, CloseReason::Local);
    }

    /// Tears one connection down. The close callback runs first, while the id
    /// is still in the table, then the descriptor leaves the multiplexer and
    /// both maps.
    fn close_with(&self, id: ConnectionId, reason: CloseReason) {
        {
            let mut conns = self.conns.lock().unwrap();
            match conns.get_mut(id) {
                Some(peer) if !peer.closing => peer.closing = true,
                _ => return,
            }
        }
        self.handler.on_close(id, reason);

        let Some(peer) = self.conns.lock().unwrap().remove(id) else {
            return;
        };
        let registry = {
            let io = self.io.lock().unwrap();
            io.as_ref().map(|io| Arc::clone(&io.registry))
        };
        let mut stream = peer.stream.lock().unwrap();
        if let Some(registry) = registry {
            let _ = registry.deregister(&mut *stream);
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    /// Closes every connection with `Local`, then the listener and the
    /// multiplexer, then reports `on_shutdown`. Idempotent.
    pub fn shutdown(&self) {
        let Some(io) = self.io.lock().unwrap().take() else {
            return;
        };

        let peers: Vec<(ConnectionId, Arc<Mutex<TcpStream>>)> = {
            let mut conns = self.conns.lock().unwrap();
            conns
                .iter_mut()
                .filter(|peer| !peer.closing)
                .map(|peer| {
                    peer.closing = true;
                    (peer.info.id, Arc::clone(&peer.stream))
                })
                .collect()
        };
        // callbacks run while the table still knows the ids, as lookups
        // during them expect; the table is cleared afterwards
        for (id, stream) in peers {
            self.handler.on_close(id, CloseReason::Local);
            let mut stream = stream.lock().unwrap();
            let _ = io.registry.deregister(&mut *stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.conns.lock().unwrap().clear();

        drop(io);
        self.handler.on_shutdown();
        info!("server shut down");
    }

    /// One breathe: a zero-timeout readiness check, then every ready
    /// descriptor is serviced. Never blocks the caller, and a failure on one
    /// descriptor never stops the rest of the pass.
    pub fn poll(&self) {
        let (listener, registry, ready) = {
            let mut io_guard = self.io.lock().unwrap();
            let Some(io) = io_guard.as_mut() else { return };
            match io.poll.poll(&mut io.events, Some(Duration::ZERO)) {
                Ok(()) => {}
                // interrupted just means an empty pass; the next tick retries
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
                Err(err) => {
                    warn!(error = %err, "readiness poll failed");
                    return;
                }
            }
            let ready: Vec<Token> = io
                .events
                .iter()
                .filter(|event| event.is_readable())
                .map(|event| event.token())
                .collect();
            (Arc::clone(&io.listener), Arc::clone(&io.registry), ready)
        };

        for token in ready {
            if token == LISTENER {
                self.accept_pending(&listener, &registry);
            } else {
                self.drain_peer(token);
            }
        }
    }

    /// Drains the accept queue until it would block. Failures end the drain
    /// for this event; accepting resumes on the next readiness report.
    fn accept_pending(&self, listener: &TcpListener, registry: &Registry) {
        loop {
            let (stream, peer_addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            };
            match self.admit(stream, peer_addr, registry) {
                Ok((id, remote)) => self.handler.on_accept(id, &remote),
                Err(err) => {
                    warn!(peer = %peer_addr, error = %err, "rejected incoming connection");
                }
            }
        }
    }

    fn admit(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        registry: &Registry,
    ) -> Result<(ConnectionId, RemoteInfo)> {
        if let Some(max) = self.config.max_connections {
            if self.conns.lock().unwrap().len() >= max {
                return Err(NetError::TooMany);
            }
        }
        if let Err(err) = stream.set_nodelay(self.config.no_delay) {
            debug!(error = %err, "TCP_NODELAY not applied");
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = Token(id.as_u64() as usize);
        registry
            .register(&mut stream, token, Interest::READABLE)
            .map_err(NetError::PollSetup)?;

        let addr = match peer_addr {
            SocketAddr::V4(v4) => v4,
            // the listener is IPv4-only; keep the port if the OS ever
            // reports otherwise
            SocketAddr::V6(v6) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, v6.port()),
        };
        let remote = RemoteInfo::from(addr);
        self.conns.lock().unwrap().insert(Peer {
            stream: Arc::new(Mutex::new(stream)),
            token,
            info: Connection::new(id, addr),
            closing: false,
        });
        Ok((id, remote))
    }

    /// Drains one ready peer into the shared buffer. A full buffer flushes
    /// mid-drain and the drain continues; at the end, accumulated bytes are
    /// delivered first and only then does EOF or a read error tear the
    /// connection down.
    fn drain_peer(&self, token: Token) {
        let (id, stream) = {
            let conns = self.conns.lock().unwrap();
            let Some(id) = conns.id_for(token) else { return };
            let Some(peer) = conns.get(id) else { return };
            if peer.closing {
                return;
            }
            (id, Arc::clone(&peer.stream))
        };

        let mut buf = self.buffer.lock().unwrap();
        let capacity = buf.len();
        let mut filled = 0usize;
        let end = loop {
            // lock only around the read so callbacks may send to this peer
            let read = {
                let mut guard = stream.lock().unwrap();
                guard.read(&mut buf[filled..])
            };
            match read {
                Ok(0) => break DrainEnd::Eof,
                Ok(n) => {
                    filled += n;
                    if filled == capacity {
                        self.handler.on_receive(id, &buf[..filled]);
                        filled = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break DrainEnd::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break DrainEnd::Error(e),
            }
        };
        if filled > 0 {
            self.handler.on_receive(id, &buf[..filled]);
        }
        drop(buf);

        match end {
            DrainEnd::WouldBlock => {}
            DrainEnd::Eof => self.close_with(id, CloseReason::Remote),
            DrainEnd::Error(err) => {
                debug!(%id, error = %err, "peer read failed");
                self.close_with(id, CloseReason::BadData);
            }
        }
    }
}

impl Breathe for ServerContext {
    fn breathe(&self) {
        self.poll();
    }
}

/// Builds the listening socket by hand: the backlog is part of the contract,
/// and `SO_REUSEADDR` lets a shut-down server rebind its port immediately.
fn bind_listener(addr: SocketAddrV4, backlog: u32) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

/// Public server facade.
///
/// Registers itself with the given [`Breather`] at construction; the
/// registry's breathe call then drives [`poll`](ServerContext::poll) once per
/// tick. Dropping the server deregisters it first, then shuts it down.
pub struct TcpServer {
    ctx: Arc<ServerContext>,
    breather: Breather,
    registration: u64,
}

impl TcpServer {
    pub fn new<H: ServerHandler>(breather: &Breather, handler: H) -> Self {
        Self::with_config(breather, handler, ServerConfig::default())
    }

    pub fn with_config<H: ServerHandler>(
        breather: &Breather,
        handler: H,
        config: ServerConfig,
    ) -> Self {
        let ctx = Arc::new(ServerContext::new(Arc::new(handler), config));
        let weak = Arc::downgrade(&ctx) as std::sync::Weak<dyn Breathe>;
        let registration = breather.register_server(weak);
        Self {
            ctx,
            breather: breather.clone(),
            registration,
        }
    }

    pub fn listen(&self, ip: &str, port: u16) -> Result<()> {
        self.ctx.listen(ip, port)
    }

    /// The bound address, once listening. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.connection_count()
    }

    pub fn is_valid(&self, id: ConnectionId) -> bool {
        self.ctx.is_valid(id)
    }

    pub fn find(&self, id: ConnectionId) -> Option<Connection> {
        self.ctx.find(id)
    }

    pub fn set_user_data(&self, id: ConnectionId, data: Arc<dyn Any + Send + Sync>) -> bool {
        self.ctx.set_user_data(id, data)
    }

    pub fn send(&self, id: ConnectionId, data: &[u8]) -> Result<()> {
        self.ctx.send(id, data)
    }

    pub fn broadcast(&self, data: &[u8]) {
        self.ctx.broadcast(data)
    }

    pub fn close(&self, id: ConnectionId) {
        self.ctx.close(id)
    }

    pub fn shutdown(&self) {
        self.ctx.shutdown()
    }

    /// Drains pending events now instead of waiting for the registry tick.
    pub fn poll(&self) {
        self.ctx.poll();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // deregister before any teardown so a concurrent breathe cannot
        // reach a half-dead instance
        self.breather.deregister(self.registration);
        self.ctx.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl ServerHandler for NullHandler {
        fn on_receive(&self, _id: ConnectionId, _data: &[u8]) {}
    }

    #[test]
    fn listen_rejects_bad_addresses() {
        let breather = Breather::new();
        let server = TcpServer::new(&breather, NullHandler);

        assert!(matches!(server.listen("", 9000), Err(NetError::BadParam)));
        assert!(matches!(
            server.listen("not-an-ip", 9000),
            Err(NetError::BadParam)
        ));
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn duplicate_listen_is_running() {
        let breather = Breather::new();
        let server = TcpServer::new(&breather, NullHandler);

        server.listen("127.0.0.1", 0).unwrap();
        assert!(matches!(
            server.listen("127.0.0.1", 0),
            Err(NetError::Running)
        ));
        server.shutdown();
    }

    #[test]
    fn unknown_ids_answer_quietly() {
        let breather = Breather::new();
        let server = TcpServer::new(&breather, NullHandler);

        let unknown = ConnectionId::new(999_999);
        assert!(!server.is_valid(unknown));
        assert!(server.find(unknown).is_none());
        assert!(!server.set_user_data(unknown, Arc::new(42u32)));
        assert!(matches!(
            server.send(unknown, b"data"),
            Err(NetError::Closed)
        ));
        server.close(unknown);
        server.broadcast(b"data");
    }

    #[test]
    fn shutdown_is_idempotent_without_listen() {
        let breather = Breather::new();
        let server = TcpServer::new(&breather, NullHandler);
        server.shutdown();
        server.shutdown();
    }
}
