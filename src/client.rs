//! TCP client: a single non-blocking connection driven by breathe calls.

use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::debug;

use crate::breather::{Breathe, Breather};
use crate::config::ClientConfig;
use crate::conn::{write_all_retry, DrainEnd};
use crate::error::{CloseReason, NetError, Result};
use crate::handler::ClientHandler;
use crate::reconnect::ReconnectSupervisor;

const CONNECT_TOKEN: Token = Token(0);

/// Owns one client socket's lifecycle: connect, send, drain, close.
///
/// The stream slot is the connection state (`None` = disconnected). The
/// `connecting` flag guards the in-flight transition against a concurrent
/// attempt from the reconnect worker; the `teardown` gate makes an explicit
/// close win over any attempt that completes after teardown began.
pub(crate) struct ClientContext {
    handler: Arc<dyn ClientHandler>,
    config: ClientConfig,
    stream: Mutex<Option<Arc<Mutex<TcpStream>>>>,
    buffer: Mutex<Vec<u8>>,
    connecting: AtomicBool,
    teardown: AtomicBool,
}

impl ClientContext {
    pub fn new(handler: Arc<dyn ClientHandler>, config: ClientConfig) -> Self {
        let buffer = vec![0u8; config.buffer_size];
        Self {
            handler,
            config,
            stream: Mutex::new(None),
            buffer: Mutex::new(buffer),
            connecting: AtomicBool::new(false),
            teardown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    pub fn connect(&self, ip: &str, port: u16) -> Result<()> {
        if ip.is_empty() {
            return Err(NetError::BadParam);
        }
        let addr: Ipv4Addr = ip.parse().map_err(|_| NetError::BadParam)?;

        if self.stream.lock().unwrap().is_some() {
            return Err(NetError::Running);
        }
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(NetError::Running);
        }
        let outcome = self.do_connect(SocketAddrV4::new(addr, port));
        self.connecting.store(false, Ordering::Release);

        let stream = outcome?;
        {
            let mut slot = self.stream.lock().unwrap();
            if self.teardown.load(Ordering::Acquire) {
                return Err(NetError::Closed);
            }
            if slot.is_some() {
                return Err(NetError::Running);
            }
            *slot = Some(Arc::new(Mutex::new(stream)));
        }
        self.handler.on_connected();
        Ok(())
    }

    /// Non-blocking connect, then a bounded wait for writability. Completion
    /// is confirmed through the socket error slot, the way mio reports
    /// asynchronous connects.
    fn do_connect(&self, addr: SocketAddrV4) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(SocketAddr::V4(addr))?;

        let mut poll = Poll::new().map_err(NetError::PollSetup)?;
        let mut events = Events::with_capacity(4);
        poll.registry()
            .register(&mut stream, CONNECT_TOKEN, Interest::WRITABLE)
            .map_err(NetError::PollSetup)?;

        let deadline = Instant::now() + self.config.connect_timeout;
        let outcome = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(NetError::Timeout);
            }
            match poll.poll(&mut events, Some(deadline - now)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(NetError::PollSetup(e)),
            }
            if events.is_empty() {
                continue;
            }
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(err)) => {
                    debug!(%addr, error = %err, "connect readiness check failed");
                    break Err(NetError::Closed);
                }
                Err(_) => break Err(NetError::Closed),
            }
            match stream.peer_addr() {
                Ok(_) => break Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(_) => break Err(NetError::Closed),
            }
        };
        let _ = poll.registry().deregister(&mut stream);
        outcome.map(|()| stream)
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(NetError::BadParam);
        }
        let stream = self
            .stream
            .lock()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or(NetError::Closed)?;
        let mut stream = stream.lock().unwrap();
        write_all_retry(
            &mut stream,
            data,
            self.config.retry_backoff,
            self.config.send_retry_limit,
        )
    }

    /// Releases the socket and reports `reason`. No-op when already
    /// disconnected, so repeated closes fire the callback once.
    pub fn close(&self, reason: CloseReason) {
        let taken = self.stream.lock().unwrap().take();
        let Some(stream) = taken else { return };
        if let Ok(guard) = stream.lock() {
            let _ = guard.shutdown(Shutdown::Both);
        }
        drop(stream);
        self.handler.on_close(reason);
    }

    /// One breathe: drains everything the socket has to offer.
    ///
    /// Reads until the socket would block, flushing the buffer whenever it
    /// fills. EOF closes with `Remote`, a read error with `BadData` — in
    /// either case the close is reported at the point of detection and any
    /// bytes accumulated before it are delivered afterwards as one batch.
    pub fn poll(&self) {
        let stream = match self.stream.lock().unwrap().as_ref() {
            Some(stream) => Arc::clone(stream),
            None => return,
        };

        let mut buf = self.buffer.lock().unwrap();
        let capacity = buf.len();
        let mut filled = 0usize;
        let end = loop {
            // lock only around the read so callbacks may send on this stream
            let read = {
                let mut guard = stream.lock().unwrap();
                guard.read(&mut buf[filled..])
            };
            match read {
                Ok(0) => break DrainEnd::Eof,
                Ok(n) => {
                    filled += n;
                    if filled == capacity {
                        self.handler.on_receive(&buf[..filled]);
                        filled = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break DrainEnd::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break DrainEnd::Error(e),
            }
        };

        match end {
            DrainEnd::WouldBlock => {}
            DrainEnd::Eof => self.close(CloseReason::Remote),
            DrainEnd::Error(err) => {
                debug!(error = %err, "client read failed");
                self.close(CloseReason::BadData);
            }
        }
        if filled > 0 {
            self.handler.on_receive(&buf[..filled]);
        }
    }

    pub fn begin_teardown(&self) {
        self.teardown.store(true, Ordering::Release);
    }

    pub fn end_teardown(&self) {
        self.teardown.store(false, Ordering::Release);
    }
}

impl Breathe for ClientContext {
    fn breathe(&self) {
        self.poll();
    }
}

/// Public client facade.
///
/// Registers itself with the given [`Breather`] at construction; the
/// registry's breathe call then drives [`poll`](ClientContext::poll) once per
/// tick. Dropping the client deregisters it first, then tears everything
/// down.
pub struct TcpClient {
    ctx: Arc<ClientContext>,
    breather: Breather,
    registration: u64,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
}

impl TcpClient {
    pub fn new<H: ClientHandler>(breather: &Breather, handler: H) -> Self {
        Self::with_config(breather, handler, ClientConfig::default())
    }

    pub fn with_config<H: ClientHandler>(
        breather: &Breather,
        handler: H,
        config: ClientConfig,
    ) -> Self {
        let ctx = Arc::new(ClientContext::new(Arc::new(handler), config));
        let weak = Arc::downgrade(&ctx) as std::sync::Weak<dyn Breathe>;
        let registration = breather.register_client(weak);
        Self {
            ctx,
            breather: breather.clone(),
            registration,
            supervisor: Mutex::new(None),
        }
    }

    /// Connects to `ip:port`. With `auto_reconnect`, a successful connect
    /// also starts the supervisor that re-dials every time the connection
    /// drops, until [`close`](Self::close) or drop.
    pub fn connect(&self, ip: &str, port: u16, auto_reconnect: bool) -> Result<()> {
        self.ctx.connect(ip, port)?;
        if auto_reconnect {
            let mut supervisor = self.supervisor.lock().unwrap();
            if supervisor.is_none() {
                *supervisor = Some(ReconnectSupervisor::spawn(
                    Arc::downgrade(&self.ctx),
                    ip.to_owned(),
                    port,
                    self.ctx.config().reconnect_interval,
                ));
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.ctx.send(data)
    }

    /// Drains pending input now instead of waiting for the registry tick.
    pub fn poll(&self) {
        self.ctx.poll();
    }

    /// Closes the connection. The explicit close wins over auto-reconnect:
    /// the teardown gate goes up, the supervisor is stopped and joined, and
    /// only then does the socket close with `Local`.
    pub fn close(&self) {
        self.ctx.begin_teardown();
        if let Some(mut supervisor) = self.supervisor.lock().unwrap().take() {
            supervisor.stop();
        }
        self.ctx.close(CloseReason::Local);
        self.ctx.end_teardown();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        // deregister before any teardown so a concurrent breathe cannot
        // reach a half-dead instance
        self.breather.deregister(self.registration);
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<u8>>,
        connects: AtomicUsize,
        closes: Mutex<Vec<CloseReason>>,
    }

    impl ClientHandler for Arc<RecordingHandler> {
        fn on_connected(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_receive(&self, data: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(data);
        }

        fn on_close(&self, reason: CloseReason) {
            self.closes.lock().unwrap().push(reason);
        }
    }

    #[test]
    fn connect_rejects_bad_addresses() {
        let breather = Breather::new();
        let handler = Arc::new(RecordingHandler::default());
        let client = TcpClient::new(&breather, Arc::clone(&handler));

        assert!(matches!(
            client.connect("", 9000, false),
            Err(NetError::BadParam)
        ));
        assert!(matches!(
            client.connect("not-an-ip", 9000, false),
            Err(NetError::BadParam)
        ));
        assert_eq!(handler.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_when_disconnected_is_closed() {
        let breather = Breather::new();
        let client = TcpClient::new(&breather, Arc::new(RecordingHandler::default()));
        assert!(matches!(client.send(b"hi"), Err(NetError::Closed)));
        assert!(matches!(client.send(b""), Err(NetError::BadParam)));
    }

    #[test]
    fn close_when_disconnected_fires_nothing() {
        let breather = Breather::new();
        let handler = Arc::new(RecordingHandler::default());
        let client = TcpClient::new(&breather, Arc::clone(&handler));

        client.close();
        client.close();
        assert!(handler.closes.lock().unwrap().is_empty());
        assert!(!client.is_connected());
    }
}
