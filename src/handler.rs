//! Consumer-facing callback traits.
//!
//! Implement [`ClientHandler`] or [`ServerHandler`] to receive network events.
//! Callbacks run synchronously on whichever thread drives the breathe call;
//! keep them short so one slow consumer does not stall the whole tick.
//!
//! Bytes arrive exactly as the transport delivered them: several sends from
//! the far side may coalesce into one `on_receive`, and one send may split
//! across several. Consumers frame their own messages.

use std::sync::Arc;

use crate::conn::{ConnectionId, RemoteInfo};
use crate::error::CloseReason;

/// Callbacks for one client connection.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called exactly once after a connect attempt succeeds.
    fn on_connected(&self) {}

    /// Called with each batch of received bytes.
    fn on_receive(&self, data: &[u8]);

    /// Called when the connection goes away, with the reason.
    fn on_close(&self, reason: CloseReason) {
        let _ = reason;
    }
}

impl<T: ClientHandler + ?Sized> ClientHandler for Arc<T> {
    fn on_connected(&self) {
        (**self).on_connected()
    }

    fn on_receive(&self, data: &[u8]) {
        (**self).on_receive(data)
    }

    fn on_close(&self, reason: CloseReason) {
        (**self).on_close(reason)
    }
}

/// Callbacks for a server and all of its accepted peers.
pub trait ServerHandler: Send + Sync + 'static {
    /// Called for each accepted connection.
    fn on_accept(&self, id: ConnectionId, remote: &RemoteInfo) {
        let _ = (id, remote);
    }

    /// Called with each batch of bytes received from a peer.
    fn on_receive(&self, id: ConnectionId, data: &[u8]);

    /// Called when a peer connection goes away. The id is still known to the
    /// server while this runs; it is retired immediately after.
    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        let _ = (id, reason);
    }

    /// Called once when the server finishes shutting down.
    fn on_shutdown(&self) {}
}

impl<T: ServerHandler + ?Sized> ServerHandler for Arc<T> {
    fn on_accept(&self, id: ConnectionId, remote: &RemoteInfo) {
        (**self).on_accept(id, remote)
    }

    fn on_receive(&self, id: ConnectionId, data: &[u8]) {
        (**self).on_receive(id, data)
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        (**self).on_close(id, reason)
    }

    fn on_shutdown(&self) {
        (**self).on_shutdown()
    }
}
