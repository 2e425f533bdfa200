//! Background auto-reconnect for clients.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::client::ClientContext;

struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Re-dials a client while it is disconnected.
///
/// At most one supervisor runs per client. The worker wakes every interval,
/// and teardown interrupts the wait: [`stop`](ReconnectSupervisor::stop) sets
/// the flag, signals, and joins, so no attempt starts after teardown begins.
/// Failed attempts are logged, never surfaced to the caller.
pub(crate) struct ReconnectSupervisor {
    signal: Arc<StopSignal>,
    worker: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    pub fn spawn(ctx: Weak<ClientContext>, host: String, port: u16, interval: Duration) -> Self {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);

        let worker = thread::Builder::new()
            .name("pulsenet-reconnect".into())
            .spawn(move || loop {
                let guard = thread_signal.stopped.lock().unwrap();
                let (guard, _) = thread_signal.cv.wait_timeout(guard, interval).unwrap();
                if *guard {
                    break;
                }
                drop(guard);

                let Some(ctx) = ctx.upgrade() else { break };
                if ctx.is_connected() {
                    continue;
                }
                if let Err(err) = ctx.connect(&host, port) {
                    warn!(host = %host, port, error = %err, "reconnect attempt failed");
                }
            })
            .expect("failed to spawn reconnect worker");

        Self {
            signal,
            worker: Some(worker),
        }
    }

    /// Stops the worker and joins it. Any in-flight connect attempt finishes
    /// first; the client's teardown gate keeps its result from installing.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock().unwrap() = true;
        self.signal.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
