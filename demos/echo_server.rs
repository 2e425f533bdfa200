//! Echo server demo: `cargo run --example echo_server`, then connect with
//! `nc 127.0.0.1 8080`.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pulsenet::prelude::*;

#[derive(Default)]
struct EchoHandler {
    server: Mutex<Option<Arc<TcpServer>>>,
}

impl EchoHandler {
    fn bind(&self, server: Arc<TcpServer>) {
        *self.server.lock().unwrap() = Some(server);
    }
}

impl ServerHandler for EchoHandler {
    fn on_accept(&self, id: ConnectionId, remote: &RemoteInfo) {
        println!("client {} connected from {}", id, remote);
    }

    fn on_receive(&self, id: ConnectionId, data: &[u8]) {
        println!("{} sent {} bytes", id, data.len());
        if let Some(server) = self.server.lock().unwrap().as_ref() {
            if let Err(err) = server.send(id, data) {
                eprintln!("echo to {} failed: {}", id, err);
            }
        }
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        println!("client {} gone: {}", id, reason);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let breather = Breather::new();
    let handler = Arc::new(EchoHandler::default());
    let server = Arc::new(TcpServer::new(&breather, Arc::clone(&handler)));
    handler.bind(Arc::clone(&server));

    server.listen("127.0.0.1", 8080)?;
    println!("echo server listening on 127.0.0.1:8080");

    loop {
        breather.breathe();
        thread::sleep(Duration::from_millis(1));
    }
}
