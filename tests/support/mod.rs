#![allow(dead_code)] // each test binary uses a different subset

//! A scripted stand-in for the server: accepts one connection, records
//! every byte the client writes, and sends back whatever the test tells
//! it to. Tests assert exact wire bytes with `expect` and drive replies
//! with `respond`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;

use redimux::{Connection, ConnectionConfig, ServerInfo, ServerType};

enum ServerOp {
    Send(Vec<u8>),
    Close,
}

pub struct TestServer {
    pub addr: SocketAddr,
    ops: UnboundedSender<ServerOp>,
    inbound: Arc<Mutex<Vec<u8>>>,
    received: Arc<Notify>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (ops, mut ops_rx) = mpsc::unbounded_channel::<ServerOp>();
        let inbound = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Notify::new());

        let record = inbound.clone();
        let wake = received.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = socket.into_split();

            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            record.lock().unwrap().extend_from_slice(&buf[..n]);
                            wake.notify_waiters();
                        }
                    }
                }
            });

            while let Some(op) = ops_rx.recv().await {
                match op {
                    ServerOp::Send(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    ServerOp::Close => break,
                }
            }
            // Dropping the write half sends FIN to the client.
        });

        TestServer {
            addr,
            ops,
            inbound,
            received,
        }
    }

    /// Queue reply bytes for the client.
    pub fn respond(&self, bytes: &[u8]) {
        self.ops.send(ServerOp::Send(bytes.to_vec())).unwrap();
    }

    /// Close the server side of the socket.
    pub fn close(&self) {
        let _ = self.ops.send(ServerOp::Close);
    }

    /// Wait until the client has written exactly `expected` next, and
    /// consume it.
    pub async fn expect(&self, expected: &[u8]) {
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.received.notified();
                {
                    let mut inbound = self.inbound.lock().unwrap();
                    if inbound.len() >= expected.len() {
                        let got: Vec<u8> = inbound.drain(..expected.len()).collect();
                        assert_eq!(
                            String::from_utf8_lossy(&got),
                            String::from_utf8_lossy(expected),
                            "client wrote different bytes than expected",
                        );
                        return;
                    }
                }
                notified.await;
            }
        });
        deadline.await.expect("timed out waiting for client bytes");
    }

    /// Assert the client has written nothing (beyond what was already
    /// consumed by `expect`).
    pub fn assert_idle(&self) {
        let inbound = self.inbound.lock().unwrap();
        assert!(
            inbound.is_empty(),
            "unexpected client bytes: {:?}",
            String::from_utf8_lossy(&inbound)
        );
    }
}

pub fn config_for(server: &TestServer) -> ConnectionConfig {
    ConnectionConfig::new(server.addr.ip().to_string(), server.addr.port())
        .assume_server(ServerInfo::new("7.2.4", ServerType::Master))
}

/// Open a connection against the test server, answering the `PING`
/// handshake probe on its behalf.
pub async fn open_connection(server: &TestServer, config: ConnectionConfig) -> Arc<Connection> {
    let conn = Connection::new(config);
    let opening = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.open().await })
    };

    server.expect(b"*1\r\n$4\r\nPING\r\n").await;
    server.respond(b"+PONG\r\n");

    opening.await.unwrap().unwrap();
    conn
}
