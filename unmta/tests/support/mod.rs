//! Test support: a real server on a random port plus a line-oriented SMTP
//! client over TCP.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};
use unmta_common::{config::Unfig, Signal};
use unmta_smtp::{Plugin, Server, ServerError};

/// A default configuration bound to a random loopback port.
pub fn test_config() -> Unfig {
    let mut config = Unfig::default();
    config.smtp.listen = "127.0.0.1".to_string();
    config.smtp.port = 0;
    config.smtp.hostname = "mx.test.example".to_string();
    config
}

pub struct TestServer {
    addr: SocketAddr,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start(config: Unfig, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut server = Server::new(config);
        server.load_plugins(plugins).expect("plugin registration");

        let bound = server.bind().await.expect("bind");
        let addr = bound.local_addr().expect("local addr");

        let (shutdown, receiver) = broadcast::channel(16);
        let handle = tokio::spawn(bound.serve(receiver));

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn connect(&self) -> SmtpClient {
        SmtpClient::connect(self.addr).await
    }

    /// Request shutdown and wait for the accept loop to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        let _ = self.handle.await;
    }
}

/// A bare-bones SMTP client speaking CRLF lines.
pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();

        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("send");
    }

    pub async fn send_raw(&mut self, octets: &[u8]) {
        self.writer.write_all(octets).await.expect("send raw");
    }

    /// Read one full reply, following `CCC-` continuation lines.
    pub async fn reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await.expect("read reply");
            assert!(read > 0, "connection closed while awaiting a reply");

            let line = line.trim_end().to_string();
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);

            if done {
                break;
            }
        }

        let code = lines[0][..3].parse().expect("reply code");
        (code, lines)
    }

    /// Assert the next reply carries the given code; returns its lines.
    pub async fn expect(&mut self, code: u16) -> Vec<String> {
        let (got, lines) = self.reply().await;
        assert_eq!(got, code, "unexpected reply: {lines:?}");
        lines
    }

    /// Assert the server has closed the connection.
    pub async fn expect_closed(mut self) {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.expect("read at EOF");
        assert_eq!(read, 0, "expected EOF, got: {line:?}");
    }
}
