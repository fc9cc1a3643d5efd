//! The client transport: a buffered plain or TLS stream.
//!
//! Reads are line-oriented outside DATA and chunk-oriented inside it. Every
//! read applies the inactivity countdown, which restarts whenever octets
//! arrive. STARTTLS swaps the transport in place, discarding any plaintext
//! octets buffered before the handshake (RFC 3207 Section 4.2).

use std::{fmt::Write, fs::File, io, io::BufReader, path::PathBuf, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    server::TlsStream,
    TlsAcceptor,
};
use unmta_common::tracing;

use crate::{
    command::MAX_LINE_OCTETS,
    error::{ConnectionError, ConnectionResult, TlsError},
};

const READ_CHUNK: usize = 8192;

/// Paths to the PEM material backing STARTTLS.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
}

enum Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Placeholder while the STARTTLS handshake owns the stream. I/O against
    /// it means the handshake failed and the session is being torn down.
    Detached,
}

pub(crate) struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Transport<Stream>,
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn new(stream: Stream) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buffer: Vec::new(),
        }
    }

    /// Pull more octets off the socket into the buffer.
    ///
    /// Returns the number of octets read; 0 means the peer closed. The
    /// inactivity countdown applies to this wait and restarts on arrival.
    async fn fill(&mut self, inactivity: Duration) -> ConnectionResult<usize> {
        let mut chunk = [0_u8; READ_CHUNK];

        let read = tokio::time::timeout(inactivity, async {
            match &mut self.transport {
                Transport::Plain(stream) => stream.read(&mut chunk).await,
                Transport::Tls(stream) => stream.read(&mut chunk).await,
                Transport::Detached => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        })
        .await
        .map_err(|_elapsed| ConnectionError::Inactive(inactivity.as_secs()))??;

        self.buffer.extend_from_slice(&chunk[..read]);

        Ok(read)
    }

    /// Read one logical line, CRLF stripped.
    ///
    /// `Ok(None)` means the peer closed the connection. A line longer than
    /// [`MAX_LINE_OCTETS`] (CRLF included) is consumed up to its LF and
    /// reported as [`ConnectionError::LineTooLong`], leaving the connection
    /// usable.
    pub(crate) async fn read_line(
        &mut self,
        inactivity: Duration,
    ) -> ConnectionResult<Option<Vec<u8>>> {
        let mut discarded = 0_usize;

        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();

                if discarded + line.len() > MAX_LINE_OCTETS {
                    return Err(ConnectionError::LineTooLong);
                }

                if line.ends_with(b"\n") {
                    line.pop();
                }
                if line.ends_with(b"\r") {
                    line.pop();
                }

                return Ok(Some(line));
            }

            // No LF yet. Bound the buffer so a hostile endless line cannot
            // grow it; remember how much was thrown away for the length
            // verdict once the LF finally shows up.
            if self.buffer.len() > MAX_LINE_OCTETS {
                discarded += self.buffer.len();
                self.buffer.clear();
            }

            if self.fill(inactivity).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Read raw octets (DATA mode). An empty chunk means the peer closed.
    pub(crate) async fn read_chunk(&mut self, inactivity: Duration) -> ConnectionResult<Vec<u8>> {
        if self.buffer.is_empty() && self.fill(inactivity).await? == 0 {
            return Ok(Vec::new());
        }

        Ok(std::mem::take(&mut self.buffer))
    }

    /// Push unconsumed octets back to the front of the read buffer.
    pub(crate) fn unread(&mut self, octets: Vec<u8>) {
        if octets.is_empty() {
            return;
        }

        let mut joined = octets;
        joined.extend_from_slice(&self.buffer);
        self.buffer = joined;
    }

    /// Write one reply line; CRLF is appended here.
    pub(crate) async fn send(&mut self, line: &str) -> ConnectionResult<usize> {
        // Replies fit the same 512-octet ceiling commands do
        let mut reply = arrayvec::ArrayString::<MAX_LINE_OCTETS>::new();
        write!(&mut reply, "{line}\r\n")?;

        match &mut self.transport {
            Transport::Plain(stream) => stream.write_all(reply.as_bytes()).await?,
            Transport::Tls(stream) => stream.write_all(reply.as_bytes()).await?,
            Transport::Detached => return Err(io::Error::from(io::ErrorKind::NotConnected).into()),
        }

        Ok(reply.len())
    }

    fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let reader = File::open(path).map_err(|source| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source,
        })?;

        rustls_pemfile::certs(&mut BufReader::new(reader))
            .collect::<Result<_, _>>()
            .map_err(|source| TlsError::CertificateLoad {
                path: path.display().to_string(),
                source,
            })
    }

    fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, TlsError> {
        let key_load = |reason: String| TlsError::KeyLoad {
            path: path.display().to_string(),
            reason,
        };

        let reader = File::open(path).map_err(|e| key_load(e.to_string()))?;
        let mut reader = BufReader::new(reader);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| key_load(e.to_string()))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(key_load(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            )),
        }
    }

    /// Upgrade the transport in place after the 220 STARTTLS reply.
    ///
    /// Any plaintext octets the client pipelined ahead of the handshake are
    /// discarded.
    pub(crate) async fn upgrade(&mut self, tls: &TlsMaterial) -> Result<(), TlsError> {
        tracing::debug!("Upgrading connection ...");

        let certs = Self::load_certs(&tls.cert)?;
        let key = Self::load_key(&tls.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));

        self.buffer.clear();

        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                self.transport = Transport::Tls(Box::new(stream));
                Ok(())
            }
            // The state machine rejects STARTTLS on an already-secure
            // transport, so these arms only restore what was taken.
            other => {
                self.transport = other;
                Ok(())
            }
        }
    }
}
