//! The per-connection protocol state machine.
//!
//! Drives one accepted connection through the SMTP conversation: command
//! reads, phase gating, hook dispatch, AUTH exchanges, the STARTTLS upgrade
//! and DATA consumption. A verb that is illegal in the current phase is
//! answered 503 without any plugin seeing it.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncWrite};
use unmta_common::{
    address::ReversePath, error::SessionError, incoming, internal, outgoing, Signal,
};

use crate::{
    command::{Command, CommandError, MailParameters, SmtpCommand},
    connection::Connection,
    data::{DataDecoder, DataOutcome},
    dispatch::Dispatcher,
    phase::{GreetingType, SessionPhase},
    response::{Response, ResponsePhase},
    server::SmtpRuntime,
    session::Session,
};

/// Whether the command loop keeps going after a reply.
enum Flow {
    Continue,
    Close,
}

/// Progress of a multi-step AUTH exchange.
enum AuthExchange {
    /// AUTH PLAIN without an initial response; the next line carries it.
    PlainResponse,
    /// AUTH LOGIN; the next line is the base64 username.
    LoginUsername,
    /// AUTH LOGIN; username received, the next line is the password.
    LoginPassword { username: Vec<u8> },
}

pub(crate) struct Machine<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: Connection<Stream>,
    session: Session,
    dispatcher: Dispatcher,
    runtime: Arc<SmtpRuntime>,
    auth_exchange: Option<AuthExchange>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Machine<Stream> {
    pub(crate) fn create(
        stream: Stream,
        remote_address: String,
        id: u64,
        active_connections: usize,
        dispatcher: Dispatcher,
        runtime: Arc<SmtpRuntime>,
    ) -> Self {
        Self {
            connection: Connection::new(stream),
            session: Session::create(id, active_connections, remote_address),
            dispatcher,
            runtime,
            auth_exchange: None,
        }
    }

    /// Run the conversation to completion.
    ///
    /// However the conversation ends, the close hook fires exactly once,
    /// after everything else.
    pub(crate) async fn run(
        mut self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.serve(shutdown).await;

        self.dispatcher.close(&mut self.session).await;
        internal!("Connection closed");

        result
    }

    async fn serve(
        &mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = match self.dispatcher.connect(&mut self.session).await {
            Some(response) => response,
            None => Response::accept_with(
                ResponsePhase::Connect,
                format!("{} ESMTP UnMTA", self.runtime.hostname),
            ),
        };

        // Any non-2xx at connect is terminal
        let refused = greeting.code() >= 400;
        self.send(&greeting).await?;
        if refused {
            return Ok(());
        }

        loop {
            let line = tokio::select! {
                _ = shutdown.recv() => {
                    let bye = Response::wire(
                        421,
                        Some("4.3.2"),
                        format!("{} Service not available, closing transmission channel", self.runtime.hostname),
                    );
                    let _ = self.send(&bye).await;
                    return Ok(());
                }

                line = self.connection.read_line(self.inactivity()) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                // Peer closed; no reply owed
                Ok(None) => return Ok(()),
                Err(crate::error::ConnectionError::LineTooLong) => {
                    self.send(&Response::wire(500, Some("5.5.2"), "Line too long"))
                        .await?;
                    continue;
                }
                Err(crate::error::ConnectionError::Inactive(secs)) => {
                    let bye = Response::wire(
                        421,
                        Some("4.4.2"),
                        format!("{} Connection timed out due to inactivity", self.runtime.hostname),
                    );
                    let _ = self.send(&bye).await;
                    return Err(SessionError::Timeout(secs));
                }
                Err(crate::error::ConnectionError::Io(err)) => {
                    return Err(SessionError::Connection(err));
                }
                Err(err) => return Err(SessionError::Protocol(err.to_string())),
            };

            incoming!("{}", String::from_utf8_lossy(&line));

            if let Flow::Close = self.handle_line(&line).await? {
                return Ok(());
            }
        }
    }

    fn inactivity(&self) -> Duration {
        Duration::from_secs(self.runtime.inactivity_timeout)
    }

    async fn send(&mut self, response: &Response) -> Result<(), SessionError> {
        for line in response.render() {
            outgoing!("{}", line);
            self.connection.send(&line).await.map_err(|err| {
                internal!(level = ERROR, "Failed to send reply: {}", err);
                SessionError::Protocol(format!("Failed to send reply: {err}"))
            })?;
        }

        Ok(())
    }

    /// Send the reply and keep or close the connection per the terminal rule.
    async fn finish(&mut self, response: Response) -> Result<Flow, SessionError> {
        let terminal = response.is_terminal();
        self.send(&response).await?;

        Ok(if terminal { Flow::Close } else { Flow::Continue })
    }

    async fn handle_line(&mut self, line: &[u8]) -> Result<Flow, SessionError> {
        if self.session.phase == SessionPhase::Auth {
            return self.auth_continue(line).await;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            let reply = Response::wire(500, Some("5.5.2"), CommandError::Encoding.to_string());
            self.send(&reply).await?;
            return Ok(Flow::Continue);
        };

        let command = match SmtpCommand::parse(text) {
            Ok(command) => command,
            Err(err) => {
                self.send(&command_error_reply(&err)).await?;
                return Ok(Flow::Continue);
            }
        };

        if !self.permitted(command.command()) {
            internal!(
                level = DEBUG,
                "{} out of sequence in {} phase",
                command.verb(),
                self.session.phase
            );
            self.send(&Response::wire(503, Some("5.5.1"), "Bad sequence of commands"))
                .await?;
            return Ok(Flow::Continue);
        }

        match command.command().clone() {
            Command::Helo(host) => self.greet(&host, GreetingType::Helo).await,
            Command::Ehlo(host) => self.greet(&host, GreetingType::Ehlo).await,
            Command::Auth { mechanism, initial } => self.auth_begin(&mechanism, initial).await,
            Command::MailFrom { sender, params } => self.mail(sender, &params, &command).await,
            Command::RcptTo { recipient, .. } => self.rcpt(recipient, &command).await,
            Command::Data => self.data().await,
            Command::Rset => self.rset().await,
            Command::Quit => self.quit().await,
            Command::StartTls => self.starttls().await,
            Command::Noop => {
                let response = match self.dispatcher.noop(&mut self.session).await {
                    Some(response) => response,
                    None => Response::accept(ResponsePhase::Noop),
                };
                self.finish(response).await
            }
            Command::Help => {
                let response = match self.dispatcher.help(&mut self.session).await {
                    Some(response) => response,
                    None => Response::accept_with(
                        ResponsePhase::Help,
                        "Commands supported: EHLO HELO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
                    ),
                };
                self.finish(response).await
            }
            Command::Vrfy(_) => {
                let response = match self.dispatcher.vrfy(&mut self.session, &command).await {
                    Some(response) => response,
                    None => Response::accept(ResponsePhase::Vrfy),
                };
                self.finish(response).await
            }
            Command::Unknown { .. } => {
                let response = match self.dispatcher.unknown(&mut self.session, &command).await {
                    Some(response) => response,
                    None => Response::wire(500, Some("5.5.2"), "Command not recognized"),
                };
                self.finish(response).await
            }
        }
    }

    /// Phase gating. A `false` means 503 with no plugin dispatch.
    fn permitted(&self, command: &Command) -> bool {
        let phase = self.session.phase;

        match command {
            // A fresh greeting is legal in any command-reading phase
            Command::Helo(_) | Command::Ehlo(_) => true,
            Command::Auth { .. } => {
                phase == SessionPhase::Helo
                    && self.runtime.auth_enable
                    && !self.session.is_authenticated
            }
            // A repeated MAIL FROM acts as an implicit RSET
            Command::MailFrom { .. } => matches!(
                phase,
                SessionPhase::Helo | SessionPhase::Sender | SessionPhase::Recipient
            ),
            Command::RcptTo { .. } => {
                matches!(phase, SessionPhase::Sender | SessionPhase::Recipient)
            }
            Command::Data => phase == SessionPhase::Recipient,
            Command::StartTls => {
                phase == SessionPhase::Helo
                    && self.runtime.tls.is_some()
                    && !self.session.is_secure
            }
            Command::Rset
            | Command::Quit
            | Command::Noop
            | Command::Help
            | Command::Vrfy(_)
            | Command::Unknown { .. } => true,
        }
    }

    async fn greet(&mut self, host: &str, verb: GreetingType) -> Result<Flow, SessionError> {
        let response = match self.dispatcher.helo(&mut self.session, host, verb).await {
            Some(response) => response,
            None if verb.is_extended() => {
                Response::accept_with(ResponsePhase::Helo, self.ehlo_greeting())
            }
            None => Response::accept_with(ResponsePhase::Helo, self.runtime.hostname.clone()),
        };

        if response.code() == 250 {
            self.session.greeting_type = Some(verb);
            // A repeated greeting resets the transaction exactly like RSET
            self.session.reset_transaction();
            self.session.phase = SessionPhase::Helo;
        }

        self.finish(response).await
    }

    /// The EHLO reply: hostname first, HELP last, extensions between.
    fn ehlo_greeting(&self) -> String {
        let mut lines = vec![
            self.runtime.hostname.clone(),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            "SMTPUTF8".to_string(),
        ];

        if self.runtime.max_message_size > 0 {
            lines.push(format!("SIZE {}", self.runtime.max_message_size));
        }

        if self.runtime.tls.is_some() && !self.session.is_secure {
            lines.push("STARTTLS".to_string());
        }

        if self.runtime.auth_enable
            && (!self.runtime.auth_require_tls || self.session.is_secure)
        {
            lines.push("AUTH LOGIN PLAIN".to_string());
        }

        lines.push("HELP".to_string());

        lines.join("\n")
    }

    async fn auth_begin(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Flow, SessionError> {
        if self.runtime.auth_require_tls && !self.session.is_secure {
            let reply = Response::wire(
                538,
                Some("5.7.11"),
                "Encryption required for requested authentication mechanism",
            );
            return self.finish(reply).await;
        }

        match mechanism {
            "LOGIN" => match initial {
                None => {
                    self.session.phase = SessionPhase::Auth;
                    self.auth_exchange = Some(AuthExchange::LoginUsername);
                    // "Username:"
                    self.send(&Response::wire(334, None, "VXNlcm5hbWU6")).await?;
                    Ok(Flow::Continue)
                }
                Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
                    Ok(username) => {
                        self.session.phase = SessionPhase::Auth;
                        self.auth_exchange = Some(AuthExchange::LoginPassword { username });
                        // "Password:"
                        self.send(&Response::wire(334, None, "UGFzc3dvcmQ6")).await?;
                        Ok(Flow::Continue)
                    }
                    Err(_) => self.auth_malformed().await,
                },
            },
            "PLAIN" => match initial {
                Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
                    Ok(octets) => self.auth_plain(&octets).await,
                    Err(_) => self.auth_malformed().await,
                },
                None => {
                    self.session.phase = SessionPhase::Auth;
                    self.auth_exchange = Some(AuthExchange::PlainResponse);
                    self.send(&Response::wire(334, None, "")).await?;
                    Ok(Flow::Continue)
                }
            },
            _ => {
                let reply =
                    Response::wire(504, Some("5.5.4"), "Unrecognized authentication type");
                self.finish(reply).await
            }
        }
    }

    /// One client line of an in-flight AUTH exchange.
    async fn auth_continue(&mut self, line: &[u8]) -> Result<Flow, SessionError> {
        let exchange = self.auth_exchange.take();
        let text = std::str::from_utf8(line).unwrap_or("").trim();

        if text == "*" {
            self.session.phase = SessionPhase::Helo;
            let reply = Response::wire(501, Some("5.7.0"), "Authentication aborted");
            return self.finish(reply).await;
        }

        let Ok(octets) = BASE64.decode(text.as_bytes()) else {
            return self.auth_malformed().await;
        };

        match exchange {
            Some(AuthExchange::LoginUsername) => {
                self.auth_exchange = Some(AuthExchange::LoginPassword { username: octets });
                self.send(&Response::wire(334, None, "UGFzc3dvcmQ6")).await?;
                Ok(Flow::Continue)
            }
            Some(AuthExchange::LoginPassword { username }) => {
                self.auth_finish(&username, &octets).await
            }
            Some(AuthExchange::PlainResponse) => self.auth_plain(&octets).await,
            None => {
                // Cannot happen: the auth phase is only entered with an
                // exchange in flight. Recover anyway.
                self.session.phase = SessionPhase::Helo;
                let reply = Response::wire(503, Some("5.5.1"), "Bad sequence of commands");
                self.finish(reply).await
            }
        }
    }

    /// Split the RFC 4616 `authzid NUL authcid NUL passwd` response.
    async fn auth_plain(&mut self, octets: &[u8]) -> Result<Flow, SessionError> {
        let parts: Vec<&[u8]> = octets.split(|&b| b == 0).collect();

        if parts.len() != 3 {
            return self.auth_malformed().await;
        }

        let (username, password) = (parts[1].to_vec(), parts[2].to_vec());
        self.auth_finish(&username, &password).await
    }

    async fn auth_malformed(&mut self) -> Result<Flow, SessionError> {
        self.session.phase = SessionPhase::Helo;
        self.auth_exchange = None;
        let reply = Response::wire(501, Some("5.5.2"), "Cannot decode authentication response");
        self.finish(reply).await
    }

    async fn auth_finish(
        &mut self,
        username: &[u8],
        password: &[u8],
    ) -> Result<Flow, SessionError> {
        self.session.phase = SessionPhase::Helo;
        self.auth_exchange = None;

        let response = match self
            .dispatcher
            .auth(&mut self.session, username, password)
            .await
        {
            Some(response) => response,
            None => Response::wire(535, Some("5.7.8"), "Authentication credentials invalid"),
        };

        if response.code() == 235 {
            self.session.is_authenticated = true;
        }

        self.finish(response).await
    }

    async fn mail(
        &mut self,
        sender: ReversePath,
        params: &MailParameters,
        command: &SmtpCommand,
    ) -> Result<Flow, SessionError> {
        // A MAIL FROM mid-transaction starts over, mirroring HELO/EHLO
        if matches!(
            self.session.phase,
            SessionPhase::Sender | SessionPhase::Recipient
        ) {
            self.session.reset_transaction();
            self.session.phase = SessionPhase::Helo;
        }

        // Declared SIZE is checked before any plugin spends work on it
        if self.runtime.max_message_size > 0 {
            if let Some(declared) = params.size() {
                if declared > self.runtime.max_message_size {
                    let reply = Response::wire(
                        552,
                        Some("5.3.4"),
                        "Message size exceeds fixed maximum message size",
                    );
                    return self.finish(reply).await;
                }
            }
        }

        let response = match self
            .dispatcher
            .mail_from(&mut self.session, &sender, command)
            .await
        {
            Some(response) => response,
            None => Response::accept(ResponsePhase::MailFrom),
        };

        if response.code() == 250 {
            self.session.sender = Some(sender);
            self.session.phase = SessionPhase::Sender;
        }

        self.finish(response).await
    }

    async fn rcpt(
        &mut self,
        recipient: unmta_common::address::EnvelopeAddress,
        command: &SmtpCommand,
    ) -> Result<Flow, SessionError> {
        let response = match self
            .dispatcher
            .rcpt_to(&mut self.session, &recipient, command)
            .await
        {
            Some(response) => response,
            None => Response::accept(ResponsePhase::RcptTo),
        };

        if response.code() == 250 {
            self.session.recipients.push(recipient);
            self.session.phase = SessionPhase::Recipient;
        }

        self.finish(response).await
    }

    async fn data(&mut self) -> Result<Flow, SessionError> {
        let response = match self.dispatcher.data_start(&mut self.session).await {
            Some(response) => response,
            None => Response::accept(ResponsePhase::DataStart),
        };

        if response.code() != 354 {
            // Deferred or rejected; the transaction stays where it was
            return self.finish(response).await;
        }

        self.send(&response).await?;
        self.session.phase = SessionPhase::Data;
        self.session.is_data_mode = true;

        let mut decoder = DataDecoder::new(self.runtime.max_message_size);

        let payload = loop {
            let chunk = match self.connection.read_chunk(self.inactivity()).await {
                Ok(chunk) => chunk,
                Err(crate::error::ConnectionError::Inactive(secs)) => {
                    let bye = Response::wire(
                        421,
                        Some("4.4.2"),
                        format!(
                            "{} Connection timed out due to inactivity",
                            self.runtime.hostname
                        ),
                    );
                    let _ = self.send(&bye).await;
                    return Err(SessionError::Timeout(secs));
                }
                Err(crate::error::ConnectionError::Io(err)) => {
                    return Err(SessionError::Connection(err));
                }
                Err(err) => return Err(SessionError::Protocol(err.to_string())),
            };

            // Peer vanished mid-payload; nothing to reply to
            if chunk.is_empty() {
                return Ok(Flow::Close);
            }

            match decoder.push(&chunk) {
                DataOutcome::Continue => {}
                DataOutcome::Overflow => {
                    let reply = Response::wire(
                        552,
                        Some("5.3.4"),
                        "Message size exceeds fixed maximum message size",
                    );
                    self.send(&reply).await?;
                    return Ok(Flow::Close);
                }
                DataOutcome::Complete { payload, remainder } => {
                    self.connection.unread(remainder);
                    break payload;
                }
            }
        };

        self.session.is_data_mode = false;
        self.session.phase = SessionPhase::PostData;
        self.session.data = Some(Arc::from(payload));

        let response = match self.dispatcher.data_end(&mut self.session).await {
            Some(response) => response,
            None => Response::accept(ResponsePhase::DataEnd),
        };

        let flow = self.finish(response).await?;

        self.session.reset_transaction();
        self.session.phase = SessionPhase::Helo;

        Ok(flow)
    }

    async fn rset(&mut self) -> Result<Flow, SessionError> {
        // The hook observes the transaction before it is torn down
        let response = match self.dispatcher.rset(&mut self.session).await {
            Some(response) => response,
            None => Response::accept(ResponsePhase::Rset),
        };

        self.session.reset_transaction();
        self.session.phase = if self.session.greeting_type.is_some() {
            SessionPhase::Helo
        } else {
            SessionPhase::Connection
        };

        self.finish(response).await
    }

    async fn quit(&mut self) -> Result<Flow, SessionError> {
        let response = match self.dispatcher.quit(&mut self.session).await {
            Some(response) => response,
            None => Response::accept_with(
                ResponsePhase::Quit,
                format!("{} closing connection", self.runtime.hostname),
            ),
        };

        self.send(&response).await?;

        Ok(Flow::Close)
    }

    async fn starttls(&mut self) -> Result<Flow, SessionError> {
        let Some(tls) = self.runtime.tls.clone() else {
            // Unreachable through gating; answer like any unadvertised verb
            let reply = Response::wire(502, Some("5.5.1"), "STARTTLS not available");
            return self.finish(reply).await;
        };

        self.send(&Response::wire(220, Some("2.0.0"), "Ready to start TLS"))
            .await?;

        if let Err(err) = self.connection.upgrade(&tls).await {
            internal!(level = ERROR, "STARTTLS handshake failed: {}", err);
            return Err(SessionError::Protocol(err.to_string()));
        }

        // RFC 3207: both sides discard all knowledge from before the
        // handshake; the client must greet again.
        self.session.is_secure = true;
        self.session.greeting_type = None;
        self.session.is_authenticated = false;
        self.session.reset_transaction();
        self.session.phase = SessionPhase::Connection;

        internal!(level = DEBUG, "Connection upgraded to TLS");

        Ok(Flow::Continue)
    }
}

fn command_error_reply(err: &CommandError) -> Response {
    match err {
        CommandError::LineTooLong | CommandError::ControlCharacter | CommandError::Encoding => {
            Response::wire(500, Some("5.5.2"), err.to_string())
        }
        CommandError::MalformedPath(_)
        | CommandError::BadParameters(_)
        | CommandError::MissingArgument(_)
        | CommandError::UnexpectedArgument(_) => {
            Response::wire(501, Some("5.5.4"), err.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::plugin::{GlobalContext, HookResult, Plugin, PluginManager};
    use crate::session::PluginView;

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        fn new(stream: DuplexStream) -> Self {
            let (read, write) = tokio::io::split(stream);
            Self {
                reader: BufReader::new(read),
                writer: write,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn send_raw(&mut self, octets: &[u8]) {
            self.writer.write_all(octets).await.unwrap();
        }

        /// Read one full reply, following continuation lines. Returns the
        /// code and every line.
        async fn reply(&mut self) -> (u16, Vec<String>) {
            let mut lines = Vec::new();

            loop {
                let mut line = String::new();
                let read = self.reader.read_line(&mut line).await.unwrap();
                assert!(read > 0, "connection closed while awaiting a reply");

                let line = line.trim_end().to_string();
                let done = line.as_bytes().get(3) != Some(&b'-');
                lines.push(line);

                if done {
                    break;
                }
            }

            let code = lines[0][..3].parse().unwrap();
            (code, lines)
        }

        async fn expect(&mut self, code: u16) -> Vec<String> {
            let (got, lines) = self.reply().await;
            assert_eq!(got, code, "unexpected reply: {lines:?}");
            lines
        }

        async fn closed(mut self) {
            let mut line = String::new();
            assert_eq!(self.reader.read_line(&mut line).await.unwrap(), 0);
        }
    }

    fn runtime() -> SmtpRuntime {
        SmtpRuntime {
            hostname: "mx.test.example".to_string(),
            inactivity_timeout: 30,
            max_message_size: 0,
            auth_enable: false,
            auth_require_tls: true,
            tls: None,
        }
    }

    /// Spawns a machine over an in-memory duplex. The returned sender keeps
    /// the shutdown channel open for the lifetime of the test.
    fn start(
        runtime: SmtpRuntime,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> (Client, tokio::sync::broadcast::Sender<Signal>) {
        let (server_side, client_side) = tokio::io::duplex(16 * 1024);

        let mut manager = PluginManager::new();
        manager.load_plugins(plugins).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(manager), Arc::new(GlobalContext::new()));

        let machine = Machine::create(
            server_side,
            "127.0.0.1".to_string(),
            1,
            1,
            dispatcher,
            Arc::new(runtime),
        );

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(async move {
            let _ = machine.run(rx).await;
        });

        (Client::new(client_side), tx)
    }

    #[tokio::test]
    async fn happy_path() {
        let (mut client, _shutdown) = start(runtime(), vec![]);

        client.expect(220).await;

        client.send("EHLO client.example").await;
        let lines = client.expect(250).await;
        assert_eq!(lines[0], "250-mx.test.example");
        assert_eq!(lines.last().unwrap(), "250 HELP");

        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;

        client.send("RCPT TO:<b@y.example>").await;
        client.expect(250).await;

        client.send("DATA").await;
        client.expect(354).await;

        client.send_raw(b"Subject: t\r\n\r\nhi\r\n.\r\n").await;
        client.expect(250).await;

        client.send("QUIT").await;
        client.expect(221).await;
        client.closed().await;
    }

    #[tokio::test]
    async fn mail_before_greeting_is_gated() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        client.send("MAIL FROM:<a@x.example>").await;
        let lines = client.expect(503).await;
        assert!(lines[0].contains("5.5.1"));
    }

    #[tokio::test]
    async fn data_without_recipients_is_gated() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;

        client.send("DATA").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn rset_clears_the_transaction() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;

        client.send("RSET").await;
        client.expect(250).await;

        // No sender anymore, so RCPT is out of sequence
        client.send("RCPT TO:<b@y.example>").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn repeated_mail_from_restarts_the_transaction() {
        struct SenderProbe(Mutex<Vec<String>>);

        #[async_trait]
        impl Plugin for SenderProbe {
            fn plugin_name(&self) -> &str {
                "sender_probe"
            }

            async fn on_data_start(&self, session: &mut PluginView<'_>) -> HookResult {
                self.0.lock().unwrap().push(
                    session
                        .session()
                        .sender()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                );
                Ok(None)
            }
        }

        let probe = Arc::new(SenderProbe(Mutex::new(Vec::new())));
        let (mut client, _shutdown) = start(runtime(), vec![probe.clone()]);

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;

        client.send("MAIL FROM:<first@x.example>").await;
        client.expect(250).await;
        client.send("RCPT TO:<b@y.example>").await;
        client.expect(250).await;

        // Starting over without RSET implicitly resets
        client.send("MAIL FROM:<second@x.example>").await;
        client.expect(250).await;

        // The old recipient list is gone too
        client.send("DATA").await;
        client.expect(503).await;

        client.send("RCPT TO:<c@y.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;
        client.send_raw(b".\r\n").await;
        client.expect(250).await;

        assert_eq!(*probe.0.lock().unwrap(), vec!["<second@x.example>"]);
    }

    #[tokio::test]
    async fn unknown_command_default_reply() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        client.send("FROB the knob").await;
        let lines = client.expect(500).await;
        assert!(lines[0].contains("5.5.2"));
    }

    #[tokio::test]
    async fn oversize_line_keeps_connection() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        let long = format!("EHLO {}", "x".repeat(600));
        client.send(&long).await;
        client.expect(500).await;

        client.send("EHLO client.example").await;
        client.expect(250).await;
    }

    #[tokio::test]
    async fn dot_stuffed_payload_is_unstuffed() {
        struct PayloadProbe(Mutex<Vec<u8>>);

        #[async_trait]
        impl Plugin for PayloadProbe {
            fn plugin_name(&self) -> &str {
                "payload_probe"
            }

            async fn on_data_end(&self, session: &mut PluginView<'_>) -> HookResult {
                let data = session.session().data().unwrap();
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(None)
            }
        }

        let probe = Arc::new(PayloadProbe(Mutex::new(Vec::new())));
        let (mut client, _shutdown) = start(runtime(), vec![probe.clone()]);

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;
        client.send("RCPT TO:<b@y.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;

        client
            .send_raw(b"Subject: t\r\n\r\n..dotted\r\n.single\r\n.\r\n")
            .await;
        client.expect(250).await;

        assert_eq!(
            *probe.0.lock().unwrap(),
            b"Subject: t\r\n\r\n.dotted\r\nsingle\r\n"
        );
    }

    #[tokio::test]
    async fn auth_login_exchange() {
        struct Checker;

        #[async_trait]
        impl Plugin for Checker {
            fn plugin_name(&self) -> &str {
                "checker"
            }

            async fn on_auth(
                &self,
                _session: &mut PluginView<'_>,
                username: &[u8],
                password: &[u8],
            ) -> HookResult {
                if username == b"joe" && password == b"secret" {
                    Ok(Some(Response::accept(ResponsePhase::Auth)))
                } else {
                    Ok(Some(
                        Response::reject(ResponsePhase::Auth, Some(535), None).unwrap(),
                    ))
                }
            }
        }

        let mut config = runtime();
        config.auth_enable = true;
        config.auth_require_tls = false;

        let (mut client, _shutdown) = start(config, vec![Arc::new(Checker)]);
        client.expect(220).await;
        client.send("EHLO client.example").await;
        let lines = client.expect(250).await;
        assert!(lines.iter().any(|l| l.contains("AUTH LOGIN PLAIN")));

        client.send("AUTH LOGIN").await;
        let (code, lines) = client.reply().await;
        assert_eq!(code, 334);
        assert!(lines[0].contains("VXNlcm5hbWU6"));

        client.send(&BASE64.encode("joe")).await;
        let (code, lines) = client.reply().await;
        assert_eq!(code, 334);
        assert!(lines[0].contains("UGFzc3dvcmQ6"));

        client.send(&BASE64.encode("secret")).await;
        client.expect(235).await;

        // Authenticated now; a second AUTH is out of sequence
        client.send("AUTH LOGIN").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn auth_plain_inline() {
        struct Checker;

        #[async_trait]
        impl Plugin for Checker {
            fn plugin_name(&self) -> &str {
                "checker"
            }

            async fn on_auth(
                &self,
                _session: &mut PluginView<'_>,
                username: &[u8],
                password: &[u8],
            ) -> HookResult {
                assert_eq!(username, b"joe");
                assert_eq!(password, b"secret");
                Ok(Some(Response::accept(ResponsePhase::Auth)))
            }
        }

        let mut config = runtime();
        config.auth_enable = true;
        config.auth_require_tls = false;

        let (mut client, _shutdown) = start(config, vec![Arc::new(Checker)]);
        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;

        client
            .send(&format!("AUTH PLAIN {}", BASE64.encode("\0joe\0secret")))
            .await;
        client.expect(235).await;
    }

    #[tokio::test]
    async fn auth_without_tls_is_blocked() {
        struct NeverCalled;

        #[async_trait]
        impl Plugin for NeverCalled {
            fn plugin_name(&self) -> &str {
                "never_called"
            }

            async fn on_auth(
                &self,
                _session: &mut PluginView<'_>,
                _username: &[u8],
                _password: &[u8],
            ) -> HookResult {
                panic!("on_auth must not fire without TLS");
            }
        }

        let mut config = runtime();
        config.auth_enable = true;
        config.auth_require_tls = true;

        let (mut client, _shutdown) = start(config, vec![Arc::new(NeverCalled)]);
        client.expect(220).await;
        client.send("EHLO client.example").await;
        let lines = client.expect(250).await;
        assert!(!lines.iter().any(|l| l.contains("AUTH")));

        client.send("AUTH LOGIN").await;
        let lines = client.expect(538).await;
        assert!(lines[0].contains("5.7.11"));
    }

    #[tokio::test]
    async fn plugin_421_closes_the_connection() {
        struct Grump;

        #[async_trait]
        impl Plugin for Grump {
            fn plugin_name(&self) -> &str {
                "grump"
            }

            async fn on_rcpt_to(
                &self,
                _session: &mut PluginView<'_>,
                _recipient: &unmta_common::address::EnvelopeAddress,
                _command: &SmtpCommand,
            ) -> HookResult {
                Ok(Some(Response::raw(421, "Come back later")?))
            }
        }

        let (mut client, _shutdown) = start(runtime(), vec![Arc::new(Grump)]);
        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;

        client.send("RCPT TO:<b@y.example>").await;
        client.expect(421).await;
        client.closed().await;
    }

    #[tokio::test]
    async fn connect_reject_closes_immediately() {
        struct Bouncer;

        #[async_trait]
        impl Plugin for Bouncer {
            fn plugin_name(&self) -> &str {
                "bouncer"
            }

            async fn on_connect(&self, _session: &mut PluginView<'_>) -> HookResult {
                Ok(Some(Response::reject(ResponsePhase::Connect, None, Some("Go away"))?))
            }
        }

        let (mut client, _shutdown) = start(runtime(), vec![Arc::new(Bouncer)]);
        client.expect(554).await;
        client.closed().await;
    }

    #[tokio::test]
    async fn starttls_unconfigured_is_gated() {
        let (mut client, _shutdown) = start(runtime(), vec![]);
        client.expect(220).await;

        client.send("EHLO client.example").await;
        let lines = client.expect(250).await;
        assert!(!lines.iter().any(|l| l.contains("STARTTLS")));

        client.send("STARTTLS").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn starttls_advertised_when_configured() {
        let mut config = runtime();
        config.tls = Some(crate::connection::TlsMaterial {
            cert: "/etc/unmta/tls/cert.pem".into(),
            key: "/etc/unmta/tls/key.pem".into(),
        });

        let (mut client, _shutdown) = start(config, vec![]);
        client.expect(220).await;

        client.send("EHLO client.example").await;
        let lines = client.expect(250).await;
        assert!(lines.contains(&"250-STARTTLS".to_string()));

        // STARTTLS mid-transaction is out of sequence
        client.send("MAIL FROM:<a@x.example>").await;
        client.expect(250).await;
        client.send("STARTTLS").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn inactivity_timeout_closes_with_421() {
        let mut config = runtime();
        config.inactivity_timeout = 1;

        let (mut client, _shutdown) = start(config, vec![]);
        client.expect(220).await;

        let lines = client.expect(421).await;
        assert!(lines[0].contains("4.4.2"));
        client.closed().await;
    }
}
