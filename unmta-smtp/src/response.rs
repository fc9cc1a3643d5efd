//! Guardrail SMTP reply construction.
//!
//! Each hook phase exposes `accept`, `defer` and `reject` constructors with a
//! fixed default code and a whitelist of the codes RFC 5321 permits for that
//! phase and disposition. Constructing outside the whitelist is a programming
//! error surfaced at construction time. [`Response::raw`] is the unrestricted
//! escape hatch accepting any code in 200..=599.

use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use thiserror::Error;

/// The hook a response answers; decides which reply codes are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    Connect,
    Helo,
    Auth,
    MailFrom,
    RcptTo,
    DataStart,
    DataEnd,
    Quit,
    Rset,
    Noop,
    Help,
    Vrfy,
    Unknown,
}

impl Display for ResponsePhase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::Auth => "auth",
            Self::MailFrom => "mail_from",
            Self::RcptTo => "rcpt_to",
            Self::DataStart => "data_start",
            Self::DataEnd => "data_end",
            Self::Quit => "quit",
            Self::Rset => "rset",
            Self::Noop => "noop",
            Self::Help => "help",
            Self::Vrfy => "vrfy",
            Self::Unknown => "unknown",
        })
    }
}

/// What a response means for the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Defer,
    Reject,
    /// Built through the unrestricted constructor; no guardrail applied.
    Raw,
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Accept => "accept",
            Self::Defer => "defer",
            Self::Reject => "reject",
            Self::Raw => "raw",
        })
    }
}

/// Errors surfaced when a guardrail constructor is misused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Code {code} is not permitted for {action} in the {phase} phase")]
    CodeNotPermitted {
        phase: ResponsePhase,
        action: Action,
        code: u16,
    },

    #[error("The {phase} phase permits no {action} response")]
    ActionNotAvailable {
        phase: ResponsePhase,
        action: Action,
    },

    #[error("Reply code {0} is outside 200..=599")]
    OutOfRange(u16),
}

/// (default code, full whitelist) for one phase and disposition.
///
/// An empty whitelist means the disposition does not exist for the phase
/// (e.g. there is no reject for QUIT).
const fn table(phase: ResponsePhase, action: Action) -> (u16, &'static [u16]) {
    use Action::{Accept, Defer, Raw, Reject};
    use ResponsePhase::{
        Auth, Connect, DataEnd, DataStart, Helo, MailFrom, Noop, Quit, RcptTo, Rset, Unknown,
        Vrfy,
    };
    use ResponsePhase::Help as HelpPhase;

    match (phase, action) {
        (Connect, Accept) => (220, &[220]),
        (Connect, Defer) => (421, &[421]),
        (Connect, Reject) => (554, &[554]),

        (Helo, Accept) => (250, &[250]),
        (Helo, Defer) => (450, &[421, 450, 451, 452]),
        (Helo, Reject) => (550, &[502, 504, 550, 554]),

        (Auth, Accept) => (235, &[235]),
        (Auth, Defer) => (454, &[421, 454]),
        (Auth, Reject) => (535, &[432, 454, 500, 501, 534, 535, 538]),

        (MailFrom | RcptTo, Accept) => (250, &[250]),
        (MailFrom | RcptTo, Defer) => (450, &[450, 451, 452]),
        (MailFrom | RcptTo, Reject) => (550, &[550, 551, 552, 553, 554]),

        (DataStart, Accept) => (354, &[354]),
        (DataStart, Defer) => (451, &[451]),
        (DataStart, Reject) => (554, &[503, 554]),

        (DataEnd, Accept) => (250, &[250]),
        (DataEnd, Defer) => (451, &[451, 452]),
        (DataEnd, Reject) => (550, &[550, 552, 554]),

        (Quit, Accept) => (221, &[221]),
        (Quit, Defer | Reject) => (0, &[]),

        (Rset | Noop, Accept) => (250, &[250]),
        (Rset | Noop, Defer) => (421, &[421]),
        (Rset | Noop, Reject) => (502, &[502]),

        (HelpPhase, Accept) => (214, &[211, 214]),
        (HelpPhase, Defer) => (421, &[421]),
        (HelpPhase, Reject) => (502, &[502, 504]),

        (Vrfy, Accept) => (252, &[250, 251, 252]),
        (Vrfy, Defer) => (421, &[421]),
        (Vrfy, Reject) => (550, &[550, 551, 553]),

        (Unknown, Accept) => (250, &[250]),
        (Unknown, Defer) => (421, &[421]),
        (Unknown, Reject) => (500, &[500, 502]),

        (_, Raw) => (0, &[]),
    }
}

const fn default_message(phase: ResponsePhase, action: Action) -> &'static str {
    use Action::{Accept, Defer, Raw, Reject};
    use ResponsePhase::{Auth, DataEnd, DataStart, Quit, Vrfy};

    match (phase, action) {
        (DataStart, Accept) => "End data with <CR><LF>.<CR><LF>",
        (DataEnd, Accept) => "OK: message accepted",
        (Quit, Accept) => "Bye",
        (Auth, Accept) => "2.7.0 Authentication successful",
        (Auth, Reject) => "5.7.8 Authentication credentials invalid",
        (Vrfy, Accept) => "Cannot VRFY user, but will accept message and attempt delivery",
        (_, Accept) => "OK",
        (_, Defer) => "Temporary failure, try again later",
        (_, Reject) => "Request denied",
        (_, Raw) => "",
    }
}

/// A reply owed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    code: u16,
    enhanced_status: Option<Cow<'static, str>>,
    message: String,
    action: Action,
}

impl Response {
    /// Accept with the phase's fixed code and default message.
    #[must_use]
    pub fn accept(phase: ResponsePhase) -> Self {
        Self::accept_with(phase, default_message(phase, Action::Accept))
    }

    /// Accept with the phase's fixed code and a custom message.
    ///
    /// The message may contain `\n` separators; they render as reply
    /// continuation lines on the wire.
    #[must_use]
    pub fn accept_with(phase: ResponsePhase, message: impl Into<String>) -> Self {
        let (code, _) = table(phase, Action::Accept);
        Self {
            code,
            enhanced_status: None,
            message: message.into(),
            action: Action::Accept,
        }
    }

    /// Defer (4xx) with an optional code and message.
    ///
    /// # Errors
    ///
    /// Returns `ResponseError` if the code is outside the phase's defer
    /// whitelist.
    pub fn defer(
        phase: ResponsePhase,
        code: Option<u16>,
        message: Option<&str>,
    ) -> Result<Self, ResponseError> {
        Self::guarded(phase, Action::Defer, code, message)
    }

    /// Reject (5xx) with an optional code and message.
    ///
    /// # Errors
    ///
    /// Returns `ResponseError` if the code is outside the phase's reject
    /// whitelist.
    pub fn reject(
        phase: ResponsePhase,
        code: Option<u16>,
        message: Option<&str>,
    ) -> Result<Self, ResponseError> {
        Self::guarded(phase, Action::Reject, code, message)
    }

    /// The unrestricted constructor: any code in 200..=599, any message.
    ///
    /// # Errors
    ///
    /// Returns `ResponseError::OutOfRange` for codes outside 200..=599.
    pub fn raw(code: u16, message: impl Into<String>) -> Result<Self, ResponseError> {
        if !(200..=599).contains(&code) {
            return Err(ResponseError::OutOfRange(code));
        }

        Ok(Self {
            code,
            enhanced_status: None,
            message: message.into(),
            action: Action::Raw,
        })
    }

    fn guarded(
        phase: ResponsePhase,
        action: Action,
        code: Option<u16>,
        message: Option<&str>,
    ) -> Result<Self, ResponseError> {
        let (default, permitted) = table(phase, action);

        if permitted.is_empty() {
            return Err(ResponseError::ActionNotAvailable { phase, action });
        }

        let code = code.unwrap_or(default);
        if !permitted.contains(&code) {
            return Err(ResponseError::CodeNotPermitted {
                phase,
                action,
                code,
            });
        }

        Ok(Self {
            code,
            enhanced_status: None,
            message: message
                .map_or_else(|| default_message(phase, action).to_string(), str::to_string),
            action,
        })
    }

    /// Server-internal replies (503 gating, 421 timeout, ...). Not part of
    /// the plugin-facing surface.
    pub(crate) fn wire(
        code: u16,
        enhanced_status: Option<&'static str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            enhanced_status: enhanced_status.map(Cow::Borrowed),
            message: message.into(),
            action: Action::Raw,
        }
    }

    /// Attach an RFC 3463 enhanced status code (`x.y.z`).
    #[must_use]
    pub fn with_enhanced_status(mut self, status: impl Into<String>) -> Self {
        self.enhanced_status = Some(Cow::Owned(status.into()));
        self
    }

    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn enhanced_status(&self) -> Option<&str> {
        self.enhanced_status.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn action(&self) -> Action {
        self.action
    }

    /// Checks if the reply is a permanent rejection
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Checks if the reply is a temporary rejection
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 421 closes the connection after emission, from any phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.code == 421
    }

    /// The full reply lines to put on the wire, without CRLF.
    ///
    /// Multiline messages use the `CCC-` continuation form; the enhanced
    /// status code, when present, follows the code on every line.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        let status = self
            .enhanced_status
            .as_deref()
            .map_or_else(String::new, |status| format!("{status} "));

        let lines: Vec<&str> = self.message.split('\n').collect();
        let last = lines.len() - 1;

        lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("{}{separator}{status}{line}", self.code)
            })
            .collect()
    }
}

impl Display for Response {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for line in self.render() {
            if !first {
                fmt.write_str("\r\n")?;
            }
            first = false;
            fmt.write_str(&line)?;
        }
        Ok(())
    }
}
