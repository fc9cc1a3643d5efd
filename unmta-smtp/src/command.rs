use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use phf::phf_map;
use thiserror::Error;
use unmta_common::address::{
    self, AddressError, EnvelopeAddress, ReversePath,
};

/// Maximum length of one command line in octets, CRLF included (RFC 5321
/// Section 4.5.3.1.4).
pub const MAX_LINE_OCTETS: usize = 512;

/// Errors produced while reading or parsing a command line.
///
/// Each variant maps onto exactly one wire reply; the connection stays open
/// for all of them.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Line exceeded [`MAX_LINE_OCTETS`] including CRLF. Replied 500 5.5.2.
    #[error("Line too long")]
    LineTooLong,

    /// Control characters outside DATA. Replied 500 5.5.2.
    #[error("Syntax error (control character in command)")]
    ControlCharacter,

    /// Bytes that do not form valid UTF-8. Replied 500 5.5.2.
    #[error("Syntax error (undecodable command)")]
    Encoding,

    /// Malformed MAIL FROM / RCPT TO path. Replied 501 5.5.4.
    #[error("Invalid address path: {0}")]
    MalformedPath(#[from] AddressError),

    /// Malformed ESMTP parameters. Replied 501 5.5.4.
    #[error("Invalid parameters: {0}")]
    BadParameters(String),

    /// A verb that requires an argument arrived without one. Replied 501.
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    /// A verb that takes no argument arrived with one. Replied 501.
    #[error("{0} accepts no argument")]
    UnexpectedArgument(&'static str),
}

/// ESMTP parameters for MAIL FROM and RCPT TO (RFC 5321 Section 4.1.2).
///
/// Keys are normalized to uppercase. Common parameters are SIZE (RFC 1870),
/// BODY (RFC 6152), AUTH (RFC 4954) and SMTPUTF8 (RFC 6531).
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

/// Known ESMTP parameter keys, interned for allocation-free normalization
static KNOWN_PARAMS: phf::Map<&'static str, &'static str> = phf_map! {
    "SIZE" => "SIZE",
    "BODY" => "BODY",
    "AUTH" => "AUTH",
    "RET" => "RET",
    "ENVID" => "ENVID",
    "SMTPUTF8" => "SMTPUTF8",
};

fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();
    KNOWN_PARAMS
        .get(upper.as_str())
        .map_or(Cow::Owned(upper), |&interned| Cow::Borrowed(interned))
}

impl MailParameters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: AHashMap::new(),
        }
    }

    /// Parses parameter tokens in the form `KEY=VALUE` or `FLAG`.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter appears twice or SIZE carries a
    /// non-numeric or zero value.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::new();

        for token in params_str.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => {
                    let key_normalized = normalize_key(key);

                    if params.has(key) {
                        return Err(format!("Duplicate parameter '{key_normalized}'"));
                    }

                    if key_normalized == "SIZE" {
                        match value.parse::<usize>() {
                            Ok(0) => return Err(String::from("SIZE=0 is not allowed")),
                            Ok(_) => {}
                            Err(_) => return Err(format!("Invalid SIZE value: {value}")),
                        }
                    }

                    params
                        .params
                        .insert(key_normalized, Some(value.to_string()));
                }
                None => {
                    let key_normalized = normalize_key(token);

                    if params.has(token) {
                        return Err(format!("Duplicate parameter '{key_normalized}'"));
                    }

                    params.params.insert(key_normalized, None);
                }
            }
        }

        Ok(params)
    }

    /// Gets a parameter value by key (case-insensitive).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(normalize_key(key).as_ref())?.as_deref()
    }

    /// Checks if a parameter exists (case-insensitive).
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(normalize_key(key).as_ref())
    }

    /// The declared SIZE parameter, if present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cow<'static, str>, &Option<String>)> {
        self.params.iter()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;

            match v {
                None => f.write_str(k)?,
                Some(val) => write!(f, "{k}={val}")?,
            }
        }
        Ok(())
    }
}

/// A parsed SMTP verb with its structured arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    MailFrom {
        sender: ReversePath,
        params: MailParameters,
    },
    RcptTo {
        recipient: EnvelopeAddress,
        params: MailParameters,
    },
    Data,
    Rset,
    Quit,
    StartTls,
    Noop,
    Help,
    Vrfy(String),
    Unknown {
        verb: String,
        argument: String,
    },
}

impl Command {
    /// The canonical verb name, for phase gating and logging.
    #[must_use]
    pub fn verb(&self) -> &str {
        match self {
            Self::Helo(_) => "HELO",
            Self::Ehlo(_) => "EHLO",
            Self::Auth { .. } => "AUTH",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
            Self::StartTls => "STARTTLS",
            Self::Noop => "NOOP",
            Self::Help => "HELP",
            Self::Vrfy(_) => "VRFY",
            Self::Unknown { verb, .. } => verb,
        }
    }
}

/// One received command line: the raw octets as text plus the parsed verb.
#[derive(Debug, Clone)]
pub struct SmtpCommand {
    raw: String,
    command: Command,
}

impl SmtpCommand {
    /// Parse one logical line (CRLF already stripped).
    ///
    /// # Errors
    ///
    /// Returns `CommandError` describing the wire reply the caller owes the
    /// client.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        if line
            .chars()
            .any(|ch| ch.is_ascii_control())
        {
            return Err(CommandError::ControlCharacter);
        }

        let command = parse_command(line)?;

        Ok(Self {
            raw: line.to_string(),
            command,
        })
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn verb(&self) -> &str {
        self.command.verb()
    }
}

impl Display for SmtpCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_command(line: &str) -> Result<Command, CommandError> {
    let trimmed = line.trim();

    if let Some(prefix) = trimmed.get(..10) {
        if prefix.eq_ignore_ascii_case("MAIL FROM:") {
            let (path, params) = split_path_and_params(trimmed[10..].trim())?;
            let sender = address::parse_reverse_path(path)?;
            return Ok(Command::MailFrom { sender, params });
        }
    }

    if let Some(prefix) = trimmed.get(..8) {
        if prefix.eq_ignore_ascii_case("RCPT TO:") {
            let (path, params) = split_path_and_params(trimmed[8..].trim())?;
            let recipient = address::parse_forward_path(path)?;
            return Ok(Command::RcptTo { recipient, params });
        }
    }

    let (verb, argument) = match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (trimmed, ""),
    };

    if verb.eq_ignore_ascii_case("HELO") {
        return if argument.is_empty() {
            Err(CommandError::MissingArgument("HELO"))
        } else {
            Ok(Command::Helo(argument.to_string()))
        };
    }

    if verb.eq_ignore_ascii_case("EHLO") {
        return if argument.is_empty() {
            Err(CommandError::MissingArgument("EHLO"))
        } else {
            Ok(Command::Ehlo(argument.to_string()))
        };
    }

    if verb.eq_ignore_ascii_case("AUTH") {
        if argument.is_empty() {
            return Err(CommandError::MissingArgument("AUTH"));
        }
        let (mechanism, initial) = match argument.split_once(char::is_whitespace) {
            Some((mechanism, rest)) => (mechanism, Some(rest.trim().to_string())),
            None => (argument, None),
        };
        return Ok(Command::Auth {
            mechanism: mechanism.to_ascii_uppercase(),
            initial,
        });
    }

    if verb.eq_ignore_ascii_case("VRFY") {
        return if argument.is_empty() {
            Err(CommandError::MissingArgument("VRFY"))
        } else {
            Ok(Command::Vrfy(argument.to_string()))
        };
    }

    for (name, command) in [
        ("DATA", Command::Data),
        ("RSET", Command::Rset),
        ("QUIT", Command::Quit),
        ("STARTTLS", Command::StartTls),
    ] {
        if verb.eq_ignore_ascii_case(name) {
            return if argument.is_empty() {
                Ok(command)
            } else {
                Err(CommandError::UnexpectedArgument(name))
            };
        }
    }

    // NOOP and HELP tolerate (and ignore) an argument per RFC 5321
    if verb.eq_ignore_ascii_case("NOOP") {
        return Ok(Command::Noop);
    }
    if verb.eq_ignore_ascii_case("HELP") {
        return Ok(Command::Help);
    }

    Ok(Command::Unknown {
        verb: verb.to_ascii_uppercase(),
        argument: argument.to_string(),
    })
}

/// Split `<path> [KEY=VALUE ...]` into the path and its ESMTP parameters.
fn split_path_and_params(rest: &str) -> Result<(&str, MailParameters), CommandError> {
    if rest.is_empty() {
        return Err(CommandError::MalformedPath(AddressError::Empty));
    }

    let (path, params_str) = match rest.split_once(char::is_whitespace) {
        Some((path, params_str)) => (path, params_str.trim()),
        None => (rest, ""),
    };

    let params = if params_str.is_empty() {
        MailParameters::new()
    } else {
        MailParameters::from_params_str(params_str).map_err(CommandError::BadParameters)?
    };

    Ok((path, params))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    // Idea copied from https://gitlab.com/erichdongubler-experiments/rust_case_permutations/blob/master/src/lib.rs#L97
    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        let (upper, lower) = string.chars().fold(
            (Vec::with_capacity(len), Vec::with_capacity(len)),
            |(mut upper, mut lower), c| {
                upper.push(c.to_ascii_uppercase());
                lower.push(c.to_ascii_lowercase());
                (upper, lower)
            },
        );

        (0..num_cases).map(move |i| {
            (0..len).fold(String::with_capacity(len), |mut s, idx| {
                if (i & (1 << idx)) == 0 {
                    s.push(lower[idx]);
                } else {
                    s.push(upper[idx]);
                }
                s
            })
        })
    }

    fn parse(line: &str) -> Result<Command, CommandError> {
        SmtpCommand::parse(line).map(|c| c.command().clone())
    }

    #[test]
    fn mail_from_command() {
        match parse("MAIL FROM:<test@example.com>").unwrap() {
            Command::MailFrom { sender, params } => {
                assert_eq!(sender.mailbox().unwrap().address(), "test@example.com");
                assert!(params.is_empty());
            }
            other => panic!("expected MailFrom, got {other:?}"),
        }

        assert!(parse("MAIL FROM:").is_err());
        assert!(parse("MAIL FROM:dasdas").is_err());

        assert!(matches!(
            parse("MAIL FROM:<>").unwrap(),
            Command::MailFrom {
                sender: ReversePath::Null,
                ..
            }
        ));

        for comm in string_casing("mail from") {
            assert!(matches!(
                parse(&format!("{comm}:<test@example.com>")),
                Ok(Command::MailFrom { .. })
            ));
        }
    }

    #[test]
    fn mail_from_size_edge_cases() {
        match parse("MAIL FROM:<test@example.com> SIZE=12345").unwrap() {
            Command::MailFrom { params, .. } => assert_eq!(params.size(), Some(12345)),
            other => panic!("expected MailFrom, got {other:?}"),
        }

        // SIZE=0 is semantically invalid
        assert!(matches!(
            parse("MAIL FROM:<test@example.com> SIZE=0"),
            Err(CommandError::BadParameters(_))
        ));

        assert!(matches!(
            parse("MAIL FROM:<test@example.com> SIZE=abc"),
            Err(CommandError::BadParameters(_))
        ));

        assert!(matches!(
            parse("MAIL FROM:<test@example.com> SIZE=1000 SIZE=2000"),
            Err(CommandError::BadParameters(_))
        ));

        // Case insensitive parameter keys
        match parse("MAIL FROM:<test@example.com> size=5000").unwrap() {
            Command::MailFrom { params, .. } => assert_eq!(params.size(), Some(5000)),
            other => panic!("expected MailFrom, got {other:?}"),
        }

        // NULL sender with SIZE
        match parse("MAIL FROM:<> SIZE=500").unwrap() {
            Command::MailFrom { sender, params } => {
                assert!(sender.is_null());
                assert_eq!(params.size(), Some(500));
            }
            other => panic!("expected MailFrom, got {other:?}"),
        }

        // Flag parameter without a value
        match parse("MAIL FROM:<test@example.com> SMTPUTF8").unwrap() {
            Command::MailFrom { params, .. } => assert!(params.has("SMTPUTF8")),
            other => panic!("expected MailFrom, got {other:?}"),
        }
    }

    #[test]
    fn rcpt_to_command() {
        match parse("RCPT TO:<test@example.com>").unwrap() {
            Command::RcptTo { recipient, .. } => {
                assert_eq!(recipient.address(), "test@example.com");
            }
            other => panic!("expected RcptTo, got {other:?}"),
        }

        assert!(parse("RCPT TO:").is_err());
        assert!(parse("RCPT TO:dasdsa").is_err());

        // The null path is not a valid recipient
        assert!(matches!(
            parse("RCPT TO:<>"),
            Err(CommandError::MalformedPath(AddressError::NullForwardPath))
        ));

        for comm in string_casing("rcpt to") {
            assert!(matches!(
                parse(&format!("{comm}:<test@example.com>")),
                Ok(Command::RcptTo { .. })
            ));
        }
    }

    #[test]
    fn helo_ehlo_command() {
        assert!(parse("EHLO").is_err());
        assert!(parse("HELO").is_err());

        assert_eq!(
            parse("EHLO client.example").unwrap(),
            Command::Ehlo("client.example".to_string())
        );
        assert_eq!(
            parse("HELO client.example").unwrap(),
            Command::Helo("client.example".to_string())
        );

        for comm in string_casing("ehlo") {
            assert!(matches!(
                parse(&format!("{comm} test")),
                Ok(Command::Ehlo(_))
            ));
        }

        for comm in string_casing("helo") {
            assert!(matches!(
                parse(&format!("{comm} test")),
                Ok(Command::Helo(_))
            ));
        }
    }

    #[test]
    fn auth_command() {
        assert_eq!(
            parse("AUTH LOGIN").unwrap(),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: None
            }
        );

        assert_eq!(
            parse("auth plain AGpvZQBzZWNyZXQ=").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGpvZQBzZWNyZXQ=".to_string())
            }
        );

        assert!(matches!(parse("AUTH"), Err(CommandError::MissingArgument(_))));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse("DATA").unwrap(), Command::Data);
        assert_eq!(parse("QUIT").unwrap(), Command::Quit);
        assert_eq!(parse("RSET").unwrap(), Command::Rset);
        assert_eq!(parse("STARTTLS").unwrap(), Command::StartTls);
        assert_eq!(parse("NOOP").unwrap(), Command::Noop);
        assert_eq!(parse("NOOP ignored").unwrap(), Command::Noop);
        assert_eq!(parse("HELP").unwrap(), Command::Help);

        for comm in string_casing("data") {
            assert_eq!(parse(&comm).unwrap(), Command::Data);
        }
        for comm in string_casing("quit") {
            assert_eq!(parse(&comm).unwrap(), Command::Quit);
        }
        for comm in string_casing("rset") {
            assert_eq!(parse(&comm).unwrap(), Command::Rset);
        }

        assert!(matches!(
            parse("DATA now"),
            Err(CommandError::UnexpectedArgument("DATA"))
        ));
        assert!(matches!(
            parse("RSET please"),
            Err(CommandError::UnexpectedArgument("RSET"))
        ));
    }

    #[test]
    fn vrfy_command() {
        assert_eq!(
            parse("VRFY postmaster").unwrap(),
            Command::Vrfy("postmaster".to_string())
        );
        assert!(matches!(
            parse("VRFY"),
            Err(CommandError::MissingArgument("VRFY"))
        ));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            parse("FROB the knob").unwrap(),
            Command::Unknown {
                verb: "FROB".to_string(),
                argument: "the knob".to_string()
            }
        );
    }

    #[test]
    fn control_characters_rejected() {
        assert!(matches!(
            SmtpCommand::parse("NOOP\x07"),
            Err(CommandError::ControlCharacter)
        ));
        assert!(matches!(
            SmtpCommand::parse("MAIL\x00FROM:<a@x.example>"),
            Err(CommandError::ControlCharacter)
        ));
    }

    #[test]
    fn raw_line_preserved() {
        let command = SmtpCommand::parse("rcpt to:<b@y.example>").unwrap();
        assert_eq!(command.raw(), "rcpt to:<b@y.example>");
        assert_eq!(command.verb(), "RCPT");
    }
}
