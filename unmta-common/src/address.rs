//! RFC 5321 envelope address parsing.
//!
//! Parses the MAIL FROM reverse-path and RCPT TO forward-path arguments,
//! distinct from any RFC 5322 header address found inside the message body.
//! UTF-8 mailboxes are accepted per RFC 6531 (SMTPUTF8).
//!
//! # ABNF Grammar (RFC 5321 Section 4.1.2)
//!
//! ```text
//! Reverse-path   = Path / "<>"
//! Forward-path   = Path
//! Path           = "<" [ A-d-l ":" ] Mailbox ">"
//! Mailbox        = Local-part "@" ( Domain / address-literal )
//! Local-part     = Dot-string / Quoted-string
//! Dot-string     = Atom *("." Atom)
//! Quoted-string  = DQUOTE *QcontentSMTP DQUOTE
//! Domain         = sub-domain *("." sub-domain)
//! address-literal = "[" ( IPv4-address-literal / IPv6-address-literal /
//!                         General-address-literal ) "]"
//! ```
//!
//! # Size Constraints
//!
//! - Maximum path length: 256 octets (including angle brackets)
//! - Maximum local-part: 64 octets
//! - Maximum domain: 255 octets

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for address parsing
pub type Result<T> = std::result::Result<T, AddressError>;

/// Errors that can occur during envelope address parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Path exceeds 256 octets")]
    PathTooLong,
    #[error("Local-part exceeds 64 octets")]
    LocalPartTooLong,
    #[error("Domain exceeds 255 octets")]
    DomainTooLong,
    #[error("Missing opening angle bracket '<'")]
    MissingOpenBracket,
    #[error("Missing closing angle bracket '>'")]
    MissingCloseBracket,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    #[error("Invalid address literal: {0}")]
    InvalidAddressLiteral(String),
    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,
    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
    #[error("The null path <> is not a valid recipient")]
    NullForwardPath,
}

/// A parsed envelope mailbox.
///
/// Constructed only by the path parser and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeAddress {
    address: String,
    local_part: String,
    domain: String,
}

impl EnvelopeAddress {
    /// The full textual form, `local-part@domain`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The part before the `@`.
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The domain or address literal after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// The MAIL FROM argument: a mailbox or the null reverse-path `<>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReversePath {
    Null,
    Mailbox(EnvelopeAddress),
}

impl ReversePath {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn mailbox(&self) -> Option<&EnvelopeAddress> {
        match self {
            Self::Null => None,
            Self::Mailbox(address) => Some(address),
        }
    }
}

impl std::fmt::Display for ReversePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("<>"),
            Self::Mailbox(address) => write!(f, "<{address}>"),
        }
    }
}

/// Parse a reverse-path (MAIL FROM argument).
///
/// Accepts either `<mailbox>` or `<>` (null sender).
///
/// # Errors
///
/// Returns `AddressError` if the input is not a valid reverse-path.
pub fn parse_reverse_path(input: &str) -> Result<ReversePath> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    if trimmed.len() > 256 {
        return Err(AddressError::PathTooLong);
    }

    if trimmed == "<>" {
        return Ok(ReversePath::Null);
    }

    parse_path(trimmed).map(ReversePath::Mailbox)
}

/// Parse a forward-path (RCPT TO argument).
///
/// Must be `<mailbox>`; the null path is rejected.
///
/// # Errors
///
/// Returns `AddressError` if the input is not a valid forward-path.
pub fn parse_forward_path(input: &str) -> Result<EnvelopeAddress> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    if trimmed.len() > 256 {
        return Err(AddressError::PathTooLong);
    }

    if trimmed == "<>" {
        return Err(AddressError::NullForwardPath);
    }

    parse_path(trimmed)
}

/// Parse a Path: `<mailbox>` or `<source-route:mailbox>`
///
/// Source routing is deprecated but the syntax is accepted for backwards
/// compatibility; the route itself is discarded.
fn parse_path(input: &str) -> Result<EnvelopeAddress> {
    if !input.starts_with('<') {
        return Err(AddressError::MissingOpenBracket);
    }

    if !input.ends_with('>') {
        return Err(AddressError::MissingCloseBracket);
    }

    let content = &input[1..input.len() - 1];

    let mailbox_str =
        find_source_route_colon(content).map_or(content, |colon_pos| &content[colon_pos + 1..]);

    parse_mailbox(mailbox_str)
}

/// Find the position of ':' for source routing (not inside brackets)
fn find_source_route_colon(input: &str) -> Option<usize> {
    let mut in_brackets = false;
    let mut last_colon: Option<usize> = None;

    for (i, ch) in input.char_indices() {
        if ch == '[' {
            in_brackets = true;
        } else if ch == ']' {
            in_brackets = false;
        } else if ch == ':' && !in_brackets {
            last_colon = Some(i);
        }
    }

    last_colon
}

/// Parse a Mailbox: `local-part@domain` or `local-part@[address-literal]`
fn parse_mailbox(input: &str) -> Result<EnvelopeAddress> {
    let at_pos = find_unquoted_at(input)?;

    let local_part = &input[..at_pos];
    let domain = &input[at_pos + 1..];

    if local_part.len() > 64 {
        return Err(AddressError::LocalPartTooLong);
    }
    if domain.len() > 255 {
        return Err(AddressError::DomainTooLong);
    }

    let local = parse_local_part(local_part)?;
    let dom = parse_domain_or_address_literal(domain)?;

    Ok(EnvelopeAddress {
        address: format!("{local}@{dom}"),
        local_part: local,
        domain: dom,
    })
}

/// Find the position of '@' that is not inside a quoted string or address literal
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut prev_was_backslash = false;

    for (i, ch) in input.char_indices() {
        if ch == '"' && !prev_was_backslash && !in_brackets {
            in_quotes = !in_quotes;
        } else if ch == '[' && !in_quotes {
            in_brackets = true;
        } else if ch == ']' && !in_quotes {
            in_brackets = false;
        } else if ch == '@' && !in_quotes && !in_brackets {
            return Ok(i);
        }

        prev_was_backslash = ch == '\\' && !prev_was_backslash;
    }

    Err(AddressError::MissingAtSign)
}

/// Parse a local-part: Dot-string or Quoted-string
fn parse_local_part(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart(
            "Empty local-part".to_string(),
        ));
    }

    if input.starts_with('"') {
        parse_quoted_string(input)
    } else {
        parse_dot_string(input)
    }
}

/// Parse a Dot-string: Atom *("." Atom)
fn parse_dot_string(input: &str) -> Result<String> {
    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot contain consecutive dots".to_string(),
        ));
    }

    for atom in input.split('.') {
        if atom.is_empty() {
            return Err(AddressError::InvalidLocalPart(
                "Empty atom in dot-string".to_string(),
            ));
        }

        for ch in atom.chars() {
            if !is_atext(ch) {
                return Err(AddressError::InvalidLocalPart(format!(
                    "Invalid character '{ch}' in atom"
                )));
            }
        }
    }

    Ok(input.to_string())
}

/// Parse a Quoted-string: DQUOTE *`QcontentSMTP` DQUOTE
fn parse_quoted_string(input: &str) -> Result<String> {
    if !input.ends_with('"') || input.len() < 2 {
        return Err(AddressError::UnclosedQuotedString);
    }

    let content = &input[1..input.len() - 1];

    let mut chars = content.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next_ch) if next_ch.is_ascii_graphic() || next_ch == ' ' => {}
                Some(next_ch) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "Invalid quoted-pair: \\{next_ch}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "Backslash at end of quoted string".to_string(),
                    ));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "Invalid character '{ch}' in quoted string"
            )));
        }
    }

    Ok(input.to_string())
}

/// Parse domain or address-literal
fn parse_domain_or_address_literal(input: &str) -> Result<String> {
    if input.starts_with('[') {
        parse_address_literal(input)
    } else {
        parse_domain(input)
    }
}

/// Parse a Domain: sub-domain *("." sub-domain)
fn parse_domain(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("Empty domain".to_string()));
    }

    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidDomain(
            "Domain cannot start or end with '.'".to_string(),
        ));
    }

    if input.contains("..") {
        return Err(AddressError::InvalidDomain(
            "Domain cannot contain consecutive dots".to_string(),
        ));
    }

    for subdomain in input.split('.') {
        parse_subdomain(subdomain)?;
    }

    Ok(input.to_string())
}

/// Parse a sub-domain: Let-dig [Ldh-str]
///
/// Non-ASCII alphanumerics are permitted per RFC 6531 (U-labels).
fn parse_subdomain(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidDomain("Empty subdomain".to_string()));
    }

    if input
        .chars()
        .next()
        .is_none_or(|first| !first.is_alphanumeric())
    {
        return Err(AddressError::InvalidDomain(
            "Subdomain must start with letter or digit".to_string(),
        ));
    }

    if input
        .chars()
        .last()
        .is_none_or(|last| !last.is_alphanumeric())
    {
        return Err(AddressError::InvalidDomain(
            "Subdomain must end with letter or digit".to_string(),
        ));
    }

    for ch in input.chars() {
        if !ch.is_alphanumeric() && ch != '-' {
            return Err(AddressError::InvalidDomain(format!(
                "Invalid character '{ch}' in subdomain"
            )));
        }
    }

    Ok(())
}

/// Parse an address-literal: `[IPv4]` or `[IPv6:...]` or `[tag:...]`
fn parse_address_literal(input: &str) -> Result<String> {
    if !input.starts_with('[') || !input.ends_with(']') {
        return Err(AddressError::InvalidAddressLiteral(
            "Address literal must be enclosed in brackets".to_string(),
        ));
    }

    let content = &input[1..input.len() - 1];

    if content.parse::<Ipv4Addr>().is_ok() {
        return Ok(input.to_string());
    }

    if let Some(ipv6_str) = content.strip_prefix("IPv6:") {
        if ipv6_str.parse::<Ipv6Addr>().is_ok() {
            return Ok(input.to_string());
        }
    }

    // General address literal: tag:value
    if content.contains(':') {
        let parts: Vec<&str> = content.splitn(2, ':').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            return Ok(input.to_string());
        }
    }

    Err(AddressError::InvalidAddressLiteral(format!(
        "Invalid address literal format: {content}"
    )))
}

/// Check if character is valid atext (atom text).
///
/// ASCII atext per RFC 5321, plus any non-ASCII scalar per RFC 6531.
#[inline]
fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || !ch.is_ascii()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// Check if character is valid qtextSMTP (quoted text for SMTP)
///
/// qtextSMTP = %d32-33 / %d35-91 / %d93-126, extended with non-ASCII per
/// RFC 6531.
#[inline]
fn is_qtext_smtp(ch: char) -> bool {
    !ch.is_ascii() || matches!(ch as u8, 32..=33 | 35..=91 | 93..=126)
}
