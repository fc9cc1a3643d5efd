use core::fmt::{self, Display, Formatter};

/// Coarse stage of an RFC 5321 conversation; gates which verbs are legal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connected, no greeting exchanged yet (also the state after STARTTLS).
    #[default]
    Connection,
    /// Mid-AUTH challenge/response exchange.
    Auth,
    /// Greeted, outside a mail transaction.
    Helo,
    /// MAIL FROM accepted, no recipients yet.
    Sender,
    /// At least one RCPT TO accepted.
    Recipient,
    /// Consuming the DATA payload.
    Data,
    /// Payload complete, end-of-data reply pending.
    PostData,
}

impl Display for SessionPhase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Helo => "helo",
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::Data => "data",
            Self::PostData => "postdata",
        })
    }
}

/// Which greeting verb opened the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingType {
    Helo,
    Ehlo,
}

impl GreetingType {
    /// EHLO unlocks the ESMTP extension set.
    #[must_use]
    pub const fn is_extended(self) -> bool {
        matches!(self, Self::Ehlo)
    }
}

impl Display for GreetingType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
        })
    }
}
