//! Ordered hook dispatch.
//!
//! For each hook, plugins fire in registration order. The first plugin to
//! return a [`Response`] wins and the rest of the chain never sees the
//! event. A failed handler is logged and skipped; the chain continues.
//! Handlers are awaited one at a time, so within a session no two handlers
//! ever run concurrently.

use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use unmta_common::{
    address::{EnvelopeAddress, ReversePath},
    internal,
};

use crate::{
    command::SmtpCommand,
    phase::GreetingType,
    plugin::{GlobalContext, PluginManager},
    response::Response,
    session::{PluginView, Session},
};

/// The closed set of extension points fired by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Connect,
    Helo,
    Auth,
    MailFrom,
    RcptTo,
    DataStart,
    DataEnd,
    Quit,
    Close,
    Rset,
    Help,
    Noop,
    Vrfy,
    Unknown,
    ServerStart,
    ServerStop,
}

impl Display for Hook {
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
            Self::Close => "close",
            Self::Rset => "rset",
            Self::Help => "help",
            Self::Noop => "noop",
            Self::Vrfy => "vrfy",
            Self::Unknown => "unknown",
            Self::ServerStart => "server_start",
            Self::ServerStop => "server_stop",
        })
    }
}

/// Runs one hook chain to settlement: first response wins, errors continue.
macro_rules! chain {
    ($self:expr, $hook:expr, $session:expr, $plugin:ident, $view:ident => $call:expr) => {{
        let mut winner = None;

        for $plugin in $self.plugins.iter() {
            let mut $view = PluginView::new($session, $plugin.plugin_name(), &$self.global);

            match $call.await {
                Ok(Some(response)) => {
                    internal!(
                        level = DEBUG,
                        "Plugin '{}' answered {} with {}",
                        $plugin.plugin_name(),
                        $hook,
                        response.code()
                    );
                    winner = Some(response);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Plugin '{}' failed in {}: {}",
                        $plugin.plugin_name(),
                        $hook,
                        err
                    );
                }
            }
        }

        winner
    }};
}

/// Invokes the registered plugin chain for each protocol event.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    plugins: Arc<PluginManager>,
    global: Arc<GlobalContext>,
}

impl Dispatcher {
    pub(crate) fn new(plugins: Arc<PluginManager>, global: Arc<GlobalContext>) -> Self {
        Self { plugins, global }
    }

    pub(crate) async fn connect(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::Connect, session, plugin, view => plugin.on_connect(&mut view))
    }

    pub(crate) async fn helo(
        &self,
        session: &mut Session,
        hostname: &str,
        verb: GreetingType,
    ) -> Option<Response> {
        chain!(self, Hook::Helo, session, plugin, view => plugin.on_helo(&mut view, hostname, verb))
    }

    pub(crate) async fn auth(
        &self,
        session: &mut Session,
        username: &[u8],
        password: &[u8],
    ) -> Option<Response> {
        chain!(self, Hook::Auth, session, plugin, view => plugin.on_auth(&mut view, username, password))
    }

    pub(crate) async fn mail_from(
        &self,
        session: &mut Session,
        sender: &ReversePath,
        command: &SmtpCommand,
    ) -> Option<Response> {
        chain!(self, Hook::MailFrom, session, plugin, view => plugin.on_mail_from(&mut view, sender, command))
    }

    pub(crate) async fn rcpt_to(
        &self,
        session: &mut Session,
        recipient: &EnvelopeAddress,
        command: &SmtpCommand,
    ) -> Option<Response> {
        chain!(self, Hook::RcptTo, session, plugin, view => plugin.on_rcpt_to(&mut view, recipient, command))
    }

    pub(crate) async fn data_start(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::DataStart, session, plugin, view => plugin.on_data_start(&mut view))
    }

    pub(crate) async fn data_end(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::DataEnd, session, plugin, view => plugin.on_data_end(&mut view))
    }

    pub(crate) async fn quit(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::Quit, session, plugin, view => plugin.on_quit(&mut view))
    }

    /// The socket is already gone, so responses are meaningless and ignored.
    pub(crate) async fn close(&self, session: &mut Session) {
        for plugin in self.plugins.iter() {
            let mut view = PluginView::new(session, plugin.plugin_name(), &self.global);

            if let Err(err) = plugin.on_close(&mut view).await {
                internal!(
                    level = ERROR,
                    "Plugin '{}' failed in {}: {}",
                    plugin.plugin_name(),
                    Hook::Close,
                    err
                );
            }
        }
    }

    pub(crate) async fn rset(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::Rset, session, plugin, view => plugin.on_rset(&mut view))
    }

    pub(crate) async fn help(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::Help, session, plugin, view => plugin.on_help(&mut view))
    }

    pub(crate) async fn noop(&self, session: &mut Session) -> Option<Response> {
        chain!(self, Hook::Noop, session, plugin, view => plugin.on_noop(&mut view))
    }

    pub(crate) async fn vrfy(
        &self,
        session: &mut Session,
        command: &SmtpCommand,
    ) -> Option<Response> {
        chain!(self, Hook::Vrfy, session, plugin, view => plugin.on_vrfy(&mut view, command))
    }

    pub(crate) async fn unknown(
        &self,
        session: &mut Session,
        command: &SmtpCommand,
    ) -> Option<Response> {
        chain!(self, Hook::Unknown, session, plugin, view => plugin.on_unknown(&mut view, command))
    }

    /// Awaited before the listener starts accepting; an error fails startup.
    pub(crate) async fn server_start(&self) -> anyhow::Result<()> {
        for plugin in self.plugins.iter() {
            plugin.on_server_start(&self.global).await?;
        }
        Ok(())
    }

    /// Awaited before the server reports itself stopped; errors are logged.
    pub(crate) async fn server_stop(&self) {
        for plugin in self.plugins.iter() {
            if let Err(err) = plugin.on_server_stop(&self.global).await {
                internal!(
                    level = ERROR,
                    "Plugin '{}' failed in {}: {}",
                    plugin.plugin_name(),
                    Hook::ServerStop,
                    err
                );
            }
        }
    }
}
