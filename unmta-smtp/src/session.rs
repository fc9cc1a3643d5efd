use std::{any::Any, sync::Arc};

use ahash::AHashMap;
use unmta_common::address::{EnvelopeAddress, ReversePath};

use crate::{
    phase::{GreetingType, SessionPhase},
    plugin::GlobalContext,
};

type PluginValue = Box<dyn Any + Send + Sync>;

/// Per-connection record of protocol state and plugin-scoped storage.
///
/// Exactly one `Session` exists per TCP connection; it is destroyed when the
/// socket closes. Server-owned fields are read-only to plugins; plugin writes
/// go through [`PluginView`] and land only under the writing plugin's own
/// name.
pub struct Session {
    id: u64,
    active_connections: usize,
    start_time: i64,
    remote_address: String,
    pub(crate) phase: SessionPhase,
    pub(crate) greeting_type: Option<GreetingType>,
    pub(crate) is_secure: bool,
    pub(crate) is_authenticated: bool,
    pub(crate) is_data_mode: bool,
    pub(crate) data: Option<Arc<[u8]>>,
    pub(crate) sender: Option<ReversePath>,
    pub(crate) recipients: Vec<EnvelopeAddress>,
    plugin_data: AHashMap<String, AHashMap<String, PluginValue>>,
}

impl Session {
    pub(crate) fn create(id: u64, active_connections: usize, remote_address: String) -> Self {
        Self {
            id,
            active_connections,
            start_time: chrono::Utc::now().timestamp_millis(),
            remote_address,
            phase: SessionPhase::default(),
            greeting_type: None,
            is_secure: false,
            is_authenticated: false,
            is_data_mode: false,
            data: None,
            sender: None,
            recipients: Vec::new(),
            plugin_data: AHashMap::new(),
        }
    }

    /// Monotonically increasing id, unique for the server's lifetime.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the server's open-connection count at accept time.
    #[must_use]
    pub const fn active_connections(&self) -> usize {
        self.active_connections
    }

    /// Wall-clock millisecond timestamp of accept.
    #[must_use]
    pub const fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Client IP in textual form.
    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Set once by the first HELO/EHLO; survives RSET.
    #[must_use]
    pub const fn greeting_type(&self) -> Option<GreetingType> {
        self.greeting_type
    }

    /// True iff the transport is TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// True iff AUTH succeeded on this connection; survives RSET.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    /// True only while the DATA payload is being consumed.
    #[must_use]
    pub const fn is_data_mode(&self) -> bool {
        self.is_data_mode
    }

    /// The dot-unstuffed, CRLF-preserved DATA payload.
    ///
    /// Present from the end-of-data marker until the end-of-data reply is
    /// written; `None` otherwise.
    #[must_use]
    pub fn data(&self) -> Option<&Arc<[u8]>> {
        self.data.as_ref()
    }

    /// The envelope sender, or `None` before MAIL FROM.
    #[must_use]
    pub const fn sender(&self) -> Option<&ReversePath> {
        self.sender.as_ref()
    }

    /// Accepted recipients in arrival order; duplicates allowed.
    #[must_use]
    pub fn recipients(&self) -> &[EnvelopeAddress] {
        &self.recipients
    }

    /// Read any plugin's stored value. Writing is restricted to the caller's
    /// own namespace via [`PluginView`].
    #[must_use]
    pub fn get_plugin_data<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<&T> {
        self.plugin_data
            .get(plugin)?
            .get(key)?
            .downcast_ref::<T>()
    }

    fn set_plugin_data(&mut self, plugin: &str, key: String, value: PluginValue) {
        self.plugin_data
            .entry(plugin.to_string())
            .or_default()
            .insert(key, value);
    }

    /// Clear the mail transaction. Greeting, authentication and transport
    /// security are untouched.
    pub(crate) fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.data = None;
        self.is_data_mode = false;
    }
}

/// The hook-invocation frame handed to a plugin.
///
/// Carries the invoking plugin's identity so namespace isolation needs no
/// cooperation from the plugin itself: writes land under the dispatcher-
/// supplied name, never one the plugin chose.
pub struct PluginView<'a> {
    session: &'a mut Session,
    plugin_name: &'a str,
    global: &'a GlobalContext,
}

impl<'a> PluginView<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        plugin_name: &'a str,
        global: &'a GlobalContext,
    ) -> Self {
        Self {
            session,
            plugin_name,
            global,
        }
    }

    /// Read-only access to the session record.
    #[must_use]
    pub fn session(&self) -> &Session {
        self.session
    }

    /// The name the dispatcher invoked this plugin under.
    #[must_use]
    pub const fn plugin_name(&self) -> &str {
        self.plugin_name
    }

    /// The process-wide context shared across connections.
    #[must_use]
    pub const fn global(&self) -> &GlobalContext {
        self.global
    }

    /// Store a value under the invoking plugin's own namespace.
    pub fn set_own_plugin_data<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.session
            .set_plugin_data(self.plugin_name, key.into(), Box::new(value));
    }

    /// Read a value from the invoking plugin's own namespace.
    #[must_use]
    pub fn get_own_plugin_data<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.session.get_plugin_data(self.plugin_name, key)
    }

    /// Read a value from any plugin's namespace.
    #[must_use]
    pub fn get_plugin_data<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<&T> {
        self.session.get_plugin_data(plugin, key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn session() -> Session {
        Session::create(1, 1, "127.0.0.1".to_string())
    }

    #[test]
    fn initial_state() {
        let session = session();

        assert_eq!(session.phase(), SessionPhase::Connection);
        assert!(session.greeting_type().is_none());
        assert!(!session.is_secure());
        assert!(!session.is_authenticated());
        assert!(!session.is_data_mode());
        assert!(session.sender().is_none());
        assert!(session.recipients().is_empty());
        assert!(session.data().is_none());
    }

    #[test]
    fn plugin_data_is_namespaced() {
        let mut session = session();
        let global = GlobalContext::default();

        {
            let mut view = PluginView::new(&mut session, "greylist", &global);
            view.set_own_plugin_data("seen", 3_u32);
        }

        {
            let view = PluginView::new(&mut session, "greylist", &global);
            assert_eq!(view.get_own_plugin_data::<u32>("seen"), Some(&3));
        }

        // A different plugin cannot see the value under its own namespace,
        // but can read it explicitly.
        {
            let view = PluginView::new(&mut session, "rate_limit", &global);
            assert_eq!(view.get_own_plugin_data::<u32>("seen"), None);
            assert_eq!(view.get_plugin_data::<u32>("greylist", "seen"), Some(&3));
        }
    }

    #[test]
    fn plugin_data_type_mismatch_is_none() {
        let mut session = session();
        let global = GlobalContext::default();

        let mut view = PluginView::new(&mut session, "greylist", &global);
        view.set_own_plugin_data("seen", 3_u32);
        assert_eq!(view.get_own_plugin_data::<String>("seen"), None);
    }

    #[test]
    fn reset_transaction_preserves_connection_state() {
        let mut session = session();
        session.greeting_type = Some(GreetingType::Ehlo);
        session.is_authenticated = true;
        session.is_secure = true;
        session.sender = Some(ReversePath::Null);
        session
            .recipients
            .push(unmta_common::address::parse_forward_path("<b@y.example>").unwrap());

        session.reset_transaction();

        assert!(session.sender().is_none());
        assert!(session.recipients().is_empty());
        assert_eq!(session.greeting_type(), Some(GreetingType::Ehlo));
        assert!(session.is_authenticated());
        assert!(session.is_secure());
    }
}
