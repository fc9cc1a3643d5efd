//! The plugin surface: hook trait, ordered registry and global context.

use std::{any::Any, sync::Arc, sync::RwLock};

use ahash::AHashMap;
use async_trait::async_trait;
use thiserror::Error;
use unmta_common::address::{EnvelopeAddress, ReversePath};

use crate::{
    command::SmtpCommand, phase::GreetingType, response::Response, session::PluginView,
};

/// What one hook handler hands back: `None` to continue the chain, a
/// [`Response`] to short-circuit it. An `Err` is logged and treated as
/// continue; it never reaches the client and never aborts the chain.
pub type HookResult = anyhow::Result<Option<Response>>;

/// A named bundle of hook handlers, registered process-wide and invoked in
/// registration order.
///
/// Every handler has a no-op default, so a plugin implements only the hooks
/// it cares about. Handlers for one session run strictly sequentially;
/// handlers must not spawn background work that mutates session state after
/// returning.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique registry key; also the session plugin-data namespace.
    fn plugin_name(&self) -> &str;

    async fn on_connect(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_helo(
        &self,
        session: &mut PluginView<'_>,
        hostname: &str,
        verb: GreetingType,
    ) -> HookResult {
        let _ = (session, hostname, verb);
        Ok(None)
    }

    /// Credentials arrive base64-decoded, as raw octets.
    async fn on_auth(
        &self,
        session: &mut PluginView<'_>,
        username: &[u8],
        password: &[u8],
    ) -> HookResult {
        let _ = (session, username, password);
        Ok(None)
    }

    async fn on_mail_from(
        &self,
        session: &mut PluginView<'_>,
        sender: &ReversePath,
        command: &SmtpCommand,
    ) -> HookResult {
        let _ = (session, sender, command);
        Ok(None)
    }

    async fn on_rcpt_to(
        &self,
        session: &mut PluginView<'_>,
        recipient: &EnvelopeAddress,
        command: &SmtpCommand,
    ) -> HookResult {
        let _ = (session, recipient, command);
        Ok(None)
    }

    async fn on_data_start(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    /// The payload is available through `session().data()` here.
    async fn on_data_end(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_quit(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    /// Fired once as the socket goes away; any returned response is ignored.
    async fn on_close(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_rset(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_help(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_noop(&self, session: &mut PluginView<'_>) -> HookResult {
        let _ = session;
        Ok(None)
    }

    async fn on_vrfy(&self, session: &mut PluginView<'_>, command: &SmtpCommand) -> HookResult {
        let _ = (session, command);
        Ok(None)
    }

    async fn on_unknown(&self, session: &mut PluginView<'_>, command: &SmtpCommand) -> HookResult {
        let _ = (session, command);
        Ok(None)
    }

    /// Awaited to completion before the server is declared ready. An error
    /// here fails startup.
    async fn on_server_start(&self, global: &GlobalContext) -> anyhow::Result<()> {
        let _ = global;
        Ok(())
    }

    /// Awaited to completion before the server is declared stopped.
    async fn on_server_stop(&self, global: &GlobalContext) -> anyhow::Result<()> {
        let _ = global;
        Ok(())
    }
}

/// Errors raised at plugin registration time.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate plugin name '{0}'")]
    DuplicateName(String),
}

/// The ordered, process-wide plugin registry.
///
/// Registration order is invocation order for every hook. The registry is
/// read-only once the server starts, so the hot path takes no locks.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append plugins in call order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateName` if a plugin's name collides
    /// with one already registered (including earlier entries of the same
    /// call).
    pub fn load_plugins(&mut self, plugins: Vec<Arc<dyn Plugin>>) -> Result<(), RegistryError> {
        for plugin in plugins {
            let name = plugin.plugin_name();
            if self.plugins.iter().any(|p| p.plugin_name() == name) {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
            self.plugins.push(plugin);
        }

        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Process-wide, string-keyed map for values that outlive any single
/// connection (database pools, caches, shared counters).
///
/// Readers and writers may interleave across sessions; there is no guarantee
/// beyond last-write-wins. Owned by the server instance so two servers can
/// coexist in one process with separate contexts.
#[derive(Default)]
pub struct GlobalContext {
    values: RwLock<AHashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl GlobalContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one under the key.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    /// Fetch a value, if present and of the requested type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Remove a value; returns whether the key was present.
    pub fn delete(&self, key: &str) -> bool {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key)
            .is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Plugin for Named {
        fn plugin_name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn registration_preserves_order() {
        let mut manager = PluginManager::new();
        manager
            .load_plugins(vec![Arc::new(Named("alpha")), Arc::new(Named("beta"))])
            .unwrap();
        manager.load_plugins(vec![Arc::new(Named("gamma"))]).unwrap();

        let names: Vec<&str> = manager.iter().map(|p| p.plugin_name()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut manager = PluginManager::new();
        manager.load_plugins(vec![Arc::new(Named("alpha"))]).unwrap();

        let err = manager
            .load_plugins(vec![Arc::new(Named("alpha"))])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "alpha"));
    }

    #[test]
    fn global_context_round_trip() {
        let global = GlobalContext::new();

        global.set("counter", 42_u64);
        assert_eq!(global.get::<u64>("counter").as_deref(), Some(&42));

        // Last write wins
        global.set("counter", 43_u64);
        assert_eq!(global.get::<u64>("counter").as_deref(), Some(&43));

        // Wrong type reads as absent
        assert!(global.get::<String>("counter").is_none());

        assert!(global.delete("counter"));
        assert!(!global.delete("counter"));
        assert!(global.get::<u64>("counter").is_none());
    }
}
