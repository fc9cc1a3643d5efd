//! The server: configuration resolution, bind, plugin lifecycle, accept loop.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use unmta_common::{config::Unfig, internal, Signal};

use crate::{
    connection::TlsMaterial,
    dispatch::Dispatcher,
    error::ServerError,
    listener::Listener,
    plugin::{GlobalContext, Plugin, PluginManager, RegistryError},
};

/// The per-connection slice of server configuration, resolved once at bind.
pub(crate) struct SmtpRuntime {
    pub hostname: String,
    pub inactivity_timeout: u64,
    pub max_message_size: usize,
    pub auth_enable: bool,
    pub auth_require_tls: bool,
    pub tls: Option<TlsMaterial>,
}

impl SmtpRuntime {
    fn from_config(config: &Unfig) -> Result<Self, ServerError> {
        let tls = if config.tls.enable_starttls {
            let cert = config
                .tls
                .cert
                .clone()
                .ok_or(ServerError::TlsIncomplete { field: "cert" })?;
            let key = config
                .tls
                .key
                .clone()
                .ok_or(ServerError::TlsIncomplete { field: "key" })?;

            // Missing TLS material is a startup failure, not a runtime one
            for path in [&cert, &key] {
                if !path.is_file() {
                    return Err(ServerError::TlsMaterial {
                        path: path.display().to_string(),
                    });
                }
            }

            Some(TlsMaterial { cert, key })
        } else {
            None
        };

        Ok(Self {
            hostname: config.smtp.hostname.clone(),
            inactivity_timeout: config.smtp.inactivity_timeout,
            max_message_size: config.smtp.max_message_size,
            auth_enable: config.auth.enable,
            auth_require_tls: config.auth.require_tls,
            tls,
        })
    }
}

/// An SMTP receiving server.
///
/// Owns its plugin registry and global context, so several servers can
/// coexist in one process with fully separate state.
pub struct Server {
    config: Unfig,
    plugins: PluginManager,
    global: Arc<GlobalContext>,
}

impl Server {
    #[must_use]
    pub fn new(config: Unfig) -> Self {
        Self {
            config,
            plugins: PluginManager::new(),
            global: Arc::new(GlobalContext::new()),
        }
    }

    /// Register plugins, in invocation order. Expected before the server
    /// starts; the registry is frozen from then on.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on a duplicate plugin name.
    pub fn load_plugins(&mut self, plugins: Vec<Arc<dyn Plugin>>) -> Result<(), RegistryError> {
        self.plugins.load_plugins(plugins)
    }

    /// The context shared by all plugins across all connections.
    #[must_use]
    pub fn global(&self) -> Arc<GlobalContext> {
        Arc::clone(&self.global)
    }

    /// The configuration this server was built from.
    #[must_use]
    pub const fn config(&self) -> &Unfig {
        &self.config
    }

    /// Validate TLS material and bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if TLS is enabled without usable material or the
    /// socket cannot be bound. In both cases no plugin lifecycle hook has
    /// fired yet.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let runtime = SmtpRuntime::from_config(&self.config)?;

        let listen = self.config.smtp.listen.clone();
        let port = self.config.smtp.port;

        let listener = TcpListener::bind((listen.as_str(), port))
            .await
            .map_err(|source| ServerError::BindFailed {
                address: format!("{listen}:{port}"),
                source,
            })?;

        Ok(BoundServer {
            listener,
            runtime: Arc::new(runtime),
            dispatcher: Dispatcher::new(Arc::new(self.plugins), self.global),
            listen,
            port,
            graceful_stop: Duration::from_secs(self.config.smtp.graceful_stop_timeout),
        })
    }

    /// Bind and run until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` on startup failure or a fatal accept-loop error.
    pub async fn serve(
        self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        self.bind().await?.serve(shutdown).await
    }
}

/// A server whose socket is bound but whose accept loop has not started.
pub struct BoundServer {
    listener: TcpListener,
    runtime: Arc<SmtpRuntime>,
    dispatcher: Dispatcher,
    listen: String,
    port: u16,
    graceful_stop: Duration,
}

impl std::fmt::Debug for BoundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundServer")
            .field("listen", &self.listen)
            .field("port", &self.port)
            .field("graceful_stop", &self.graceful_stop)
            .finish_non_exhaustive()
    }
}

impl BoundServer {
    /// The actual bound address (useful when the configured port is 0).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket is gone.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until a shutdown signal arrives, then drain.
    ///
    /// The server-start hooks complete before the first accept; the
    /// server-stop hooks complete before this returns.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if a plugin fails its start hook or the accept
    /// loop dies.
    pub async fn serve(
        self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        self.dispatcher
            .server_start()
            .await
            .map_err(ServerError::PluginStart)?;

        internal!(
            level = INFO,
            "UnMTA SMTP server is running on {}:{}",
            self.listen,
            self.port
        );

        let result = Listener::create(
            self.listener,
            self.dispatcher.clone(),
            self.runtime,
            self.graceful_stop,
        )
        .serve(shutdown)
        .await;

        self.dispatcher.server_stop().await;

        result
    }
}
