//! The accept loop.
//!
//! One task per accepted connection. Session ids are handed out strictly in
//! accept order; the active-connection counter moves on accept and on task
//! exit. On shutdown the listening socket closes immediately and open
//! sessions get a grace period before they are force-closed.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast};
use unmta_common::{internal, tracing, Signal};

use crate::{dispatch::Dispatcher, error::ServerError, machine::Machine, server::SmtpRuntime};

pub(crate) struct Listener {
    listener: TcpListener,
    dispatcher: Dispatcher,
    runtime: Arc<SmtpRuntime>,
    graceful_stop: Duration,
    next_session_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl Listener {
    pub(crate) fn create(
        listener: TcpListener,
        dispatcher: Dispatcher,
        runtime: Arc<SmtpRuntime>,
        graceful_stop: Duration,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            runtime,
            graceful_stop,
            next_session_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    // A closed channel means the server handle is gone; stop
                    // too. A lagged receiver only ever missed Shutdown
                    // messages, so the next recv settles it.
                    if matches!(
                        sig,
                        Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)
                    ) {
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = connection?;

                    let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
                    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;

                    tracing::debug!("Connection {} received from {} ({} active)", id, peer, active);

                    let machine = Machine::create(
                        stream,
                        peer.ip().to_string(),
                        id,
                        active,
                        self.dispatcher.clone(),
                        Arc::clone(&self.runtime),
                    );

                    let counter = Arc::clone(&self.active);
                    let signal = shutdown.resubscribe();

                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = machine.run(signal).await {
                            if err.is_client_error() {
                                internal!(level = WARN, "Session {} ended: {}", id, err);
                            } else {
                                internal!(level = ERROR, "Session {} failed: {}", id, err);
                            }
                        }

                        counter.fetch_sub(1, Ordering::SeqCst);
                    }));
                }
            }
        }

        // Stop accepting immediately; let open sessions drain
        drop(self.listener);

        sessions.retain(|handle| !handle.is_finished());
        if !sessions.is_empty() {
            internal!(
                level = INFO,
                "Shutdown requested, draining {} open sessions ...",
                sessions.len()
            );

            if tokio::time::timeout(self.graceful_stop, join_all(sessions.iter_mut()))
                .await
                .is_err()
            {
                internal!(
                    level = WARN,
                    "Graceful stop timed out after {}s, force-closing remaining sessions",
                    self.graceful_stop.as_secs()
                );

                for session in &sessions {
                    session.abort();
                }
            }
        }

        Ok(())
    }
}
