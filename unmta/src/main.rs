use std::sync::Arc;

use tokio::sync::broadcast;
use unmta::plugins::EmployeeDirectory;
use unmta_common::{config::Unfig, internal, logging, Signal};
use unmta_smtp::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "unmta.config.toml".to_string());

    let config = Unfig::load(&path)?;
    let level = config.log.level;

    logging::init(level);
    internal!(level = INFO, "Unfig (config) loaded");
    internal!(level = INFO, "Logger initialized. Level: '{}'", level);

    let mut server = Server::new(config);

    // Bundled plugins register themselves when their section is configured
    let directory = server.config().plugin_config("employee_directory")?;
    if !directory.is_empty() {
        server.load_plugins(vec![Arc::new(EmployeeDirectory::from_config(&directory))])?;
    }

    let (sender, receiver) = broadcast::channel(16);
    tokio::spawn(shutdown(sender));

    server.serve(receiver).await?;

    internal!(level = INFO, "Shutting down ...");

    Ok(())
}

/// Translate CTRL+C / SIGTERM into the shutdown broadcast.
async fn shutdown(sender: broadcast::Sender<Signal>) -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C received, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    sender.send(Signal::Shutdown)?;

    Ok(())
}
