mod config;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, info, info_span, warn};

use ircgate_gateway::{Disconnect, Session, serve};
use ircgate_remote::{RemoteState, WebTransport};

use crate::config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ircgate=info,ircgate_gateway=info,ircgate_remote=info".into()),
        )
        .init();

    let config = ServerConfig::try_from(Cli::parse())?;
    let span = info_span!("ircgate", instance = %config.log_suffix);
    run(config).instrument(span).await
}

/// Pause after a failed accept or a failed client setup before serving again.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Serves one client at a time until a signal arrives. Only the signal ends
/// the loop; accept and login failures are logged and retried.
async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("unable to listen on {}", config.listen_addr))?;
    info!("ircgate listening on {}", config.listen_addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Unable to accept a client: {}", e);
                if !pause_before_retry(shutdown.as_mut()).await {
                    return Ok(());
                }
                continue;
            }
        };
        info!("Client connected from {}", peer);

        match serve_client(&config, stream, shutdown.as_mut()).await {
            Ok(Disconnect::Shutdown) => return Ok(()),
            Ok(reason) => info!("Client session ended: {:?}", reason),
            Err(e) => {
                warn!("Client session failed: {:#}", e);
                if !pause_before_retry(shutdown.as_mut()).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Waits [`RETRY_DELAY`]. Returns `false` when shutdown fired first.
async fn pause_before_retry(shutdown: Pin<&mut impl Future<Output = ()>>) -> bool {
    tokio::select! {
        _ = shutdown => false,
        _ = tokio::time::sleep(RETRY_DELAY) => true,
    }
}

async fn serve_client(
    config: &ServerConfig,
    stream: TcpStream,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<Disconnect> {
    let previous = match &config.status_file {
        Some(path) => read_status(path).await,
        None => None,
    };
    let transport = WebTransport::new(config.credentials.clone())?;
    let mut remote = RemoteState::new(Box::new(transport), previous.as_deref());
    remote
        .login()
        .await
        .context("unable to log in to the remote service")?;

    let (reader, writer) = stream.into_split();
    let mut session = Session::new(writer, remote, config.session.clone());
    let result = serve(reader, &mut session, shutdown).await;

    if let Some(path) = &config.status_file {
        write_status(path, session.remote()).await;
    }

    Ok(result.unwrap_or_else(|e| {
        warn!("Client connection failed: {}", e);
        Disconnect::Eof
    }))
}

async fn read_status(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Unable to read status file {}: {}", path.display(), e);
            None
        }
    }
}

async fn write_status(path: &Path, remote: &RemoteState) {
    match tokio::fs::write(path, remote.status_bytes()).await {
        Ok(()) => info!("Status saved to {}", path.display()),
        Err(e) => warn!("Unable to write status file {}: {}", path.display(), e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut sigterm), Ok(mut sighup)) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                _ = sighup.recv() => info!("Received SIGHUP, shutting down..."),
            },
            _ => {
                warn!("Unable to install SIGTERM/SIGHUP handlers, only Ctrl+C stops the server");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use std::future::{pending, ready};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retry_waits_the_full_delay() {
        let shutdown = pending::<()>();
        tokio::pin!(shutdown);
        let started = tokio::time::Instant::now();
        assert!(pause_before_retry(shutdown.as_mut()).await);
        assert_eq!(started.elapsed(), RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_way_to_shutdown() {
        let shutdown = ready(());
        tokio::pin!(shutdown);
        let started = tokio::time::Instant::now();
        assert!(!pause_before_retry(shutdown.as_mut()).await);
        assert!(started.elapsed() < RETRY_DELAY);
    }
}
