//! Listener for tcp, unix and stdio transports

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{HandlerContext, ProtocolError, handle_connection};
use crate::{Error, Result};

/// Where the server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `tcp://host:port`
    Tcp(String),
    /// `unix:///path/to/socket`
    Unix(PathBuf),
    /// `stdio://`: a single client on stdin/stdout
    Stdio,
}

impl std::str::FromStr for ListenAddr {
    type Err = Error;

    fn from_str(uri: &str) -> Result<Self> {
        let unsupported = || Error::from(ProtocolError::UnsupportedUri(uri.to_string()));
        let url = Url::parse(uri)?;

        match url.scheme() {
            "tcp" => {
                let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(unsupported)?;
                let port = url.port().ok_or_else(unsupported)?;
                Ok(Self::Tcp(format!("{host}:{port}")))
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(unsupported());
                }
                Ok(Self::Unix(PathBuf::from(path)))
            }
            "stdio" => Ok(Self::Stdio),
            _ => Err(unsupported()),
        }
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Stdio => f.write_str("stdio://"),
        }
    }
}

/// Accept clients on `addr` until `shutdown` fires.
///
/// Each connection runs on its own task. On shutdown the listener stops
/// accepting, live requests are cancelled, and connection tasks are awaited.
///
/// # Errors
///
/// Returns error if the listener cannot be bound
pub async fn serve(
    ctx: Arc<HandlerContext>,
    addr: &ListenAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    match addr {
        ListenAddr::Stdio => {
            tracing::info!("serving on stdio");
            handle_connection(ctx, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
        }
        ListenAddr::Tcp(bind) => {
            let listener = TcpListener::bind(bind)
                .await
                .map_err(|e| Error::Config(format!("failed to bind {bind}: {e}")))?;
            tracing::info!(addr = %bind, "listening");

            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let (reader, writer) = stream.into_split();
                            let ctx = Arc::clone(&ctx);
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                tracing::debug!(%peer, "client connected");
                                if let Err(e) = handle_connection(ctx, reader, writer, shutdown).await {
                                    tracing::debug!(%peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
            drain(connections).await;
            Ok(())
        }
        ListenAddr::Unix(path) => serve_unix(ctx, path, shutdown).await,
    }
}

#[cfg(unix)]
async fn serve_unix(
    ctx: Arc<HandlerContext>,
    path: &std::path::Path,
    shutdown: CancellationToken,
) -> Result<()> {
    use tokio::net::UnixListener;

    // Stale socket from a previous run
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| Error::Config(format!("failed to bind {}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let (reader, writer) = stream.into_split();
                    let ctx = Arc::clone(&ctx);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(ctx, reader, writer, shutdown).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drain(connections).await;

    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(error = %e, "could not remove socket");
    }
    Ok(())
}

#[cfg(not(unix))]
async fn serve_unix(
    _ctx: Arc<HandlerContext>,
    path: &std::path::Path,
    _shutdown: CancellationToken,
) -> Result<()> {
    Err(ProtocolError::UnsupportedUri(format!("unix://{}", path.display())).into())
}

async fn drain(mut connections: JoinSet<()>) {
    if !connections.is_empty() {
        tracing::info!(connections = connections.len(), "waiting for connections to close");
    }
    while connections.join_next().await.is_some() {}
}
