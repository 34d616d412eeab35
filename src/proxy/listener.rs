use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::{AppContext, http};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    serve(listener, app).await
}

/// Accepts connections on an already-bound listener, one task per client.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(
        address = %local_addr,
        cache_timeout = %humantime::format_duration(app.handler.cache().timeout()),
        "proxy listener started"
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %format!("{err:#}"), "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    http::handle_http(stream, peer, app).await
}
