mod body;
pub mod client;
mod codec;
mod dispatch;
mod respond;

use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::trace;

use crate::proxy::AppContext;

pub(crate) use codec::read_line_with_deadline;
use respond::shutdown_stream;

/// Serves one plain-HTTP client connection to completion.
pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let result = dispatch::serve_http_loop(&mut reader, peer, &app).await;
    if let Err(err) = shutdown_stream(reader.get_mut(), app.settings.client_timeout()).await {
        trace!(peer = %peer, error = %err, "failed to shut down client stream");
    }
    result
}
