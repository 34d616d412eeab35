use std::net::Ipv4Addr;

use anyhow::Result;

/// Returns a port that nothing was listening on a moment ago.
pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
