use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const READ_TIMEOUT: StdDuration = StdDuration::from_secs(5);

#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Reads one response framed by `Content-Length`, leaving the connection usable for the next.
pub async fn read_response<S>(reader: &mut BufReader<S>) -> Result<TestResponse>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
    if bytes == 0 {
        return Err(anyhow!("connection closed before response status line"));
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
        if n == 0 || line == "\r\n" {
            break;
        }
        let (name, value) = line
            .trim_end()
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line {line:?}"))?;
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.parse::<usize>())
        .transpose()
        .context("invalid Content-Length")?
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    timeout(READ_TIMEOUT, reader.read_exact(&mut body)).await??;

    Ok(TestResponse {
        status,
        headers,
        body: String::from_utf8(body).context("invalid UTF-8 body")?,
    })
}

/// Sends one raw request on a fresh connection and reads a single response.
pub async fn send_request(addr: std::net::SocketAddr, request: &str) -> Result<TestResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut reader = BufReader::new(stream);
    read_response(&mut reader).await
}

pub fn get_request(uri: &str, extra_headers: &str) -> String {
    format!("GET {uri} HTTP/1.1\r\nHost: proxy.test\r\n{extra_headers}Connection: close\r\n\r\n")
}
