use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as the origin received it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone)]
struct Reply {
    status: u16,
    reason: &'static str,
    body: String,
    echo_range: bool,
}

/// Origin server that counts the requests it answers.
pub struct TestOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn ok(body: &str) -> Result<Self> {
        Self::with_status(200, "OK", body).await
    }

    pub async fn with_status(status: u16, reason: &'static str, body: &str) -> Result<Self> {
        Self::spawn(Reply {
            status,
            reason,
            body: body.to_string(),
            echo_range: false,
        })
        .await
    }

    /// Answers 206 with the requested range as the body, or 200 `full` without one.
    pub async fn range_echo() -> Result<Self> {
        Self::spawn(Reply {
            status: 200,
            reason: "OK",
            body: "full".to_string(),
            echo_range: true,
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    async fn spawn(reply: Reply) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task_hits = hits.clone();
        let task_seen = seen.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                let hits = task_hits.clone();
                let seen = task_seen.clone();
                tokio::spawn(async move {
                    let _ = answer(stream, &reply, &hits, &seen).await;
                });
            }
        });
        Ok(Self {
            addr,
            hits,
            seen,
            handle,
        })
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer(
    stream: TcpStream,
    reply: &Reply,
    hits: &AtomicUsize,
    seen: &Mutex<Vec<SeenRequest>>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Err(anyhow!("connection closed before request line"));
    }
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            headers.push((name.to_string(), value.trim().to_string()));
        }
    }
    let mut request = SeenRequest {
        request_line: request_line.trim_end().to_string(),
        body: Vec::new(),
        headers,
    };
    let length = request
        .header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    request.body = vec![0u8; length];
    reader.read_exact(&mut request.body).await?;

    let (status, reason, body_text) = match request.header("range") {
        Some(range) if reply.echo_range => (206, "Partial Content", range.to_string()),
        _ => (reply.status, reply.reason, reply.body.clone()),
    };
    seen.lock().push(request);
    hits.fetch_add(1, Ordering::SeqCst);
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body_text}",
        body_text.len()
    );
    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}
