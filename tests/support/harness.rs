use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cacheproxy::{
    build_app_context,
    proxy::{self, cache::ResponseCache},
    settings::Settings,
};

pub fn default_test_settings() -> Settings {
    Settings {
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        cache_timeout: Duration::from_secs(60),
        client_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_timeout: 5,
        max_request_body_size: 64 * 1024,
        cache_sweeper_interval: 0,
        ..Settings::default()
    }
}

pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Arc<ResponseCache>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = default_test_settings();
        configure(&mut settings);
        let listener = TcpListener::bind(settings.listen).await?;
        let addr = listener.local_addr()?;
        settings.listen = addr;
        let settings = Arc::new(settings);

        let app = build_app_context(settings.clone())?;
        let cache = app.handler.cache().clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy serve failed");
            }
        });

        Ok(Self {
            addr,
            settings,
            cache,
            handle,
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
