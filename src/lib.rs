pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::{
    proxy::{
        AppContext,
        cache::{ResponseCache, spawn_cache_sweeper},
        handler::ProxyHandler,
        http::client::{Http1Upstream, UpstreamTimeouts},
    },
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let app = build_app_context(settings.clone())?;
    let _sweeper = spawn_cache_sweeper(
        app.handler.cache().clone(),
        settings.cache_sweeper_interval(),
    );
    proxy::run(app).await
}

/// Wires the cache, the upstream client and the handler from `settings`.
pub fn build_app_context(settings: Arc<Settings>) -> Result<AppContext> {
    let cache = Arc::new(ResponseCache::new(settings.cache_timeout()));
    let upstream = Http1Upstream::new(
        build_tls_client_config()?,
        UpstreamTimeouts {
            connect: settings.upstream_connect_timeout(),
            io: settings.upstream_timeout(),
        },
        settings.max_response_header_size,
    );
    let handler = Arc::new(ProxyHandler::new(cache, Arc::new(upstream)));
    Ok(AppContext::new(settings, handler))
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            if added == 0 {
                warn!("no trust anchors loaded from system locations; https upstreams will fail");
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
