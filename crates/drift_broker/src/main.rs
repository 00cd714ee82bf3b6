use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use drift_broker::geoip::{GeoIpTable, Geolocator, NullGeolocator};
use drift_broker::{build_router, tls, AppState, BrokerConfig, Matcher, Metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BrokerConfig::load(Path::new("broker.toml"))?;
    config.validate()?;

    tracing::info!("Driftway broker starting...");
    tracing::info!("listen   = {}", config.listen);
    tracing::info!("tls      = {}", if config.disable_tls { "disabled" } else { "enabled" });

    let geo: Arc<dyn Geolocator> =
        if config.geoip_database.is_some() || config.geoip6_database.is_some() {
            Arc::new(
                GeoIpTable::load(
                    config.geoip_database.as_deref(),
                    config.geoip6_database.as_deref(),
                )
                .context("load geoip databases")?,
            )
        } else {
            tracing::warn!("no geoip databases configured, country stats will be empty");
            Arc::new(NullGeolocator)
        };

    let metrics = Arc::new(Metrics::with_interval(geo, config.metrics_interval()));
    metrics.clone().spawn_rollover(config.metrics_log.clone());

    let matcher = Arc::new(Matcher::new());
    let state = Arc::new(AppState {
        matcher: matcher.clone(),
        metrics,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind to {}", config.listen))?;
    tracing::info!("listening on {}", config.listen);

    let result = if config.disable_tls {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("serve")
    } else {
        tracing::info!("ACME hostnames: {:?}", config.acme_hostname_list());
        if let Some(email) = &config.acme_email {
            tracing::info!("ACME contact: {email}");
        }
        let cert = config.tls_cert.as_deref().context("tls_cert is required")?;
        let key = config.tls_key.as_deref().context("tls_key is required")?;
        let tls_config = tls::load_server_config(cert, key)?;
        tls::serve(listener, Arc::new(tls_config), app).await
    };

    matcher.shutdown();
    result
}
