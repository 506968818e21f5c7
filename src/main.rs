mod channel;
mod config;
mod crypto;
mod error;
mod groups;
mod headers;
mod http_client;
mod keypool;
mod logging;
mod server;

use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> crate::error::Result<()> {
    // Local development: load `.env` without panicking (no-op if missing).
    dotenvy::dotenv().ok();

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = config::Settings::load()?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let app = server::create_app(settings).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("keygate proxy listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
