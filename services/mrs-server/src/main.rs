//! MRS Server entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mrs_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let settings = mrs_server::Settings::from_env()?;
    tracing::info!("Starting MRS server at {}", settings.server_url);

    mrs_server::run(settings).await?;

    Ok(())
}
