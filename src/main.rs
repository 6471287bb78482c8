use std::sync::Arc;

use clap::Parser;
use fabriq_streaming::config::Settings;
use fabriq_streaming::kv::{KvStore, RedisKv};
use fabriq_streaming::create_app;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("FABRIQ").separator("__"))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!(host = %settings.server.host, port = settings.server.port, "configuration loaded");

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&settings.redis.url).await?);
    info!(url = %settings.redis.url, "connected to redis");

    let app = create_app(&settings, kv);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
