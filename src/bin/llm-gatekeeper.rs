use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use llm_gatekeeper::gateway::config::{RedisConfig, UpstreamConfig};
use llm_gatekeeper::gateway::{AppContext, GatewayConfig, http, logging};

#[derive(Debug, Parser)]
#[command(name = "llm-gatekeeper", version, about = "Admission-controlling LLM proxy")]
struct Args {
    /// Gateway config (`.toml` or `.json`). Built-in defaults when omitted.
    #[arg(long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "GATEKEEPER_LISTEN")]
    listen: Option<String>,
    #[arg(long, env = "GATEKEEPER_REDIS_URL")]
    redis_url: Option<String>,
    #[arg(long, env = "GATEKEEPER_REDIS_PREFIX")]
    redis_prefix: Option<String>,
    /// Upstream provider base URL, overriding `upstream.base_url`.
    #[arg(long, env = "GATEKEEPER_UPSTREAM_URL")]
    upstream_url: Option<String>,
    #[arg(long, env = "GATEKEEPER_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn apply(self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(url) = self.redis_url {
            let prefix = config.redis.take().map(|redis| redis.prefix);
            let mut redis = RedisConfig::new(url);
            if let Some(prefix) = prefix {
                redis.prefix = prefix;
            }
            config.redis = Some(redis);
        }
        if let (Some(prefix), Some(redis)) = (self.redis_prefix, config.redis.as_mut()) {
            redis.prefix = prefix;
        }
        if let Some(base_url) = self.upstream_url {
            match config.upstream.as_mut() {
                Some(upstream) => upstream.base_url = base_url,
                None => {
                    config.upstream = Some(UpstreamConfig {
                        base_url,
                        api_key: None,
                        headers: Default::default(),
                    })
                }
            }
        }
        config.json_logs |= self.json_logs;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();
    let config = match args.config.take() {
        Some(path) => GatewayConfig::load(&path)?,
        None => GatewayConfig::default(),
    };
    let config = args.apply(config);

    logging::init_tracing(config.json_logs)?;
    tracing::debug!(?config, "loaded config");

    let context = Arc::new(AppContext::from_config(&config)?);
    context.start().await;

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "llm-gatekeeper listening");
    axum::serve(listener, http::router(context.clone()))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    context.shutdown().await;
    Ok(())
}
