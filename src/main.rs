mod bot;
mod config;
mod llm;
mod media;
mod platform;
mod sessions;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::Bot;
use crate::config::Config;
use crate::llm::GeminiModel;
use crate::platform::whatsapp::{self, EvolutionClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up API keys from .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xenovia=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.gemini.model);
    info!("  Max output tokens: {}", config.gemini.max_output_tokens);
    info!(
        "  WhatsApp bridge: {} (instance {})",
        config.whatsapp.api_url, config.whatsapp.instance_name
    );
    if config.whatsapp.webhook_secret.is_none() {
        warn!("  Webhook secret not set, accepting unauthenticated webhook calls");
    }
    info!("  Ignore groups: {}", config.reply.ignore_groups);
    info!("  Empty responses: {}", config.reply.empty_response);

    let bridge = Arc::new(EvolutionClient::new(config.whatsapp.clone()));
    let model = Arc::new(GeminiModel::new(config.gemini.clone()));
    let bot = Arc::new(Bot::new(model, bridge.clone(), config.reply.clone()));

    platform::pairing::start(&bridge, &config.whatsapp.qr_code_path).await;

    info!("Bot is starting...");
    whatsapp::serve(bot, &config.whatsapp, &config.server).await?;

    Ok(())
}
