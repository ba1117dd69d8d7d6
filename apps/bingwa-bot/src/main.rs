use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info, warn};

mod bot;
mod config;
mod error;
mod flow;
mod logging;
mod phone;
mod services;
mod state;
mod webhook;
pub mod models;

use crate::config::BotConfig;
use crate::flow::{ConversationFlow, FlowSettings};
use crate::models::bundle::Catalog;
use crate::services::admin_service::AdminService;
use crate::services::pay_service::PayHeroGateway;
use crate::services::store_service::UserStore;
pub use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = BotConfig::load().context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.log_dir);

    info!("Starting {} v{}...", config::APP_NAME, config::APP_VERSION);
    info!("Config: {:?}", config);
    if config.admin_ids.is_empty() {
        warn!("No admin user ids configured; /admin is disabled");
    }
    if config.payhero.callback_url.is_empty() {
        warn!("PAYHERO_CALLBACK_URL is not set; payments will only settle via status queries");
    } else if config.payhero.callback_token.is_none() {
        warn!("PAYHERO_CALLBACK_TOKEN is not set; the callback endpoint accepts unauthenticated requests");
    }

    let catalog = match &config.catalog_file {
        Some(path) => Catalog::load(path)?,
        None => Catalog::default(),
    };
    info!("Loaded {} bundles", catalog.len());

    let users = UserStore::open(&config.user_data_file).await;
    let gateway = PayHeroGateway::new(config.payhero.clone())
        .context("Failed to build PayHero client")?;
    let admin = AdminService::new(
        config.admin_ids.clone(),
        users.clone(),
        config.broadcast_batch_size,
        config.broadcast_pause(),
    );

    let bot = Bot::new(config.bot_token.clone());
    let notifier = bot::notifier::TelegramNotifier::new(bot.clone());

    let flow = ConversationFlow::new(
        Arc::new(catalog),
        users,
        Arc::new(gateway),
        admin,
        Arc::new(notifier),
        FlowSettings::from_config(&config),
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    tokio::spawn(flow.clone().run_maintenance(SWEEP_INTERVAL, shutdown_tx.subscribe()));

    let webhook_flow = flow.clone();
    let webhook_shutdown = shutdown_tx.subscribe();
    let listen = config.callback_listen;
    let callback_token = config.payhero.callback_token.clone();
    tokio::spawn(async move {
        if let Err(e) = webhook::serve(listen, webhook_flow, callback_token, webhook_shutdown).await {
            error!("Payment callback server failed: {}", e);
        }
    });

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    bot::run_bot(bot, shutdown_tx.subscribe(), flow).await;
    let _ = shutdown_tx.send(());
    info!("{} stopped", config::APP_NAME);
    Ok(())
}
