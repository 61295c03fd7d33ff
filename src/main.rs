// This is the entry point of the group guard bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (SQLite stores)
// - `telegram/` = Telegram-specific adapters (commands, handlers, loops)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Start the background loops
// 4. Run the dispatcher

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
mod settings;
#[path = "telegram/telegram_layer.rs"]
mod telegram;

use crate::core::moderation::ModerationService;
use crate::core::scheduler::SchedulerService;
use crate::core::verification::VerificationService;
use crate::infra::moderation::SqliteModerationStore;
use crate::infra::scheduler::SqliteJobStore;
use crate::infra::sqlite_pool;
use crate::settings::BotSettings;
use crate::telegram::permissions::AdminCache;
use crate::telegram::{background, Data};
use anyhow::Context;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = BotSettings::from_env().context("Invalid configuration")?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Both stores share one pool; each creates its own tables.

    let pool = sqlite_pool::connect(&settings.database_url)
        .await
        .context("Failed to open the database")?;

    let moderation_store = SqliteModerationStore::new(pool.clone());
    moderation_store
        .migrate()
        .await
        .context("Failed to migrate moderation tables")?;
    let moderation_service = Arc::new(ModerationService::new(moderation_store));

    let job_store = SqliteJobStore::new(pool);
    job_store
        .migrate()
        .await
        .context("Failed to migrate scheduler tables")?;
    let scheduler_service = Arc::new(SchedulerService::new(job_store));
    let verification_service = Arc::new(VerificationService::new(Arc::clone(&scheduler_service)));

    let data = Arc::new(Data {
        moderation: Arc::clone(&moderation_service),
        scheduler: Arc::clone(&scheduler_service),
        verification: Arc::clone(&verification_service),
        admins: AdminCache::new(settings.admin_cache_ttl, settings.owner_ids.iter().copied()),
    });

    // ========================================================================
    // TELEGRAM SETUP
    // ========================================================================

    let bot = Bot::new(&settings.bot_token);
    let me = bot.get_me().await.context("Failed to reach the Bot API")?;
    tracing::info!(username = %me.username(), "🤖 Bot is starting up...");

    if let Err(e) = bot.set_my_commands(telegram::commands::Command::bot_commands()).await {
        tracing::warn!("Failed to register the command list: {}", e);
    }

    background::spawn_scheduler(bot.clone(), Arc::clone(&data), settings.scheduler_tick);
    background::spawn_sweeper(Arc::clone(&data), settings.sweep_interval);

    tracing::info!("🚀 Bot is ready!");
    Dispatcher::builder(bot, telegram::schema())
        .dependencies(dptree::deps![data, me])
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
