// Telegram layer - dispatcher schema, commands and event handlers.
//
// Everything in here talks to the Bot API. Decisions are made by the core
// services; this layer only turns updates into service calls and service
// results into Bot API requests.

#[path = "api.rs"]
pub mod api;
#[path = "permissions.rs"]
pub mod permissions;

#[path = "commands/command_catalog.rs"]
pub mod commands;
#[path = "moderation/message_handler.rs"]
pub mod moderation;

#[path = "admin_panel.rs"]
pub mod admin_panel;
#[path = "background.rs"]
pub mod background;
#[path = "verification.rs"]
pub mod verification;
#[path = "welcome.rs"]
pub mod welcome;

use crate::core::moderation::ModerationService;
use crate::core::scheduler::SchedulerService;
use crate::core::verification::{VerificationService, CAPTCHA_PREFIX, JOIN_PREFIX};
use crate::infra::moderation::SqliteModerationStore;
use crate::infra::scheduler::SqliteJobStore;
use commands::Command;
use permissions::AdminCache;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Shared state handed to every handler.
pub struct Data {
    pub moderation: Arc<ModerationService<SqliteModerationStore>>,
    pub scheduler: Arc<SchedulerService<SqliteJobStore>>,
    pub verification: Arc<VerificationService<SqliteJobStore>>,
    pub admins: AdminCache,
}

/// Routing: join messages greet (or challenge), commands go to the catalog,
/// every other message goes through moderation. Button presses go to the
/// challenge or join request handlers by prefix, the rest to the admin
/// panel. Join requests go to onboarding.
pub fn schema() -> UpdateHandler<Error> {
    let message_handler = Update::filter_message()
        .branch(
            dptree::filter(|msg: Message| msg.new_chat_members().is_some())
                .endpoint(welcome::greet_new_members),
        )
        .branch(
            teloxide::filter_command::<Command, _>().endpoint(commands::handle_command),
        )
        .branch(dptree::endpoint(moderation::handle_group_message));

    let callback_handler = Update::filter_callback_query()
        .branch(
            dptree::filter(|q: CallbackQuery| has_prefix(&q, CAPTCHA_PREFIX))
                .endpoint(verification::handle_captcha_press),
        )
        .branch(
            dptree::filter(|q: CallbackQuery| has_prefix(&q, JOIN_PREFIX))
                .endpoint(verification::handle_join_press),
        )
        .branch(dptree::endpoint(admin_panel::handle_callback));

    dptree::entry()
        .branch(message_handler)
        .branch(callback_handler)
        .branch(Update::filter_chat_join_request().endpoint(verification::handle_join_request))
}

fn has_prefix(q: &CallbackQuery, prefix: &str) -> bool {
    q.data.as_deref().is_some_and(|data| data.starts_with(prefix))
}
