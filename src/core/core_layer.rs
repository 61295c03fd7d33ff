// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "duration/duration_parser.rs"]
pub mod duration;

#[path = "moderation/mod.rs"]
pub mod moderation;

#[path = "scheduler/mod.rs"]
pub mod scheduler;

#[path = "verification/mod.rs"]
pub mod verification;
