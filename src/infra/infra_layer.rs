// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "sqlite_pool.rs"]
pub mod sqlite_pool;

#[path = "moderation/sqlite_moderation_store.rs"]
pub mod moderation;

#[path = "scheduler/sqlite_job_store.rs"]
pub mod scheduler;
