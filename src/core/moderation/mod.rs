// Core moderation module - escalation policy, link policy and the service
// that persists their results.

pub mod evaluator;
pub mod link_policy;
pub mod moderation_models;
pub mod moderation_service;

pub use moderation_models::*;
pub use moderation_service::*;
