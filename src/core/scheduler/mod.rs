// Core scheduler module - announcements, pins and timed moderation jobs.

pub mod scheduler_models;
pub mod scheduler_service;

pub use scheduler_models::*;
pub use scheduler_service::*;
