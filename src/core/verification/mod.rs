// Core verification module - join challenges and join request onboarding.

pub mod challenge;
pub mod onboarding;
pub mod verification_service;

pub use challenge::*;
pub use onboarding::*;
pub use verification_service::*;
