//! HTTP request handlers.

pub mod health;
pub mod monitoring;

pub use health::{health_check, readiness_check};
