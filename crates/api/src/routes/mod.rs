//! API route handlers

pub mod health;
pub mod intents;
pub mod status;
