//! Cross-cutting application concerns: configuration and time handling.

pub mod config;
pub mod time;

pub use config::{AppConfig, PushMode, StoreSelection};
