//! Notification fabric: publishes ingestion events and delivers them to
//! viewer processes.
//!
//! Transport is picked once at startup from the store flavour: the
//! client/server store uses its native pub/sub channel, the embedded store
//! posts to the viewer's internal webhook.

pub mod pg_listener;
pub mod publisher;
pub mod webpush;

pub use pg_listener::spawn_update_listener;
pub use publisher::{NOTIFY_CHANNEL, make_notifier};
pub use webpush::PushManager;
