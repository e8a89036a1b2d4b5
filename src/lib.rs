//! tg-archive: continuous Telegram account mirroring with a read-only web
//! viewer, built hexagonally (ports and adapters).

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
