//! Port traits. API boundaries for the hexagon.
//!
//! - Outbound: called by the application into infrastructure.
//! - The viewer is an inbound HTTP adapter and consumes the same ports.

pub mod outbound;
pub mod store;

pub use outbound::{NotifierPort, TgGateway};
pub use store::{StoreFlavor, StorePort};

#[cfg(test)]
pub use outbound::{MockNotifierPort, MockTgGateway};
#[cfg(test)]
pub use store::MockStorePort;
