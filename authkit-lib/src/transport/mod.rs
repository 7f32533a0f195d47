//! Relay transport interface and an in-process relay.

mod memory;
mod traits;

pub use memory::{MemoryRelay, MemoryRelayClient, RelayCall};
pub use traits::{PublishOptions, RelayMessage, RelayTransport};
