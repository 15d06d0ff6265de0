//! Hub side: presence, heartbeats, and state fan-out.

pub mod broadcaster;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod server;
