//! Consumer side: link management, stabilization, scene resolution.

pub mod listen;
pub mod reconnect;
pub mod resolver;
pub mod stabilizer;
