//! WebSocket connection lifecycle and fan-out bookkeeping.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod upgrade;
