//! Broker-side components: the dual-endpoint listener, the room that owns
//! membership and transfer coordination, and the per-participant sessions.

pub mod listener;
pub mod room;
pub mod session;

pub use listener::Broker;
pub use room::{Room, SessionId};
