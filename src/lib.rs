pub mod broker;
pub mod client;
pub mod codec;
pub mod connection;
pub mod frame;

#[cfg(test)]
mod tests;

// Re-export codec types for direct access
pub use codec::{CodecError, FrameHeader, FrameType, FILE_CHUNK_SIZE, MAX_BODY_SIZE};

// Re-export the frame type and the main runtime entry points
pub use broker::Broker;
pub use client::{ChatClient, ClientError, ClientResult};
pub use frame::Frame;

/// Error returned by most functions.
///
/// A boxed `std::error::Error` is sufficient for the plumbing between the
/// connection layer and the broker/client cores. Boxing is avoided in the
/// frame-parsing hot path, where a partial frame is an expected runtime
/// condition: `frame::Error` is a custom enum there, and converts into this
/// type only when it represents a real failure.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for parlor operations.
pub type Result<T> = std::result::Result<T, Error>;
