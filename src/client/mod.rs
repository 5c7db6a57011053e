// ABOUTME: Terminal client module wiring the connect handshake, input dispatch and file engine
// ABOUTME: Exports all client components including the core client, transfer queue and error types

//! Terminal client: the connect handshake and input dispatch live in
//! `core`, the file-socket engine in `transfer`, error types in `error`.

pub mod core;
pub mod error;
pub mod transfer;

// Re-export the main types for easy access
pub use self::core::ChatClient;
pub use error::{ClientError, ClientResult};
pub use transfer::{FileOp, TransferQueue};
