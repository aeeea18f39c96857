//! # flownet-core
//!
//! Platform-agnostic types for flownet, a threaded readiness-polling socket
//! and resolver core for cooperative hosts.
//!
//! This crate contains no OS-specific code. Threads, descriptors and
//! syscalls live in `flownet-runtime`.
//!
//! ## Modules
//!
//! - `types` - handles, operations, outcomes, states, timeouts
//! - `address` - 6-byte IPv4 socket address encoding
//! - `host` - the `Host` capability trait (completion notification)
//! - `error` - Error types
//! - `kprint` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod types;
pub mod address;
pub mod host;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use types::{
    CompletionIndex, ConnectProgress, Direction, Operation, ResolveOutcome, ResourceHandle,
    ResourceState, Timeout, Transport, WaitOutcome,
};
pub use address::{PeerInfo, SocketAddress};
pub use host::{Host, NullHost};
pub use error::{FlowError, FlowResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_size, env_get_str};
