//! # flownet-runtime
//!
//! OS-facing implementation of flownet.
//!
//! This crate provides:
//! - `ThreadSync` coalescing wake/wait handoff (`sync`)
//! - eventfd-based poll interrupts (`interrupt`)
//! - Per-direction readiness pollers (`poller`)
//! - Blocking resolver workers (`resolver`)
//! - Socket resources and the handle table (`socket`, `registry`)
//! - The `FlowNet` operation surface (`net`)
//! - `CompletionQueue`, a ready-made `Host` (`completion_queue`)

#[cfg(not(unix))]
compile_error!("flownet-runtime supports Unix platforms only");

pub mod config;
pub mod sys;
pub mod interrupt;
pub mod sync;
pub mod poller;
pub mod socket;
pub mod resolver;
pub mod registry;
pub mod net;
pub mod completion_queue;

// Re-exports
pub use config::NetConfig;
pub use sync::{Gate, SyncPort, ThreadSync, Wakeup};
pub use net::FlowNet;
pub use completion_queue::CompletionQueue;
