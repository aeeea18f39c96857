//! Runtime configuration

use flownet_core::env::{env_get, env_get_size, env_get_str};

/// Default capacity of the handle table
pub const DEFAULT_MAX_RESOURCES: usize = 4096;

/// Pollers only run `poll(2)` and a few syscalls.
pub const DEFAULT_POLLER_STACK_SIZE: usize = 128 * 1024;

/// `getaddrinfo` can use a lot of stack (NSS modules).
pub const DEFAULT_RESOLVER_STACK_SIZE: usize = 1024 * 1024;

pub const DEFAULT_COMPLETION_CAPACITY: usize = 1024;

const MIN_STACK_SIZE: usize = 16 * 1024;

/// Configuration for a `FlowNet` instance
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Maximum number of live (non-closed) resources
    pub max_resources: usize,

    /// Stack size for each poller thread
    pub poller_stack_size: usize,

    /// Stack size for each resolver worker
    pub resolver_stack_size: usize,

    /// Thread name prefix, e.g. "flow" gives "flow-rd-3"
    pub thread_prefix: String,

    /// Queue size for `CompletionQueue::from_config`
    pub completion_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_resources: DEFAULT_MAX_RESOURCES,
            poller_stack_size: DEFAULT_POLLER_STACK_SIZE,
            resolver_stack_size: DEFAULT_RESOLVER_STACK_SIZE,
            thread_prefix: "flow".to_string(),
            completion_capacity: DEFAULT_COMPLETION_CAPACITY,
        }
    }
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `FLOW_*` environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FLOW_MAX_RESOURCES` | 4096 |
    /// | `FLOW_POLLER_STACK_SIZE` | 128k |
    /// | `FLOW_RESOLVER_STACK_SIZE` | 1m |
    /// | `FLOW_THREAD_PREFIX` | flow |
    /// | `FLOW_COMPLETION_CAPACITY` | 1024 |
    pub fn from_env() -> Self {
        Self {
            max_resources: env_get("FLOW_MAX_RESOURCES", DEFAULT_MAX_RESOURCES),
            poller_stack_size: env_get_size("FLOW_POLLER_STACK_SIZE", DEFAULT_POLLER_STACK_SIZE),
            resolver_stack_size: env_get_size(
                "FLOW_RESOLVER_STACK_SIZE",
                DEFAULT_RESOLVER_STACK_SIZE,
            ),
            thread_prefix: env_get_str("FLOW_THREAD_PREFIX", "flow"),
            completion_capacity: env_get("FLOW_COMPLETION_CAPACITY", DEFAULT_COMPLETION_CAPACITY),
        }
    }

    pub fn max_resources(mut self, n: usize) -> Self {
        self.max_resources = n;
        self
    }

    pub fn poller_stack_size(mut self, bytes: usize) -> Self {
        self.poller_stack_size = bytes;
        self
    }

    pub fn resolver_stack_size(mut self, bytes: usize) -> Self {
        self.resolver_stack_size = bytes;
        self
    }

    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    pub fn completion_capacity(mut self, n: usize) -> Self {
        self.completion_capacity = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_resources == 0 {
            return Err("max_resources must be at least 1");
        }
        if self.poller_stack_size < MIN_STACK_SIZE {
            return Err("poller_stack_size below 16k");
        }
        if self.resolver_stack_size < MIN_STACK_SIZE {
            return Err("resolver_stack_size below 16k");
        }
        if self.thread_prefix.is_empty() {
            return Err("thread_prefix must not be empty");
        }
        if self.completion_capacity == 0 {
            return Err("completion_capacity must be at least 1");
        }
        Ok(())
    }
}
