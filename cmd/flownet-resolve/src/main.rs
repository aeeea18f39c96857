//! flownet Resolve
//!
//! Looks up each argument through a single resolver handle. Arguments
//! that parse as IPv4 addresses are reverse-resolved instead.
//!
//! Usage:
//!     ./target/release/flownet-resolve localhost example.com 127.0.0.1
//!
//! Environment:
//!     FLOW_RESOLVE_TIMEOUT_MS   per-lookup wait (default 5000)
//!     FLOW_LOG_LEVEL            debug shows the resolver thread lifecycle

use flownet_core::{
    env_get, kerror, kprint, kprintln, CompletionIndex, FlowResult, Host, ResolveOutcome,
};
use flownet_runtime::{CompletionQueue, FlowNet, NetConfig};

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const CHANNEL: CompletionIndex = CompletionIndex(1);

fn main() {
    kprint::init();
    let names: Vec<String> = std::env::args().skip(1).collect();
    if names.is_empty() {
        kprintln!("usage: flownet-resolve <host|ipv4>...");
        std::process::exit(2);
    }

    match run(&names) {
        Ok(failures) if failures > 0 => std::process::exit(1),
        Ok(_) => {}
        Err(e) => {
            kerror!("flownet-resolve: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns the number of arguments that did not resolve.
fn run(names: &[String]) -> FlowResult<usize> {
    let timeout = Duration::from_millis(env_get("FLOW_RESOLVE_TIMEOUT_MS", 5000u64));
    let config = NetConfig::from_env();
    let queue = Arc::new(CompletionQueue::from_config(&config));
    let host: Arc<dyn Host> = queue.clone();
    let net = FlowNet::with_config(host, config)?;

    let resolver = net.new_resolver()?;
    net.enable_resolver(resolver)?;
    net.register_resolution_channel(resolver, CHANNEL)?;

    let mut failures = 0;
    for name in names {
        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            match net.reverse_lookup(ip.octets()) {
                Ok(host_name) => println!("{}\t{}", name, host_name),
                Err(e) => {
                    println!("{}\t({})", name, e);
                    failures += 1;
                }
            }
            continue;
        }

        net.resolve(resolver, name)?;
        if !queue.wait_for(CHANNEL, timeout) {
            // The worker may be stuck in the system resolver; closing
            // detaches it and a fresh lookup would need a new handle.
            println!("{}\t(timed out)", name);
            failures += 1;
            break;
        }

        match (net.resolution_outcome(resolver)?, net.resolved_address(resolver)?) {
            (ResolveOutcome::Resolved, Some(ip)) => {
                println!("{}\t{}", name, Ipv4Addr::from(ip));
            }
            _ => {
                println!("{}\t(not found)", name);
                failures += 1;
            }
        }
    }

    net.close_resolver(resolver)?;
    Ok(failures)
}
