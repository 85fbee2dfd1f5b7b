//! One-shot NUMA topology discovery.
//!
//! Queried once at startup. The node order is whatever the OS reports — the
//! planner's round-robin cursor cycles through it unchanged. An empty result
//! (single-node machine, or a failed query) permanently disables rebalancing
//! downstream; the engine keeps sampling but never moves anything.

use nbal_core::types::NumaNode;
use tracing::{error, info};

use crate::sys::SystemServices;

/// Discover the machine's NUMA domains through the OS seam.
///
/// Failures are logged and mapped to an empty topology rather than
/// propagated; a balancer without topology is inert, not broken.
pub fn discover<S: SystemServices>(sys: &S) -> Vec<NumaNode> {
    let nodes = match sys.numa_topology() {
        Ok(nodes) => nodes,
        Err(e) => {
            error!("NUMA topology discovery failed: {e}");
            return Vec::new();
        }
    };

    if nodes.is_empty() {
        info!("no NUMA domains reported; rebalancing disabled");
    }
    for node in &nodes {
        info!(
            "numa node {}: group={} mask={:#x}",
            node.node, node.group, node.mask
        );
    }
    nodes
}
