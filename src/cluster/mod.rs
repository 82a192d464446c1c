//! Cluster bus adapter
//!
//! Publish/subscribe plus request/reply between process replicas. The trait
//! is the seam an external transport plugs into; [`LocalBus`] is the
//! in-process implementation used by tests and single-node deployments, and
//! doubles as a multi-node simulator (each node gets its own
//! [`LocalBus::node`] handle over the shared fabric).
//!
//! Replies travel as handler return values: a subscriber that returns
//! `Some(msg)` answers the request, `None` stays silent.

pub mod rpc;

pub use rpc::{CreationData, ProgressUpdate, RpcMessage};

use crate::error::Result;
use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Delivery options for a publish or request.
#[derive(Debug, Clone, Default)]
pub struct BusOptions {
    /// Skip subscribers registered by the sending node.
    pub external_only: bool,

    /// Resolve a request as soon as the first reply arrives.
    pub first_reply_only: bool,

    /// Known cluster size; a request resolves once this many replies arrive
    /// instead of waiting out the timeout.
    pub cluster_size: Option<usize>,
}

impl BusOptions {
    pub fn external() -> Self {
        Self {
            external_only: true,
            ..Default::default()
        }
    }
}

/// Handler invoked for each delivered message; the return value is the reply.
pub type BusHandler = Arc<dyn Fn(&RpcMessage) -> Option<RpcMessage> + Send + Sync>;

/// Transport between process replicas.
pub trait ClusterBus: Send + Sync {
    /// Fire-and-forget fan-out to every subscriber of `topic`.
    fn publish(&self, topic: &str, msg: RpcMessage, options: &BusOptions) -> Result<()>;

    /// Register `handler` for `topic`.
    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()>;

    /// Fan a message out and gather replies until `timeout`, the configured
    /// cluster size, or (with `first_reply_only`) the first answer.
    fn request(
        &self,
        topic: &str,
        msg: RpcMessage,
        timeout: Duration,
        options: &BusOptions,
    ) -> Result<Vec<RpcMessage>>;

    /// Name of the node this handle publishes as.
    fn node_id(&self) -> &str;
}

struct Subscription {
    node: String,
    handler: BusHandler,
}

#[derive(Default)]
struct Fabric {
    subs: RwLock<HashMap<String, Vec<Subscription>>>,
}

/// In-process bus. Cheap to clone handles off of via [`LocalBus::node`].
pub struct LocalBus {
    fabric: Arc<Fabric>,
    node: String,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric::default()),
            node: "local".to_string(),
        }
    }

    /// A handle over the same fabric that publishes as `node`. Used to stand
    /// up multiple simulated nodes in one process.
    pub fn node(&self, node: impl Into<String>) -> Self {
        Self {
            fabric: Arc::clone(&self.fabric),
            node: node.into(),
        }
    }

    fn deliver(
        &self,
        topic: &str,
        msg: &RpcMessage,
        options: &BusOptions,
        mut on_reply: impl FnMut(RpcMessage) -> bool,
    ) {
        let subs = self.fabric.subs.read();
        let Some(list) = subs.get(topic) else {
            return;
        };
        for sub in list {
            if options.external_only && sub.node == self.node {
                continue;
            }
            if let Some(reply) = (sub.handler)(msg) {
                if on_reply(reply) {
                    return;
                }
            }
        }
    }
}

impl ClusterBus for LocalBus {
    fn publish(&self, topic: &str, msg: RpcMessage, options: &BusOptions) -> Result<()> {
        self.deliver(topic, &msg, options, |_| false);
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()> {
        self.fabric
            .subs
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                node: self.node.clone(),
                handler,
            });
        Ok(())
    }

    fn request(
        &self,
        topic: &str,
        msg: RpcMessage,
        _timeout: Duration,
        options: &BusOptions,
    ) -> Result<Vec<RpcMessage>> {
        // In-process delivery is synchronous, so the timeout cannot expire
        // here; it bounds real transports behind the same trait.
        let mut replies = Vec::new();
        let wanted = if options.first_reply_only {
            Some(1)
        } else {
            options.cluster_size
        };
        self.deliver(topic, &msg, options, |reply| {
            replies.push(reply);
            matches!(wanted, Some(n) if replies.len() >= n)
        });
        Ok(replies)
    }

    fn node_id(&self) -> &str {
        &self.node
    }
}
