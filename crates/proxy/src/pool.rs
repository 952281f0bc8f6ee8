//! Snapshot of broker nodes returned by discovery.
//!
//! The pool is an ordered arena of [`BrokerNode`]s addressed by index. Each
//! refresh replaces the whole snapshot; nothing is merged across refreshes.
//! At most one entry is in use at a time, and the pool tracks it by index
//! so there is a single owner of "which node backs the live connection".

use serde::Deserialize;

fn default_usable() -> bool {
    true
}

/// A broker node as reported by a discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerNode {
    /// Address other clients should use to reach the node.
    broadcast_address: String,

    /// TCP port the node accepts producer connections on.
    tcp_port: u16,

    /// Topics the node currently serves.
    #[serde(default)]
    topics: Vec<String>,

    /// Cleared when connecting to or probing the node fails.
    #[serde(skip_deserializing, default = "default_usable")]
    usable: bool,

    /// Set while the node backs the live connection.
    #[serde(skip_deserializing)]
    in_use: bool,
}

impl BrokerNode {
    /// Creates a usable, idle node.
    #[must_use]
    pub fn new<I, S>(broadcast_address: impl Into<String>, tcp_port: u16, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            broadcast_address: broadcast_address.into(),
            tcp_port,
            topics: topics.into_iter().map(Into::into).collect(),
            usable: true,
            in_use: false,
        }
    }

    /// Returns the broadcast address.
    #[must_use]
    pub fn broadcast_address(&self) -> &str {
        &self.broadcast_address
    }

    /// Returns the producer TCP port.
    #[must_use]
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Returns the topics served by this node.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Returns whether the node reported serving `topic`.
    #[must_use]
    pub fn serves(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    /// Returns the `host:port` address used to dial the node.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }

    /// Returns whether the node is still a selection candidate.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Returns whether the node backs the live connection.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }
}

/// Ordered set of broker nodes from the most recent discovery.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<BrokerNode>,
    in_use: Option<usize>,
}

impl NodePool {
    /// Creates a pool from a discovery result.
    ///
    /// Flags are reset: every node starts usable and idle.
    #[must_use]
    pub fn new(nodes: Vec<BrokerNode>) -> Self {
        let mut pool = Self::default();
        pool.replace(nodes);
        pool
    }

    /// Discards the current snapshot and installs `nodes`.
    pub fn replace(&mut self, nodes: Vec<BrokerNode>) {
        self.nodes = nodes
            .into_iter()
            .map(|mut node| {
                node.usable = true;
                node.in_use = false;
                node
            })
            .collect();
        self.in_use = None;
    }

    /// Removes every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.in_use = None;
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the pool holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the node at `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&BrokerNode> {
        self.nodes.get(idx)
    }

    /// Iterates over nodes in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &BrokerNode> {
        self.nodes.iter()
    }

    /// Returns the number of nodes still eligible for selection.
    #[must_use]
    pub fn usable_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.usable).count()
    }

    /// Returns the index of the in-use node, if any.
    #[must_use]
    pub fn in_use(&self) -> Option<usize> {
        self.in_use
    }

    /// Returns the in-use node, if any.
    #[must_use]
    pub fn in_use_node(&self) -> Option<&BrokerNode> {
        self.in_use.and_then(|idx| self.nodes.get(idx))
    }

    /// Returns the first usable node in discovery order.
    ///
    /// In-use state does not affect eligibility. This never connects.
    #[must_use]
    pub fn pick_usable(&self) -> Option<usize> {
        self.nodes.iter().position(|n| n.usable)
    }

    /// Excludes the node at `idx` from selection until the next refresh.
    ///
    /// Marking the in-use node unusable also clears its in-use flag.
    pub fn mark_unusable(&mut self, idx: usize) {
        if let Some(node) = self.nodes.get_mut(idx) {
            node.usable = false;
        }
        if self.in_use == Some(idx) {
            self.mark_idle();
        }
    }

    /// Marks the node at `idx` as backing the live connection.
    ///
    /// Any previously in-use node is returned to idle. Out-of-range indexes
    /// are ignored.
    pub fn mark_in_use(&mut self, idx: usize) {
        if idx >= self.nodes.len() {
            return;
        }
        self.mark_idle();
        self.nodes[idx].in_use = true;
        self.in_use = Some(idx);
    }

    /// Clears the in-use flag.
    pub fn mark_idle(&mut self) {
        if let Some(node) = self.in_use.take().and_then(|idx| self.nodes.get_mut(idx)) {
            node.in_use = false;
        }
    }
}
