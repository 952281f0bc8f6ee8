//! Proptest strategies for nsq-proxy domain types.
//!
//! Strategies produce well-formed topics, payloads, and broker nodes while
//! exploring edge cases through random variation.
//!
//! # Usage
//!
//! ```no_run
//! use nsq_proxy::is_valid_topic_name;
//! use nsq_proxy_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn generated_topics_are_valid(topic in strategies::arb_topic()) {
//!         prop_assert!(is_valid_topic_name(&topic));
//!     }
//! }
//! ```

use nsq_proxy::{BrokerNode, NodePool};
use proptest::prelude::*;

/// Generates a plain topic name of 1-64 characters from `[.a-zA-Z0-9_-]`.
pub fn arb_topic() -> impl Strategy<Value = String> {
    "[.a-zA-Z0-9_-]{1,64}"
}

/// Generates an ephemeral topic name: 1-54 topic characters plus `#ephemeral`.
pub fn arb_ephemeral_topic() -> impl Strategy<Value = String> {
    "[.a-zA-Z0-9_-]{1,54}".prop_map(|base| format!("{base}#ephemeral"))
}

/// Generates a topic name that nsqd would reject.
///
/// Covers the empty name, names over 64 characters, and names containing a
/// character outside the topic alphabet.
pub fn arb_invalid_topic() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[a-z]{65,80}",
        ("[a-z]{0,10}", "[ /:*?@!%$]", "[a-z]{0,10}")
            .prop_map(|(head, bad, tail)| format!("{head}{bad}{tail}")),
    ]
}

/// Generates a message body of 0-255 random bytes.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

/// Generates an `MPUB` batch of 1-16 message bodies.
pub fn arb_batch() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(arb_payload(), 1..16)
}

/// Generates a private IPv4 broadcast address in `10.0.0.0/16`.
pub fn arb_broadcast_address() -> impl Strategy<Value = String> {
    (0u8..=255, 1u8..=254).prop_map(|(c, d)| format!("10.0.{c}.{d}"))
}

/// Generates a usable, idle [`BrokerNode`] serving 0-4 topics.
pub fn arb_broker_node() -> impl Strategy<Value = BrokerNode> {
    (arb_broadcast_address(), 1024u16..=u16::MAX, proptest::collection::vec(arb_topic(), 0..4))
        .prop_map(|(address, port, topics)| BrokerNode::new(address, port, topics))
}

/// Generates a [`NodePool`] of 0-8 nodes.
pub fn arb_node_pool() -> impl Strategy<Value = NodePool> {
    proptest::collection::vec(arb_broker_node(), 0..8).prop_map(NodePool::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use nsq_proxy::is_valid_topic_name;

    use super::*;

    proptest! {
        #[test]
        fn strategy_produces_valid_topics(topic in arb_topic()) {
            prop_assert!(is_valid_topic_name(&topic));
        }

        #[test]
        fn strategy_produces_valid_ephemeral_topics(topic in arb_ephemeral_topic()) {
            prop_assert!(topic.len() <= 64);
            prop_assert!(is_valid_topic_name(&topic));
        }

        #[test]
        fn strategy_produces_invalid_topics(topic in arb_invalid_topic()) {
            prop_assert!(!is_valid_topic_name(&topic));
        }

        #[test]
        fn strategy_produces_fresh_nodes(node in arb_broker_node()) {
            prop_assert!(node.is_usable());
            prop_assert!(!node.is_in_use());
            prop_assert!(node.tcp_port() >= 1024);
            prop_assert!(node.address().starts_with("10.0."));
        }

        #[test]
        fn strategy_produces_idle_pools(pool in arb_node_pool()) {
            prop_assert_eq!(pool.in_use(), None);
            prop_assert_eq!(pool.usable_count(), pool.len());
        }

        #[test]
        fn strategy_produces_non_empty_batches(batch in arb_batch()) {
            prop_assert!(!batch.is_empty());
        }
    }
}
