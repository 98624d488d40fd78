//! Hash partitioning of aggregates across downstream nodes.
//!
//! Key values are hashed and reduced modulo the node count. This is plain
//! `hash(keys) mod N`, not a consistent-hash ring: changing the number of
//! nodes reshuffles most keys.

use crate::aggregation::AggregationRecord;
use crate::error::{Result, RollupError};
use sha2::{Digest, Sha256};

/// A downstream node as seen by the router.
pub trait Node {
    fn address(&self) -> &str;

    /// Whether the node should currently receive traffic.
    fn available(&self) -> bool;
}

/// Assigns key values to a slot in `[0, node_count)`.
pub fn compute_partition_id<S: AsRef<str>>(key_values: &[S], node_count: usize) -> usize {
    if node_count <= 1 {
        return 0;
    }
    let mut hasher = Sha256::new();
    for (i, value) in key_values.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(value.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % node_count as u64) as usize
}

/// Picks a live node for `partition_id`.
///
/// Probing starts at `nodes[partition_id]` and walks towards lower indices,
/// wrapping around, until a node reports itself available. Every node is
/// tried at most once.
pub fn select_node<N: Node>(partition_id: usize, nodes: &[N]) -> Result<&N> {
    let len = nodes.len();
    if len == 0 {
        return Err(RollupError::NoAvailableNodes);
    }
    let mut index = partition_id % len;
    for _ in 0..len {
        let node = &nodes[index];
        if node.available() {
            return Ok(node);
        }
        index = (index + len - 1) % len;
    }
    Err(RollupError::NoAvailableNodes)
}

/// Routes records to a fixed, address-ordered list of nodes.
#[derive(Debug)]
pub struct PartitionRouter<N> {
    nodes: Vec<N>,
}

impl<N: Node> PartitionRouter<N> {
    /// Nodes are sorted by address so every producer sees the same order.
    pub fn new(mut nodes: Vec<N>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(RollupError::invalid_config("at least one forward node is required"));
        }
        nodes.sort_by(|a, b| a.address().cmp(b.address()));
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn partition_for(&self, record: &AggregationRecord) -> usize {
        compute_partition_id(record.key_values().as_slice(), self.nodes.len())
    }

    pub fn select(&self, partition_id: usize) -> Result<&N> {
        select_node(partition_id, &self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeNode {
        address: String,
        up: bool,
        probes: RefCell<Vec<String>>,
    }

    impl FakeNode {
        fn new(address: &str, up: bool) -> Self {
            Self {
                address: address.to_string(),
                up,
                probes: RefCell::new(Vec::new()),
            }
        }
    }

    impl Node for FakeNode {
        fn address(&self) -> &str {
            &self.address
        }

        fn available(&self) -> bool {
            self.probes.borrow_mut().push(self.address.clone());
            self.up
        }
    }

    #[test]
    fn test_partition_id_is_stable_and_in_range() {
        for n in 1..8 {
            let a = compute_partition_id(&["host-a", "GET"], n);
            let b = compute_partition_id(&["host-a", "GET"], n);
            assert_eq!(a, b);
            assert!(a < n);
        }
    }

    #[test]
    fn test_partition_ids_spread_over_nodes() {
        let mut seen = [false; 4];
        for i in 0..200 {
            seen[compute_partition_id(&[format!("host-{}", i)], 4)] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_select_node_prefers_partition_slot() {
        let nodes = vec![FakeNode::new("a", true), FakeNode::new("b", true), FakeNode::new("c", true)];
        assert_eq!(select_node(1, &nodes).unwrap().address(), "b");
    }

    #[test]
    fn test_select_node_probes_downwards_with_wraparound() {
        let nodes = vec![FakeNode::new("a", false), FakeNode::new("b", false), FakeNode::new("c", true)];
        let chosen = select_node(1, &nodes).unwrap();
        assert_eq!(chosen.address(), "c");
        // b, then a, then wrap to c
        assert_eq!(*nodes[1].probes.borrow(), vec!["b".to_string()]);
        assert_eq!(*nodes[0].probes.borrow(), vec!["a".to_string()]);
        assert_eq!(*nodes[2].probes.borrow(), vec!["c".to_string()]);
    }

    #[test]
    fn test_no_available_nodes_after_trying_each_once() {
        let nodes = vec![FakeNode::new("a", false), FakeNode::new("b", false), FakeNode::new("c", false)];
        assert!(matches!(select_node(2, &nodes), Err(RollupError::NoAvailableNodes)));
        for node in &nodes {
            assert_eq!(node.probes.borrow().len(), 1);
        }

        let empty: Vec<FakeNode> = Vec::new();
        assert!(matches!(select_node(0, &empty), Err(RollupError::NoAvailableNodes)));
    }

    #[test]
    fn test_router_sorts_nodes_and_rejects_empty() {
        let router = PartitionRouter::new(vec![FakeNode::new("z:1", true), FakeNode::new("a:1", true)]).unwrap();
        assert_eq!(router.nodes()[0].address(), "a:1");
        assert_eq!(router.len(), 2);

        assert!(matches!(
            PartitionRouter::<FakeNode>::new(Vec::new()),
            Err(RollupError::InvalidConfig(_))
        ));
    }
}
