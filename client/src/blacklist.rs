use palisade_common::{LocatedBlock, NodeId};
use std::collections::{BTreeMap, BTreeSet};

/// Replicas this client saw fail a checksum check. They are skipped as read
/// sources until the block manager's view is fetched again with the next
/// locations query, which starts a fresh list.
#[derive(Debug, Default)]
pub struct ReadBlacklist {
    failed: BTreeMap<u64, BTreeSet<NodeId>>,
}

impl ReadBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.failed.clear();
    }

    /// Returns true if the replica was not already listed
    pub fn add(&mut self, block_id: u64, node: &NodeId) -> bool {
        self.failed.entry(block_id).or_default().insert(node.clone())
    }

    pub fn contains(&self, block_id: u64, node: &NodeId) -> bool {
        self.failed.get(&block_id).is_some_and(|nodes| nodes.contains(node))
    }

    pub fn len(&self) -> usize {
        self.failed.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes to try for a block, in the block manager's order
    pub fn candidates(&self, located: &LocatedBlock) -> Vec<NodeId> {
        located
            .readable_locations()
            .into_iter()
            .filter(|node| !self.contains(located.block.id, node))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_common::{Block, ReplicaLocation};

    fn located(corrupt: bool) -> LocatedBlock {
        LocatedBlock {
            block: Block::new(7, 1000),
            offset: 0,
            length: 10,
            locations: ["a", "b", "c"]
                .iter()
                .map(|node| ReplicaLocation {
                    node: NodeId::from(*node),
                    corrupt,
                })
                .collect(),
            corrupt,
        }
    }

    #[test]
    fn failed_replicas_are_skipped() {
        let mut blacklist = ReadBlacklist::new();
        assert!(blacklist.add(7, &NodeId::from("a")));
        assert!(!blacklist.add(7, &NodeId::from("a")));

        let nodes = blacklist.candidates(&located(false));
        assert_eq!(nodes, vec![NodeId::from("b"), NodeId::from("c")]);
    }

    #[test]
    fn corrupt_blocks_still_offer_unlisted_replicas() {
        let mut blacklist = ReadBlacklist::new();
        blacklist.add(7, &NodeId::from("b"));
        let nodes = blacklist.candidates(&located(true));
        assert_eq!(nodes, vec![NodeId::from("a"), NodeId::from("c")]);

        blacklist.clear();
        assert!(blacklist.is_empty());
        assert_eq!(blacklist.candidates(&located(true)).len(), 3);
    }
}
