//! Choosing storage nodes for new replicas and excess replicas to remove.

use palisade_common::NodeId;
use std::collections::{BTreeMap, BTreeSet};

use crate::datanodes::{DataNodeDescriptor, DataNodeRegistry};

pub trait PlacementPolicy: Send + Sync {
    /// Pick up to `count` live nodes to receive a replica of `block_bytes`
    /// bytes. Nodes in `exclude` already hold or are receiving the block and
    /// are never chosen; their racks count as already used.
    fn choose_targets(
        &self,
        nodes: &DataNodeRegistry,
        exclude: &BTreeSet<NodeId>,
        count: usize,
        block_bytes: u64,
    ) -> Vec<NodeId>;

    /// Pick one of `replicas` to delete when a block is over-replicated
    fn choose_excess(&self, nodes: &DataNodeRegistry, replicas: &[NodeId]) -> Option<NodeId>;
}

/// Spreads replicas over racks, then prefers free space
#[derive(Debug, Clone, Default)]
pub struct RackAwarePlacement {
    /// Skip nodes with more than twice the average transfer load
    pub consider_load: bool,
}

impl RackAwarePlacement {
    pub fn new(consider_load: bool) -> Self {
        Self { consider_load }
    }

    fn overloaded(&self, nodes: &DataNodeRegistry) -> impl Fn(&DataNodeDescriptor) -> bool {
        let (total, count) = nodes
            .live_nodes()
            .fold((0u64, 0u64), |(total, count), d| (total + d.active_transfers as u64, count + 1));
        let limit = if self.consider_load && count > 0 && total > 0 {
            Some(2.0 * total as f64 / count as f64)
        } else {
            None
        };
        move |d| limit.is_some_and(|limit| d.active_transfers as f64 > limit)
    }
}

impl PlacementPolicy for RackAwarePlacement {
    fn choose_targets(
        &self,
        nodes: &DataNodeRegistry,
        exclude: &BTreeSet<NodeId>,
        count: usize,
        block_bytes: u64,
    ) -> Vec<NodeId> {
        let overloaded = self.overloaded(nodes);
        let mut candidates: Vec<&DataNodeDescriptor> = nodes
            .live_nodes()
            .filter(|d| !exclude.contains(&d.id))
            .filter(|d| d.free_bytes() >= block_bytes.max(1))
            .filter(|d| !overloaded(*d))
            .collect();

        let mut used_racks: BTreeSet<&str> =
            exclude.iter().filter_map(|node| nodes.rack_of(node)).collect();
        let mut chosen = Vec::new();
        while chosen.len() < count && !candidates.is_empty() {
            let best = candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    used_racks
                        .contains(a.rack.as_str())
                        .cmp(&used_racks.contains(b.rack.as_str()))
                        .then_with(|| b.free_bytes().cmp(&a.free_bytes()))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|(index, _)| index);
            let Some(index) = best else {
                break;
            };
            let node = candidates.swap_remove(index);
            used_racks.insert(node.rack.as_str());
            chosen.push(node.id.clone());
        }
        chosen
    }

    fn choose_excess(&self, nodes: &DataNodeRegistry, replicas: &[NodeId]) -> Option<NodeId> {
        let mut per_rack: BTreeMap<&str, usize> = BTreeMap::new();
        for node in replicas {
            *per_rack.entry(nodes.rack_of(node).unwrap_or_default()).or_default() += 1;
        }
        replicas
            .iter()
            .max_by(|a, b| {
                let rack_a = per_rack.get(nodes.rack_of(a).unwrap_or_default()).copied().unwrap_or(0);
                let rack_b = per_rack.get(nodes.rack_of(b).unwrap_or_default()).copied().unwrap_or(0);
                let free_a = nodes.get(a).map(|d| d.free_bytes()).unwrap_or(0);
                let free_b = nodes.get(b).map(|d| d.free_bytes()).unwrap_or(0);
                rack_a.cmp(&rack_b).then_with(|| free_b.cmp(&free_a)).then_with(|| b.cmp(a))
            })
            .cloned()
    }
}
