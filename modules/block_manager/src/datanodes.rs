//! Registry of storage nodes known to the coordinator, fed by heartbeats.

use palisade_common::{messages::HeartbeatMessage, NodeId};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Rack assigned to nodes seen before their first heartbeat
pub const DEFAULT_RACK: &str = "/default-rack";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNodeDescriptor {
    pub id: NodeId,
    pub rack: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub active_transfers: u32,

    /// Milliseconds since the epoch
    pub last_heartbeat: u64,

    pub alive: bool,
}

impl DataNodeDescriptor {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Registered,
    /// Node had been declared dead; it must resend its block report
    Revived,
    Updated,
}

#[derive(Debug)]
pub struct DataNodeRegistry {
    nodes: BTreeMap<NodeId, DataNodeDescriptor>,
    expiry_ms: u64,
}

impl DataNodeRegistry {
    pub fn new(expiry_ms: u64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            expiry_ms,
        }
    }

    pub fn heartbeat(&mut self, heartbeat: &HeartbeatMessage, now: u64) -> HeartbeatOutcome {
        let descriptor = DataNodeDescriptor {
            id: heartbeat.node.clone(),
            rack: heartbeat.rack.clone(),
            capacity_bytes: heartbeat.capacity_bytes,
            used_bytes: heartbeat.used_bytes,
            active_transfers: heartbeat.active_transfers,
            last_heartbeat: now,
            alive: true,
        };
        match self.nodes.insert(heartbeat.node.clone(), descriptor) {
            None => {
                info!(node = %heartbeat.node, rack = heartbeat.rack, "Storage node registered");
                HeartbeatOutcome::Registered
            }
            Some(previous) if !previous.alive => {
                info!(node = %heartbeat.node, "Storage node is back");
                HeartbeatOutcome::Revived
            }
            Some(_) => HeartbeatOutcome::Updated,
        }
    }

    /// Any message from a node counts as a sign of life. Nodes not yet
    /// registered are added with unknown capacity until they heartbeat.
    pub fn touch(&mut self, node: &NodeId, now: u64) {
        let descriptor = self.nodes.entry(node.clone()).or_insert_with(|| DataNodeDescriptor {
            id: node.clone(),
            rack: DEFAULT_RACK.to_string(),
            capacity_bytes: 0,
            used_bytes: 0,
            active_transfers: 0,
            last_heartbeat: now,
            alive: true,
        });
        if descriptor.alive {
            descriptor.last_heartbeat = descriptor.last_heartbeat.max(now);
        }
    }

    /// Declare silent nodes dead, returning the newly dead
    pub fn expire(&mut self, now: u64) -> Vec<NodeId> {
        let mut dead = Vec::new();
        for descriptor in self.nodes.values_mut() {
            if descriptor.alive && now.saturating_sub(descriptor.last_heartbeat) > self.expiry_ms {
                warn!(node = %descriptor.id, last_heartbeat = descriptor.last_heartbeat, "Storage node declared dead");
                descriptor.alive = false;
                dead.push(descriptor.id.clone());
            }
        }
        dead
    }

    pub fn get(&self, node: &NodeId) -> Option<&DataNodeDescriptor> {
        self.nodes.get(node)
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.nodes.get(node).is_some_and(|d| d.alive)
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &DataNodeDescriptor> {
        self.nodes.values().filter(|d| d.alive)
    }

    pub fn live_count(&self) -> usize {
        self.live_nodes().count()
    }

    pub fn dead_count(&self) -> usize {
        self.nodes.len() - self.live_count()
    }

    pub fn rack_of(&self, node: &NodeId) -> Option<&str> {
        self.nodes.get(node).map(|d| d.rack.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(node: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            node: NodeId::from(node),
            rack: "/r1".to_string(),
            capacity_bytes: 1000,
            used_bytes: 400,
            active_transfers: 0,
        }
    }

    #[test]
    fn heartbeat_registers_and_updates() {
        let mut registry = DataNodeRegistry::new(10_000);
        assert_eq!(registry.heartbeat(&heartbeat("dn-1"), 0), HeartbeatOutcome::Registered);
        assert_eq!(registry.heartbeat(&heartbeat("dn-1"), 1_000), HeartbeatOutcome::Updated);
        let node = registry.get(&NodeId::from("dn-1")).unwrap();
        assert_eq!(node.free_bytes(), 600);
        assert_eq!(node.last_heartbeat, 1_000);
    }

    #[test]
    fn silent_node_expires_and_revives() {
        let mut registry = DataNodeRegistry::new(10_000);
        registry.heartbeat(&heartbeat("dn-1"), 0);
        registry.heartbeat(&heartbeat("dn-2"), 5_000);

        assert!(registry.expire(10_000).is_empty());
        assert_eq!(registry.expire(10_001), vec![NodeId::from("dn-1")]);
        assert!(registry.expire(10_002).is_empty());
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.dead_count(), 1);

        // Other traffic does not revive a dead node
        registry.touch(&NodeId::from("dn-1"), 11_000);
        assert!(!registry.is_alive(&NodeId::from("dn-1")));

        assert_eq!(registry.heartbeat(&heartbeat("dn-1"), 12_000), HeartbeatOutcome::Revived);
        assert!(registry.is_alive(&NodeId::from("dn-1")));
    }

    #[test]
    fn touch_registers_unknown_node() {
        let mut registry = DataNodeRegistry::new(10_000);
        registry.touch(&NodeId::from("dn-9"), 0);
        assert_eq!(registry.rack_of(&NodeId::from("dn-9")), Some(DEFAULT_RACK));
        assert_eq!(registry.get(&NodeId::from("dn-9")).unwrap().free_bytes(), 0);
    }
}
