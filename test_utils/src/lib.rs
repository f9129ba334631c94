//! Test helpers for Palisade: an in-process cluster made of the real block
//! manager state and real data nodes, and a client transport into it

pub mod sim;
pub mod transport;

pub use sim::{node_id, SimCluster, SimOptions};
pub use transport::SimHandle;

/// Deterministic test payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}
