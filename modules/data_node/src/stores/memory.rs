//! In-memory replica store, used by tests and diskless nodes.
//!
//! Besides the [`ReplicaStore`] operations it offers fault injection
//! (`damage`, `set_length`, `inject_io_errors`) so corruption scenarios can be
//! driven without touching a filesystem.

use dashmap::{mapref::entry::Entry, DashMap};
use palisade_common::{checksum::Checksums, Block, ReplicaState};
use std::io;

use super::{check_replica, ReplicaError, ReplicaInfo, ReplicaStore};

#[derive(Debug, Clone)]
struct MemoryReplica {
    block: Block,
    data: Vec<u8>,
    checksums: Option<Checksums>,
    state: ReplicaState,
    corrupt: bool,
}

impl MemoryReplica {
    fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            block: self.block,
            length: self.data.len() as u64,
            state: self.state,
            corrupt: self.corrupt,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryReplicaStore {
    replicas: DashMap<u64, MemoryReplica>,

    /// Pending injected read failures per block id
    io_faults: DashMap<u64, u32>,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one byte of a replica's data without updating its checksums
    pub fn damage(&self, block_id: u64, offset: usize) -> bool {
        match self.replicas.get_mut(&block_id) {
            Some(mut replica) if offset < replica.data.len() => {
                replica.data[offset] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    /// Truncate or zero-extend a replica's data
    pub fn set_length(&self, block_id: u64, length: usize) -> bool {
        match self.replicas.get_mut(&block_id) {
            Some(mut replica) => {
                replica.data.resize(length, 0);
                true
            }
            None => false,
        }
    }

    /// Make the next `count` raw reads of a block fail with an I/O error
    pub fn inject_io_errors(&self, block_id: u64, count: u32) {
        self.io_faults.insert(block_id, count);
    }

    fn take_io_fault(&self, block: &Block) -> Result<(), ReplicaError> {
        if let Some(mut remaining) = self.io_faults.get_mut(&block.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicaError::Io {
                    block: *block,
                    source: io::Error::other("injected read failure"),
                });
            }
        }
        Ok(())
    }
}

impl ReplicaStore for MemoryReplicaStore {
    fn begin(&self, block: Block) -> Result<(), ReplicaError> {
        let Entry::Vacant(slot) = self.replicas.entry(block.id) else {
            return Err(ReplicaError::AlreadyExists(block));
        };
        slot.insert(MemoryReplica {
            block,
            data: Vec::new(),
            checksums: None,
            state: ReplicaState::BeingWritten,
            corrupt: false,
        });
        Ok(())
    }

    fn append(&self, block: &Block, data: &[u8]) -> Result<u64, ReplicaError> {
        let mut replica = self
            .replicas
            .get_mut(&block.id)
            .filter(|r| r.block == *block)
            .ok_or(ReplicaError::NotFound(*block))?;
        if replica.state == ReplicaState::Finalized {
            return Err(ReplicaError::AlreadyFinalized(*block));
        }
        replica.data.extend_from_slice(data);
        Ok(replica.data.len() as u64)
    }

    fn finalize(
        &self,
        block: &Block,
        bytes_per_checksum: u32,
    ) -> Result<ReplicaInfo, ReplicaError> {
        let mut replica = self
            .replicas
            .get_mut(&block.id)
            .filter(|r| r.block == *block)
            .ok_or(ReplicaError::NotFound(*block))?;
        if replica.state == ReplicaState::Finalized {
            return Err(ReplicaError::AlreadyFinalized(*block));
        }
        replica.checksums = Some(Checksums::compute(&replica.data, bytes_per_checksum));
        replica.state = ReplicaState::Finalized;
        Ok(replica.info())
    }

    fn store_finalized(
        &self,
        block: Block,
        data: &[u8],
        checksums: &Checksums,
    ) -> Result<ReplicaInfo, ReplicaError> {
        check_replica(&block, data, checksums)?;
        let Entry::Vacant(slot) = self.replicas.entry(block.id) else {
            return Err(ReplicaError::AlreadyExists(block));
        };
        let replica = MemoryReplica {
            block,
            data: data.to_vec(),
            checksums: Some(checksums.clone()),
            state: ReplicaState::Finalized,
            corrupt: false,
        };
        let info = replica.info();
        slot.insert(replica);
        Ok(info)
    }

    fn read_raw(&self, block: &Block) -> Result<(Vec<u8>, Checksums), ReplicaError> {
        self.take_io_fault(block)?;
        let replica = self
            .replicas
            .get(&block.id)
            .filter(|r| r.block == *block)
            .ok_or(ReplicaError::NotFound(*block))?;
        match &replica.checksums {
            Some(checksums) => Ok((replica.data.clone(), checksums.clone())),
            None => Err(ReplicaError::NotFinalized(*block)),
        }
    }

    fn info(&self, block_id: u64) -> Option<ReplicaInfo> {
        self.replicas.get(&block_id).map(|r| r.info())
    }

    fn list(&self) -> Vec<ReplicaInfo> {
        let mut replicas: Vec<_> = self.replicas.iter().map(|r| r.info()).collect();
        replicas.sort_by_key(|r| r.block.id);
        replicas
    }

    fn mark_corrupt(&self, block: &Block) -> Result<bool, ReplicaError> {
        let mut replica = self
            .replicas
            .get_mut(&block.id)
            .filter(|r| r.block == *block)
            .ok_or(ReplicaError::NotFound(*block))?;
        let newly = !replica.corrupt;
        replica.corrupt = true;
        Ok(newly)
    }

    fn delete(&self, block: &Block) -> Result<bool, ReplicaError> {
        let removed = self.replicas.remove_if(&block.id, |_, r| r.block == *block).is_some();
        if removed {
            self.io_faults.remove(&block.id);
        }
        Ok(removed)
    }
}
