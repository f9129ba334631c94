//! Filesystem replica store.
//!
//! Layout under the data directory:
//!
//! ```text
//! rbw/blk_<id>_<gs>              replicas being written
//! finalized/blk_<id>_<gs>        finalized replica data
//! finalized/blk_<id>_<gs>.meta   stored checksums (JSON)
//! ```
//!
//! The index is rebuilt by scanning both directories on open, so a restarted
//! node reports whatever is actually on disk. Corrupt flags are held in memory
//! only; after a restart the verifier rediscovers them.

use dashmap::{mapref::entry::Entry, DashMap};
use palisade_common::{checksum::Checksums, Block, ReplicaState};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{check_replica, ReplicaError, ReplicaInfo, ReplicaStore};

const RBW_DIR: &str = "rbw";
const FINALIZED_DIR: &str = "finalized";
const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone)]
struct DiskReplica {
    block: Block,
    state: ReplicaState,
    corrupt: bool,

    /// Data file length as of the last successful write or stat
    length: u64,
}

#[derive(Debug)]
pub struct DiskReplicaStore {
    root: PathBuf,
    index: DashMap<u64, DiskReplica>,
}

impl DiskReplicaStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(RBW_DIR))?;
        fs::create_dir_all(root.join(FINALIZED_DIR))?;

        let store = Self {
            root,
            index: DashMap::new(),
        };
        store.load(RBW_DIR, ReplicaState::BeingWritten)?;
        store.load(FINALIZED_DIR, ReplicaState::Finalized)?;
        info!(
            "Opened replica store at {} with {} replicas",
            store.root.display(),
            store.index.len()
        );
        Ok(store)
    }

    fn load(&self, dir: &str, state: ReplicaState) -> io::Result<()> {
        for entry in fs::read_dir(self.root.join(dir))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == META_EXTENSION) {
                continue;
            }
            let Some(block) = path.file_name().and_then(|n| n.to_str()).and_then(parse_file_name)
            else {
                warn!("Ignoring unexpected file {}", path.display());
                continue;
            };
            if state == ReplicaState::Finalized && !meta_path(&path).exists() {
                warn!("Finalized replica {block} has no checksum file, ignoring");
                continue;
            }
            let length = fs::metadata(&path)?.len();
            self.index.insert(
                block.id,
                DiskReplica {
                    block,
                    state,
                    corrupt: false,
                    length,
                },
            );
        }
        Ok(())
    }

    /// Path of a replica's data file
    pub fn replica_path(&self, block: &Block, state: ReplicaState) -> PathBuf {
        let dir = match state {
            ReplicaState::BeingWritten => RBW_DIR,
            ReplicaState::Finalized => FINALIZED_DIR,
        };
        self.root.join(dir).join(block.file_name())
    }

    fn lookup(&self, block: &Block) -> Result<DiskReplica, ReplicaError> {
        self.index
            .get(&block.id)
            .filter(|r| r.block == *block)
            .map(|r| r.clone())
            .ok_or(ReplicaError::NotFound(*block))
    }

    /// Current on-disk view of a replica. A failed stat says nothing about
    /// the replica's contents, so the last known length stands in for it.
    fn info_for(&self, replica: &DiskReplica) -> ReplicaInfo {
        let path = self.replica_path(&replica.block, replica.state);
        let length = match fs::metadata(&path) {
            Ok(metadata) => {
                let length = metadata.len();
                if length != replica.length {
                    self.remember_length(&replica.block, length);
                }
                length
            }
            Err(e) => {
                warn!(block = %replica.block, "Cannot stat {}: {e}", path.display());
                replica.length
            }
        };
        ReplicaInfo {
            block: replica.block,
            length,
            state: replica.state,
            corrupt: replica.corrupt,
        }
    }

    fn remember_length(&self, block: &Block, length: u64) {
        if let Some(mut replica) = self.index.get_mut(&block.id).filter(|r| r.block == *block) {
            replica.length = length;
        }
    }

    fn write_meta(&self, data_path: &Path, checksums: &Checksums) -> io::Result<()> {
        let json = serde_json::to_vec(checksums).map_err(io::Error::other)?;
        fs::write(meta_path(data_path), json)
    }
}

fn meta_path(data_path: &Path) -> PathBuf {
    data_path.with_extension(META_EXTENSION)
}

/// Parse `blk_<id>_<gs>`
fn parse_file_name(name: &str) -> Option<Block> {
    let rest = name.strip_prefix("blk_")?;
    let (id, gs) = rest.split_once('_')?;
    Some(Block::new(id.parse().ok()?, gs.parse().ok()?))
}

fn io_err(block: &Block) -> impl FnOnce(io::Error) -> ReplicaError + '_ {
    move |source| ReplicaError::Io {
        block: *block,
        source,
    }
}

impl ReplicaStore for DiskReplicaStore {
    fn begin(&self, block: Block) -> Result<(), ReplicaError> {
        let Entry::Vacant(slot) = self.index.entry(block.id) else {
            return Err(ReplicaError::AlreadyExists(block));
        };
        let path = self.replica_path(&block, ReplicaState::BeingWritten);
        OpenOptions::new().write(true).create_new(true).open(&path).map_err(io_err(&block))?;
        slot.insert(DiskReplica {
            block,
            state: ReplicaState::BeingWritten,
            corrupt: false,
            length: 0,
        });
        Ok(())
    }

    fn append(&self, block: &Block, data: &[u8]) -> Result<u64, ReplicaError> {
        let replica = self.lookup(block)?;
        if replica.state == ReplicaState::Finalized {
            return Err(ReplicaError::AlreadyFinalized(*block));
        }
        let path = self.replica_path(block, ReplicaState::BeingWritten);
        let mut file = OpenOptions::new().append(true).open(&path).map_err(io_err(block))?;
        file.write_all(data).map_err(io_err(block))?;
        let length = file.metadata().map_err(io_err(block))?.len();
        self.remember_length(block, length);
        Ok(length)
    }

    fn finalize(
        &self,
        block: &Block,
        bytes_per_checksum: u32,
    ) -> Result<ReplicaInfo, ReplicaError> {
        let replica = self.lookup(block)?;
        if replica.state == ReplicaState::Finalized {
            return Err(ReplicaError::AlreadyFinalized(*block));
        }
        let rbw = self.replica_path(block, ReplicaState::BeingWritten);
        let finalized = self.replica_path(block, ReplicaState::Finalized);
        let data = fs::read(&rbw).map_err(io_err(block))?;
        self.write_meta(&finalized, &Checksums::compute(&data, bytes_per_checksum))
            .map_err(io_err(block))?;
        fs::rename(&rbw, &finalized).map_err(io_err(block))?;

        let replica = DiskReplica {
            block: *block,
            state: ReplicaState::Finalized,
            corrupt: false,
            length: data.len() as u64,
        };
        let info = self.info_for(&replica);
        self.index.insert(block.id, replica);
        Ok(info)
    }

    fn store_finalized(
        &self,
        block: Block,
        data: &[u8],
        checksums: &Checksums,
    ) -> Result<ReplicaInfo, ReplicaError> {
        check_replica(&block, data, checksums)?;
        let Entry::Vacant(slot) = self.index.entry(block.id) else {
            return Err(ReplicaError::AlreadyExists(block));
        };
        let path = self.replica_path(&block, ReplicaState::Finalized);
        self.write_meta(&path, checksums).map_err(io_err(&block))?;
        fs::write(&path, data).map_err(io_err(&block))?;

        let replica = DiskReplica {
            block,
            state: ReplicaState::Finalized,
            corrupt: false,
            length: data.len() as u64,
        };
        let info = ReplicaInfo {
            block,
            length: replica.length,
            state: replica.state,
            corrupt: false,
        };
        slot.insert(replica);
        Ok(info)
    }

    fn read_raw(&self, block: &Block) -> Result<(Vec<u8>, Checksums), ReplicaError> {
        let replica = self.lookup(block)?;
        if replica.state != ReplicaState::Finalized {
            return Err(ReplicaError::NotFinalized(*block));
        }
        let path = self.replica_path(block, ReplicaState::Finalized);
        let data = fs::read(&path).map_err(io_err(block))?;
        let meta = fs::read(meta_path(&path)).map_err(io_err(block))?;
        let checksums: Checksums = serde_json::from_slice(&meta)
            .map_err(|e| io_err(block)(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Ok((data, checksums))
    }

    fn info(&self, block_id: u64) -> Option<ReplicaInfo> {
        let replica = self.index.get(&block_id).map(|r| r.clone())?;
        Some(self.info_for(&replica))
    }

    fn list(&self) -> Vec<ReplicaInfo> {
        let replicas: Vec<DiskReplica> = self.index.iter().map(|r| r.clone()).collect();
        let mut infos: Vec<_> = replicas.iter().map(|r| self.info_for(r)).collect();
        infos.sort_by_key(|r| r.block.id);
        infos
    }

    fn mark_corrupt(&self, block: &Block) -> Result<bool, ReplicaError> {
        let mut replica = self
            .index
            .get_mut(&block.id)
            .filter(|r| r.block == *block)
            .ok_or(ReplicaError::NotFound(*block))?;
        let newly = !replica.corrupt;
        replica.corrupt = true;
        Ok(newly)
    }

    fn delete(&self, block: &Block) -> Result<bool, ReplicaError> {
        let Some((_, replica)) = self.index.remove_if(&block.id, |_, r| r.block == *block) else {
            return Ok(false);
        };
        let path = self.replica_path(block, replica.state);
        fs::remove_file(&path).map_err(io_err(block))?;
        if replica.state == ReplicaState::Finalized {
            fs::remove_file(meta_path(&path)).map_err(io_err(block))?;
        }
        Ok(true)
    }
}
