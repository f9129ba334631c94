//! File namespace: paths, their ordered blocks and replication factor.
//!
//! Block records themselves live in the [`BlockCatalog`]; the namespace only
//! owns the file → block list mapping and drives lifecycle transitions that
//! depend on file structure (a new block completes the previous one, closing
//! a file completes its last block).

use palisade_common::{queries::blocks::LocatedBlocks, Block, LocatedBlock};
use std::collections::BTreeMap;
use tracing::info;

use crate::catalog::{BlockCatalog, BlockRecord, CatalogError};

/// First generation stamp handed out to new blocks
pub const FIRST_GENERATION_STAMP: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    #[error("file {0} already exists")]
    FileExists(String),

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("file {0} is closed")]
    FileClosed(String),

    #[error("replication factor must be positive")]
    InvalidReplication,

    #[error("no storage nodes available for a new block of {0}")]
    NoTargets(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub replication: u16,
    pub blocks: Vec<u64>,
    pub under_construction: bool,
}

#[derive(Debug)]
pub struct Namespace {
    files: BTreeMap<String, FileRecord>,
    next_block_id: u64,
    generation_stamp: u64,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            next_block_id: 1,
            generation_stamp: FIRST_GENERATION_STAMP,
        }
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn create(&mut self, path: &str, replication: u16) -> Result<(), NamespaceError> {
        if replication == 0 {
            return Err(NamespaceError::InvalidReplication);
        }
        if self.files.contains_key(path) {
            return Err(NamespaceError::FileExists(path.to_string()));
        }
        self.files.insert(
            path.to_string(),
            FileRecord {
                path: path.to_string(),
                replication,
                blocks: Vec::new(),
                under_construction: true,
            },
        );
        info!(path, replication, "File created");
        Ok(())
    }

    fn open_file(&self, path: &str) -> Result<&FileRecord, NamespaceError> {
        let file = self.files.get(path).ok_or_else(|| NamespaceError::FileNotFound(path.to_string()))?;
        if !file.under_construction {
            return Err(NamespaceError::FileClosed(path.to_string()));
        }
        Ok(file)
    }

    /// Allocate the next block of an open file. The previous block must have
    /// been committed and is completed here.
    pub fn add_block(
        &mut self,
        path: &str,
        catalog: &mut BlockCatalog,
        now: u64,
    ) -> Result<Block, NamespaceError> {
        let file = self.open_file(path)?;
        let replication = file.replication;
        if let Some(last) = file.blocks.last() {
            catalog.complete_block(*last, now)?;
        }

        let block = Block::new(self.next_block_id, self.generation_stamp);
        self.next_block_id += 1;
        catalog.add_block(block, path, replication);
        if let Some(file) = self.files.get_mut(path) {
            file.blocks.push(block.id);
        }
        info!(path, %block, "Block allocated");
        Ok(block)
    }

    /// Close a file, completing its last block
    pub fn close(
        &mut self,
        path: &str,
        catalog: &mut BlockCatalog,
        now: u64,
    ) -> Result<(), NamespaceError> {
        let file = self.open_file(path)?;
        if let Some(last) = file.blocks.last() {
            catalog.complete_block(*last, now)?;
        }
        if let Some(file) = self.files.get_mut(path) {
            file.under_construction = false;
        }
        info!(path, "File closed");
        Ok(())
    }

    /// Remove a file and its blocks from the catalog, returning the removed
    /// block records so their replicas can be invalidated
    pub fn delete(
        &mut self,
        path: &str,
        catalog: &mut BlockCatalog,
    ) -> Result<Vec<BlockRecord>, NamespaceError> {
        let file = self.files.remove(path).ok_or_else(|| NamespaceError::FileNotFound(path.to_string()))?;
        let removed: Vec<_> = file.blocks.iter().filter_map(|id| catalog.remove_block(*id)).collect();
        info!(path, blocks = removed.len(), "File deleted");
        Ok(removed)
    }

    /// Blocks of a file overlapping `[offset, offset + length)`
    pub fn located_blocks(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        catalog: &BlockCatalog,
    ) -> Result<LocatedBlocks, NamespaceError> {
        let file = self.files.get(path).ok_or_else(|| NamespaceError::FileNotFound(path.to_string()))?;
        let end = offset.saturating_add(length);

        let mut blocks: Vec<LocatedBlock> = Vec::new();
        let mut position = 0u64;
        for block_id in &file.blocks {
            let Some(mut located) = catalog.query_locations(*block_id) else {
                continue;
            };
            located.offset = position;
            position += located.length;
            let overlaps = located.offset < end
                && (located.offset + located.length > offset
                    || (located.length == 0 && located.offset >= offset));
            if overlaps {
                blocks.push(located);
            }
        }

        Ok(LocatedBlocks {
            file_length: position,
            under_construction: file.under_construction,
            blocks,
        })
    }
}
