//! Storage node state and command handling, independent of the message bus.

use palisade_common::{
    commands::datanode::{DataNodeCommand, DataNodeRequest, DataNodeResponse},
    messages::{
        BlockReportMessage, DataNodeMessage, HeartbeatMessage, ReplicaDeletedMessage,
        ReplicaReceivedMessage, ReportCorruptMessage,
    },
    queries::verifier::{BlockVerification, VerifierStateQuery, VerifierStateQueryResponse},
    Block, CorruptionReason, NodeId, ReportSource, ReportedReplica,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::block_verifier::{BlockVerifier, NextScan, ScanOutcome, VerifierConfig};
use crate::stores::{check_replica, ReplicaError, ReplicaStore};

/// Something the node wants sent once the current operation is done
#[derive(Debug, Clone)]
pub enum Outgoing {
    Event(DataNodeMessage),
    Corrupt(ReportCorruptMessage),
    /// Command for a peer node
    Command {
        node: NodeId,
        command: DataNodeCommand,
    },
}

pub struct DataNode {
    id: NodeId,
    rack: String,
    capacity_bytes: u64,
    bytes_per_checksum: u32,
    store: Arc<dyn ReplicaStore>,
    verifier: Mutex<BlockVerifier>,
    active_transfers: AtomicU32,
}

impl DataNode {
    pub fn new(
        id: NodeId,
        rack: String,
        capacity_bytes: u64,
        bytes_per_checksum: u32,
        store: Arc<dyn ReplicaStore>,
        verifier: VerifierConfig,
    ) -> Self {
        Self {
            verifier: Mutex::new(BlockVerifier::new(id.clone(), verifier)),
            id,
            rack,
            capacity_bytes,
            bytes_per_checksum,
            store,
            active_transfers: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    pub fn verifier(&self) -> MutexGuard<'_, BlockVerifier> {
        self.verifier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn heartbeat(&self) -> HeartbeatMessage {
        HeartbeatMessage {
            node: self.id.clone(),
            rack: self.rack.clone(),
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.store.used_bytes(),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
        }
    }

    /// Full inventory, including replicas being written and those known corrupt
    pub fn block_report(&self) -> BlockReportMessage {
        let verifier = self.verifier();
        let replicas = self
            .store
            .list()
            .into_iter()
            .map(|r| ReportedReplica {
                block: r.block,
                observed_length: r.length,
                state: r.state,
                last_verified: verifier.last_verified(r.block.id),
                corrupt: r.corrupt,
            })
            .collect();
        BlockReportMessage {
            node: self.id.clone(),
            replicas,
        }
    }

    /// Flag a local replica corrupt, producing a report only the first time
    pub fn flag_corrupt(
        &self,
        block: &Block,
        observed_length: u64,
        reason: CorruptionReason,
        source: ReportSource,
    ) -> Option<ReportCorruptMessage> {
        match self.store.mark_corrupt(block) {
            Ok(true) => {
                warn!(node = %self.id, %block, %reason, "Replica marked corrupt");
                Some(ReportCorruptMessage {
                    block: *block,
                    node: self.id.clone(),
                    observed_length,
                    reason,
                    source,
                })
            }
            Ok(false) => None,
            Err(e) => {
                debug!(node = %self.id, %block, "Could not mark replica corrupt: {e}");
                None
            }
        }
    }

    /// Act on a scan result from the verifier
    pub fn scan_outcome(&self, outcome: &ScanOutcome) -> Option<ReportCorruptMessage> {
        match outcome {
            ScanOutcome::Corrupt {
                block,
                observed_length,
                reason,
            } => self.flag_corrupt(block, *observed_length, *reason, ReportSource::Verifier),
            _ => None,
        }
    }

    /// Synchronous verifier step: scan at most one due replica
    pub fn verify_once(&self, now: u64) -> (Option<ScanOutcome>, Vec<Outgoing>) {
        let mut verifier = self.verifier();
        verifier.refresh(&self.store.list());
        let NextScan::Scan(block) = verifier.next_scan(now) else {
            return (None, Vec::new());
        };
        let outcome = verifier.record(block, self.store.verify(&block), now);
        drop(verifier);

        let outgoing = self.scan_outcome(&outcome).map(Outgoing::Corrupt).into_iter().collect();
        (Some(outcome), outgoing)
    }

    pub fn handle_command(&self, command: DataNodeCommand, _now: u64) -> Vec<Outgoing> {
        match command {
            DataNodeCommand::Replicate { block, target } => self.replicate(block, target),
            DataNodeCommand::Invalidate { blocks } => self.invalidate(&blocks),
            DataNodeCommand::SendBlockReport => {
                vec![Outgoing::Event(DataNodeMessage::BlockReport(self.block_report()))]
            }
            DataNodeCommand::Receive {
                block,
                source,
                data,
                checksums,
            } => {
                self.active_transfers.fetch_add(1, Ordering::Relaxed);
                let result = self.store.store_finalized(block, &data, &checksums);
                self.active_transfers.fetch_sub(1, Ordering::Relaxed);
                match result {
                    Ok(info) => {
                        info!(node = %self.id, %block, %source, "Received replica");
                        vec![self.received(block, info.length)]
                    }
                    Err(ReplicaError::AlreadyExists(_)) => {
                        debug!(node = %self.id, %block, "Replica already present");
                        match self.store.info(block.id) {
                            Some(info) if info.block == block && !info.corrupt => {
                                vec![self.received(block, info.length)]
                            }
                            _ => Vec::new(),
                        }
                    }
                    Err(e) => {
                        warn!(node = %self.id, %block, %source, "Rejected replica: {e}");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Send a verified copy of a local replica to `target`. A copy that fails
    /// its checksums is never forwarded; the local replica is reported instead.
    fn replicate(&self, block: Block, target: NodeId) -> Vec<Outgoing> {
        self.active_transfers.fetch_add(1, Ordering::Relaxed);
        let read = self.store.read(&block);
        self.active_transfers.fetch_sub(1, Ordering::Relaxed);

        let (data, checksums) = match read {
            Ok(replica) => replica,
            Err(e) => {
                warn!(node = %self.id, %block, %target, "Cannot replicate: {e}");
                return Vec::new();
            }
        };

        if let Err(e) = check_replica(&block, &data, &checksums) {
            let reason = e.corruption_reason().unwrap_or(CorruptionReason::ChecksumMismatch);
            let observed = e.observed_length().unwrap_or(data.len() as u64);
            warn!(node = %self.id, %block, "Replication source failed verification: {e}");
            return self
                .flag_corrupt(&block, observed, reason, ReportSource::Verifier)
                .map(Outgoing::Corrupt)
                .into_iter()
                .collect();
        }

        info!(node = %self.id, %block, %target, bytes = data.len(), "Replicating");
        vec![Outgoing::Command {
            node: target,
            command: DataNodeCommand::Receive {
                block,
                source: self.id.clone(),
                data,
                checksums,
            },
        }]
    }

    fn invalidate(&self, blocks: &[Block]) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        for block in blocks {
            match self.store.delete(block) {
                Ok(true) => {
                    info!(node = %self.id, %block, "Deleted replica");
                    outgoing.push(Outgoing::Event(DataNodeMessage::ReplicaDeleted(
                        ReplicaDeletedMessage {
                            node: self.id.clone(),
                            block: *block,
                        },
                    )));
                }
                Ok(false) => debug!(node = %self.id, %block, "Replica to delete not present"),
                Err(e) => error!(node = %self.id, %block, "Failed to delete replica: {e}"),
            }
        }
        outgoing
    }

    fn received(&self, block: Block, length: u64) -> Outgoing {
        Outgoing::Event(DataNodeMessage::ReplicaReceived(ReplicaReceivedMessage {
            node: self.id.clone(),
            block,
            length,
        }))
    }

    pub fn handle_request(
        &self,
        request: DataNodeRequest,
        now: u64,
    ) -> (DataNodeResponse, Vec<Outgoing>) {
        match request {
            DataNodeRequest::WriteReplica {
                block,
                data,
                finalize,
            } => match self.write(block, &data, finalize) {
                Ok((length, finalized)) => {
                    let outgoing =
                        if finalized { vec![self.received(block, length)] } else { Vec::new() };
                    (DataNodeResponse::Written { block, length }, outgoing)
                }
                Err(e) => (DataNodeResponse::Error(e.to_string()), Vec::new()),
            },

            DataNodeRequest::ReadReplica { block } => match self.store.read(&block) {
                Ok((data, checksums)) => (
                    DataNodeResponse::Replica {
                        block,
                        data,
                        checksums,
                    },
                    Vec::new(),
                ),
                Err(e) => (DataNodeResponse::Error(e.to_string()), Vec::new()),
            },

            DataNodeRequest::ReadVerified { block } => {
                let replicas = self.store.list();
                let mut verifier = self.verifier();
                verifier.refresh(&replicas);
                if verifier.mark_verified(&block, now) {
                    debug!(node = %self.id, %block, "Client verified replica");
                }
                (DataNodeResponse::Acknowledged, Vec::new())
            }
        }
    }

    fn write(&self, block: Block, data: &[u8], finalize: bool) -> Result<(u64, bool), ReplicaError> {
        match self.store.info(block.id) {
            Some(existing) if existing.block != block => {
                return Err(ReplicaError::AlreadyExists(existing.block))
            }
            Some(_) => {}
            None => self.store.begin(block)?,
        }
        let length = self.store.append(&block, data)?;
        if finalize {
            let info = self.store.finalize(&block, self.bytes_per_checksum)?;
            return Ok((info.length, true));
        }
        Ok((length, false))
    }

    pub fn handle_verifier_query(
        &self,
        query: &VerifierStateQuery,
        now: u64,
    ) -> VerifierStateQueryResponse {
        let replicas = self.store.list();
        let mut verifier = self.verifier();
        verifier.refresh(&replicas);
        match query {
            VerifierStateQuery::GetBlockVerification { block_id } => {
                // Held but not scannable yet (being written, or flagged corrupt)
                let unverified = || {
                    replicas.iter().find(|r| r.block.id == *block_id).map(|r| BlockVerification {
                        block: r.block,
                        last_verified: None,
                        scan_period_ms: verifier.scan_period().as_millis() as u64,
                    })
                };
                match verifier.status(*block_id).or_else(unverified) {
                    Some(status) => VerifierStateQueryResponse::BlockVerification(status),
                    None => VerifierStateQueryResponse::NotFound,
                }
            }
            VerifierStateQuery::GetVerifierReport => {
                VerifierStateQueryResponse::VerifierReport(verifier.report(now))
            }
        }
    }
}
