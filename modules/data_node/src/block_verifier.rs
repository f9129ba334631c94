//! Background block verifier.
//!
//! Walks the node's finalized replicas in circular block-id order, re-reading
//! each one and checking it against its stored checksums. Scans are paced so
//! the whole set is covered once per `scan_period`, and optionally capped to a
//! read bandwidth. Replicas still being written are never scanned.
//!
//! The verifier itself does no I/O: [`BlockVerifier::next_scan`] picks the next
//! replica, the caller reads it, and [`BlockVerifier::record`] folds the result
//! back in. This keeps the verifier lock free during disk reads.

use palisade_common::{
    queries::verifier::{BlockVerification, VerifierReport},
    Block, CorruptionReason, NodeId, ReplicaState,
};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::stores::{ReplicaError, ReplicaInfo, ReplicaStore};
use crate::throttle::ReadBudget;

/// Longest the verifier sleeps before looking for new replicas
const MAX_IDLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Every finalized replica is verified at least once per period
    pub scan_period: Duration,

    pub throttle_bytes_per_second: Option<u64>,

    /// Consecutive I/O failures tolerated before a replica counts as corrupt
    pub max_io_retries: u32,
}

#[derive(Debug, Clone)]
struct VerificationEntry {
    block: Block,
    last_verified: Option<u64>,
    io_failures: u32,
}

/// What the verifier wants to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextScan {
    Scan(Block),
    Idle(Duration),
}

/// Result of one scan, after it has been recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Verified {
        block: Block,
        bytes: u64,
    },
    Corrupt {
        block: Block,
        observed_length: u64,
        reason: CorruptionReason,
    },
    /// Transient I/O failure, retried next cycle
    Retry {
        block: Block,
        failures: u32,
    },
    /// Replica went away or changed state while being scanned
    Vanished {
        block: Block,
    },
}

pub struct BlockVerifier {
    node: NodeId,
    config: VerifierConfig,
    entries: BTreeMap<u64, VerificationEntry>,
    cursor: Option<u64>,
    throttle: Option<ReadBudget>,
}

impl BlockVerifier {
    pub fn new(node: NodeId, config: VerifierConfig) -> Self {
        let throttle =
            config.throttle_bytes_per_second.map(|rate| ReadBudget::new(rate, Instant::now()));
        Self {
            node,
            config,
            entries: BTreeMap::new(),
            cursor: None,
            throttle,
        }
    }

    pub fn scan_period(&self) -> Duration {
        self.config.scan_period
    }

    /// Number of replicas currently eligible for scanning
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reconcile the scan set with the store's replicas. Only finalized,
    /// non-corrupt replicas are scanned; verification history survives as long
    /// as the replica keeps its generation stamp.
    pub fn refresh(&mut self, replicas: &[ReplicaInfo]) {
        let mut entries = BTreeMap::new();
        for replica in replicas {
            if replica.state != ReplicaState::Finalized || replica.corrupt {
                continue;
            }
            let entry = match self.entries.remove(&replica.block.id) {
                Some(existing) if existing.block == replica.block => existing,
                _ => VerificationEntry {
                    block: replica.block,
                    last_verified: None,
                    io_failures: 0,
                },
            };
            entries.insert(replica.block.id, entry);
        }
        self.entries = entries;
    }

    /// Pick the next due replica after the cursor, or say how long to idle
    pub fn next_scan(&mut self, now: u64) -> NextScan {
        let period = self.period_ms();
        let start = self.cursor.unwrap_or(0);
        let after = self.entries.range((Excluded(start), Unbounded));
        let wrapped = self.entries.range(..=start);

        let mut earliest_due: Option<u64> = None;
        for (id, entry) in after.chain(wrapped) {
            match entry.last_verified {
                None => {
                    let (id, block) = (*id, entry.block);
                    self.cursor = Some(id);
                    return NextScan::Scan(block);
                }
                Some(at) if now >= at.saturating_add(period) => {
                    let (id, block) = (*id, entry.block);
                    self.cursor = Some(id);
                    return NextScan::Scan(block);
                }
                Some(at) => {
                    let due = at.saturating_add(period);
                    earliest_due = Some(earliest_due.map_or(due, |e| e.min(due)));
                }
            }
        }

        let idle = earliest_due
            .map(|due| Duration::from_millis(due.saturating_sub(now)))
            .unwrap_or(MAX_IDLE);
        NextScan::Idle(idle.min(MAX_IDLE).max(Duration::from_millis(1)))
    }

    /// True once the cursor has passed the last tracked replica, when the
    /// scan set should be refreshed from the store before continuing
    pub fn pass_complete(&self) -> bool {
        match self.cursor {
            None => true,
            Some(cursor) => self.entries.range((Excluded(cursor), Unbounded)).next().is_none(),
        }
    }

    /// Fold a scan result into the verifier state
    pub fn record(
        &mut self,
        block: Block,
        result: Result<u64, ReplicaError>,
        now: u64,
    ) -> ScanOutcome {
        let Some(entry) = self.entries.get_mut(&block.id).filter(|e| e.block == block) else {
            return ScanOutcome::Vanished { block };
        };

        match result {
            Ok(bytes) => {
                entry.last_verified = Some(now);
                entry.io_failures = 0;
                debug!(node = %self.node, %block, bytes, "Verification succeeded");
                ScanOutcome::Verified { block, bytes }
            }
            Err(e) => {
                if let Some(reason) = e.corruption_reason() {
                    warn!(node = %self.node, %block, "Verification failed: {e}");
                    let observed_length = e.observed_length().unwrap_or(0);
                    self.entries.remove(&block.id);
                    return ScanOutcome::Corrupt {
                        block,
                        observed_length,
                        reason,
                    };
                }
                if e.is_transient() {
                    entry.io_failures += 1;
                    let failures = entry.io_failures;
                    if failures > self.config.max_io_retries {
                        warn!(node = %self.node, %block, failures, "Replica unreadable: {e}");
                        self.entries.remove(&block.id);
                        return ScanOutcome::Corrupt {
                            block,
                            observed_length: 0,
                            reason: CorruptionReason::Unreadable,
                        };
                    }
                    info!(node = %self.node, %block, failures, "Transient error verifying: {e}");
                    return ScanOutcome::Retry { block, failures };
                }
                debug!(node = %self.node, %block, "Replica no longer scannable: {e}");
                self.entries.remove(&block.id);
                ScanOutcome::Vanished { block }
            }
        }
    }

    /// Pause before the next scan: the per-replica pacing share of the scan
    /// period, or longer if the bandwidth cap demands it
    pub fn scan_delay(&mut self, bytes_read: u64, now: Instant) -> Duration {
        let count = self.entries.len().max(1) as u32;
        let pacing = self.config.scan_period / count;
        let throttled = self
            .throttle
            .as_mut()
            .map(|budget| budget.charge(bytes_read, now))
            .unwrap_or(Duration::ZERO);
        pacing.max(throttled)
    }

    /// A client read the whole replica and its checksums matched
    pub fn mark_verified(&mut self, block: &Block, now: u64) -> bool {
        match self.entries.get_mut(&block.id).filter(|e| e.block == *block) {
            Some(entry) => {
                entry.last_verified = Some(now);
                entry.io_failures = 0;
                true
            }
            None => false,
        }
    }

    pub fn last_verified(&self, block_id: u64) -> Option<u64> {
        self.entries.get(&block_id).and_then(|e| e.last_verified)
    }

    pub fn status(&self, block_id: u64) -> Option<BlockVerification> {
        self.entries.get(&block_id).map(|e| self.verification(e))
    }

    pub fn report(&self, now: u64) -> VerifierReport {
        let period = self.period_ms();
        let blocks: Vec<_> = self.entries.values().map(|e| self.verification(e)).collect();
        let verified_in_period = blocks
            .iter()
            .filter(|b| b.last_verified.is_some_and(|at| now.saturating_sub(at) < period))
            .count();
        VerifierReport {
            node: self.node.clone(),
            scan_period_ms: period,
            total_replicas: blocks.len(),
            verified_in_period,
            blocks,
        }
    }

    fn verification(&self, entry: &VerificationEntry) -> BlockVerification {
        BlockVerification {
            block: entry.block,
            last_verified: entry.last_verified,
            scan_period_ms: self.period_ms(),
        }
    }

    fn period_ms(&self) -> u64 {
        self.config.scan_period.as_millis() as u64
    }

    /// Refresh, pick, read and record one replica synchronously.
    ///
    /// Returns `None` when nothing is due. A corrupt outcome has already been
    /// flagged in the store.
    pub fn scan_once(&mut self, store: &dyn ReplicaStore, now: u64) -> Option<ScanOutcome> {
        self.refresh(&store.list());
        let NextScan::Scan(block) = self.next_scan(now) else {
            return None;
        };
        let outcome = self.record(block, store.verify(&block), now);
        if let ScanOutcome::Corrupt { block, .. } = &outcome {
            if let Err(e) = store.mark_corrupt(block) {
                warn!(node = %self.node, %block, "Could not flag replica corrupt: {e}");
            }
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryReplicaStore;

    const PERIOD: Duration = Duration::from_secs(100);

    fn verifier(max_io_retries: u32) -> BlockVerifier {
        BlockVerifier::new(
            NodeId::from("dn-1"),
            VerifierConfig {
                scan_period: PERIOD,
                throttle_bytes_per_second: None,
                max_io_retries,
            },
        )
    }

    fn store_with(blocks: &[u64]) -> MemoryReplicaStore {
        let store = MemoryReplicaStore::new();
        for id in blocks {
            let block = Block::new(*id, 1000);
            store.begin(block).unwrap();
            store.append(&block, &vec![*id as u8; 1024]).unwrap();
            store.finalize(&block, 512).unwrap();
        }
        store
    }

    #[test]
    fn every_replica_verified_within_one_period() {
        let store = store_with(&[3, 1, 2]);
        let mut verifier = verifier(2);
        let start = 1_000_000;

        let mut now = start;
        let mut verified = Vec::new();
        while let Some(ScanOutcome::Verified { block, .. }) = verifier.scan_once(&store, now) {
            verified.push(block.id);
            now += verifier.scan_delay(1024, Instant::now()).as_millis() as u64;
        }

        assert_eq!(verified, vec![1, 2, 3]);
        assert!(now - start <= PERIOD.as_millis() as u64);
        for id in [1, 2, 3] {
            assert!(verifier.last_verified(id).unwrap() >= start);
        }
    }

    #[test]
    fn pacing_spreads_scans_over_the_period() {
        let store = store_with(&[1, 2, 3, 4]);
        let mut verifier = verifier(2);
        verifier.refresh(&store.list());
        assert_eq!(verifier.scan_delay(0, Instant::now()), Duration::from_secs(25));
    }

    #[test]
    fn throttle_can_exceed_pacing() {
        let store = store_with(&[1]);
        let mut verifier = BlockVerifier::new(
            NodeId::from("dn-1"),
            VerifierConfig {
                scan_period: Duration::from_secs(1),
                throttle_bytes_per_second: Some(100),
                max_io_retries: 2,
            },
        );
        verifier.refresh(&store.list());
        assert_eq!(verifier.scan_delay(1100, Instant::now()), Duration::from_secs(10));
    }

    #[test]
    fn pass_completes_after_last_tracked_replica() {
        let store = store_with(&[1, 2]);
        let mut verifier = verifier(2);
        assert!(verifier.pass_complete());

        verifier.refresh(&store.list());
        assert_eq!(verifier.next_scan(0), NextScan::Scan(Block::new(1, 1000)));
        assert!(!verifier.pass_complete());

        // A replica written mid-pass is picked up at the next refresh only
        let late = store_with(&[1, 2, 3]);
        assert_eq!(verifier.next_scan(0), NextScan::Scan(Block::new(2, 1000)));
        assert!(verifier.pass_complete());
        verifier.refresh(&late.list());
        assert!(!verifier.pass_complete());
        assert_eq!(verifier.next_scan(0), NextScan::Scan(Block::new(3, 1000)));
    }

    #[test]
    fn idle_until_next_replica_is_due() {
        let store = store_with(&[1]);
        let mut verifier = verifier(2);
        assert!(matches!(verifier.scan_once(&store, 0), Some(ScanOutcome::Verified { .. })));
        assert_eq!(verifier.scan_once(&store, 1_000), None);
        assert_eq!(verifier.next_scan(1_000), NextScan::Idle(MAX_IDLE));
        assert!(matches!(verifier.next_scan(100_000), NextScan::Scan(_)));
    }

    #[test]
    fn replica_being_written_is_never_scanned() {
        let store = store_with(&[1]);
        let partial = Block::new(2, 1000);
        store.begin(partial).unwrap();
        store.append(&partial, &[0u8; 100]).unwrap();

        let mut verifier = verifier(2);
        verifier.refresh(&store.list());
        assert_eq!(verifier.len(), 1);
        assert!(verifier.status(2).is_none());
    }

    #[test]
    fn checksum_mismatch_marks_replica_corrupt_once() {
        let store = store_with(&[1]);
        store.damage(1, 10);
        let mut verifier = verifier(2);

        let outcome = verifier.scan_once(&store, 0);
        assert_eq!(
            outcome,
            Some(ScanOutcome::Corrupt {
                block: Block::new(1, 1000),
                observed_length: 1024,
                reason: CorruptionReason::ChecksumMismatch,
            })
        );
        assert!(store.info(1).unwrap().corrupt);

        // Corrupt replicas drop out of the scan set
        assert_eq!(verifier.scan_once(&store, 1), None);
        assert!(verifier.is_empty());
    }

    #[test]
    fn transient_errors_retry_then_count_as_corrupt() {
        let store = store_with(&[1]);
        store.inject_io_errors(1, 3);
        let mut verifier = verifier(2);
        let block = Block::new(1, 1000);

        assert_eq!(
            verifier.scan_once(&store, 0),
            Some(ScanOutcome::Retry { block, failures: 1 })
        );
        assert_eq!(
            verifier.scan_once(&store, 1),
            Some(ScanOutcome::Retry { block, failures: 2 })
        );
        assert_eq!(
            verifier.scan_once(&store, 2),
            Some(ScanOutcome::Corrupt {
                block,
                observed_length: 0,
                reason: CorruptionReason::Unreadable,
            })
        );
        assert!(store.info(1).unwrap().corrupt);
    }

    #[test]
    fn transient_error_then_success_resets_failures() {
        let store = store_with(&[1]);
        store.inject_io_errors(1, 1);
        let mut verifier = verifier(1);

        assert!(matches!(verifier.scan_once(&store, 0), Some(ScanOutcome::Retry { .. })));
        assert!(matches!(verifier.scan_once(&store, 1), Some(ScanOutcome::Verified { .. })));
        assert_eq!(verifier.last_verified(1), Some(1));
    }

    #[test]
    fn client_read_counts_as_verification() {
        let store = store_with(&[1]);
        let mut verifier = verifier(2);
        verifier.refresh(&store.list());
        assert_eq!(verifier.status(1).unwrap().last_verified, None);

        assert!(verifier.mark_verified(&Block::new(1, 1000), 42));
        let status = verifier.status(1).unwrap();
        assert_eq!(status.last_verified, Some(42));
        assert_eq!(status.scan_period_ms, 100_000);
    }

    #[test]
    fn report_counts_recent_verifications() {
        let store = store_with(&[1, 2]);
        let mut verifier = verifier(2);
        verifier.scan_once(&store, 0);

        let report = verifier.report(50_000);
        assert_eq!(report.total_replicas, 2);
        assert_eq!(report.verified_in_period, 1);
        assert_eq!(report.scan_period_ms, 100_000);
    }

    #[test]
    fn new_generation_resets_history() {
        let store = store_with(&[1]);
        let mut verifier = verifier(2);
        verifier.scan_once(&store, 0);
        assert!(verifier.last_verified(1).is_some());

        let replaced = ReplicaInfo {
            block: Block::new(1, 1001),
            length: 1024,
            state: ReplicaState::Finalized,
            corrupt: false,
        };
        verifier.refresh(&[replaced]);
        assert_eq!(verifier.last_verified(1), None);
    }
}
