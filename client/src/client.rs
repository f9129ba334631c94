//! File-level client operations on top of a [`ClusterTransport`]

use palisade_common::{
    checksum::ChecksumCheck,
    commands::{
        datanode::{DataNodeRequest, DataNodeResponse},
        namespace::{NamespaceCommand, NamespaceCommandResponse},
    },
    messages::ReportCorruptMessage,
    queries::blocks::{BlocksStateQuery, BlocksStateQueryResponse, LocatedBlocks},
    Block, CorruptionReason, LocatedBlock, NodeId, ReportSource,
};
use tracing::{debug, info, warn};

use crate::blacklist::ReadBlacklist;
use crate::transport::ClusterTransport;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Namespace(String),

    #[error("file {0} not found")]
    NotFound(String),

    #[error("no readable replica of {block} after trying {tried} node(s)")]
    BlockUnreadable { block: Block, tried: usize },

    #[error("write of {block} to {node} failed: {reason}")]
    WriteFailed {
        block: Block,
        node: NodeId,
        reason: String,
    },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Outcome of reading one replica from one node
#[derive(Debug)]
enum ReplicaRead {
    Good(Vec<u8>),
    Corrupt {
        observed_length: u64,
        reason: CorruptionReason,
    },
    Unavailable(String),
}

pub struct PalisadeClient<T: ClusterTransport> {
    transport: T,
    blacklist: ReadBlacklist,
}

impl<T: ClusterTransport> PalisadeClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            blacklist: ReadBlacklist::new(),
        }
    }

    pub fn blacklist(&self) -> &ReadBlacklist {
        &self.blacklist
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn namespace(
        &self,
        command: NamespaceCommand,
    ) -> Result<NamespaceCommandResponse, ClientError> {
        match self.transport.namespace(command).await? {
            NamespaceCommandResponse::Error(e) => Err(ClientError::Namespace(e)),
            response => Ok(response),
        }
    }

    pub async fn create(&self, path: &str, replication: Option<u16>) -> Result<(), ClientError> {
        self.namespace(NamespaceCommand::CreateFile {
            path: path.to_string(),
            replication,
        })
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, path: &str) -> Result<usize, ClientError> {
        match self.namespace(NamespaceCommand::DeleteFile { path: path.to_string() }).await? {
            NamespaceCommandResponse::Deleted { blocks, .. } => Ok(blocks),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Write one block through its pipeline and commit it. The file stays
    /// open, so the block remains COMMITTED until the next block or close.
    pub async fn write_block(&self, path: &str, data: &[u8]) -> Result<Block, ClientError> {
        let located = match self.namespace(NamespaceCommand::AddBlock { path: path.to_string() }).await? {
            NamespaceCommandResponse::BlockAdded(located) => located,
            other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        };
        let block = located.block;

        for location in &located.locations {
            let request = DataNodeRequest::WriteReplica {
                block,
                data: data.to_vec(),
                finalize: true,
            };
            match self.transport.datanode(&location.node, request).await? {
                DataNodeResponse::Written { length, .. } if length == data.len() as u64 => {}
                other => {
                    return Err(ClientError::WriteFailed {
                        block,
                        node: location.node.clone(),
                        reason: format!("{other:?}"),
                    })
                }
            }
        }

        self.namespace(NamespaceCommand::CommitBlock {
            block,
            length: data.len() as u64,
        })
        .await?;
        debug!(path, %block, replicas = located.locations.len(), "Block written");
        Ok(block)
    }

    /// Create, write in `block_size` pieces and close a file
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        block_size: usize,
        replication: Option<u16>,
    ) -> Result<Vec<Block>, ClientError> {
        self.create(path, replication).await?;
        let mut blocks = Vec::new();
        for chunk in data.chunks(block_size.max(1)) {
            blocks.push(self.write_block(path, chunk).await?);
        }
        self.close(path).await?;
        info!(path, blocks = blocks.len(), bytes = data.len(), "File written");
        Ok(blocks)
    }

    pub async fn close(&self, path: &str) -> Result<(), ClientError> {
        self.namespace(NamespaceCommand::CloseFile { path: path.to_string() }).await.map(|_| ())
    }

    /// Fetch a file's block locations. Starts a fresh read blacklist.
    pub async fn locate(&mut self, path: &str) -> Result<LocatedBlocks, ClientError> {
        let query = BlocksStateQuery::GetLocatedBlocks {
            path: path.to_string(),
            offset: 0,
            length: u64::MAX,
        };
        let located = match self.transport.query_blocks(query).await? {
            BlocksStateQueryResponse::LocatedBlocks(located) => located,
            BlocksStateQueryResponse::NotFound => return Err(ClientError::NotFound(path.to_string())),
            BlocksStateQueryResponse::Error(e) => return Err(ClientError::Namespace(e)),
            other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        };
        self.blacklist.clear();
        Ok(located)
    }

    /// Read a whole file, verifying every replica read against its checksums
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ClientError> {
        let located = self.locate(path).await?;
        let mut data = Vec::with_capacity(located.file_length as usize);
        for block in &located.blocks {
            data.extend(self.read_block(block).await?);
        }
        Ok(data)
    }

    /// Read one block from the first replica that verifies. Replicas failing
    /// verification are reported to the block manager and blacklisted.
    pub async fn read_block(&mut self, located: &LocatedBlock) -> Result<Vec<u8>, ClientError> {
        let block = located.block;
        let candidates = self.blacklist.candidates(located);
        let tried = candidates.len();

        for node in candidates {
            match self.read_replica(&node, located).await {
                ReplicaRead::Good(data) => {
                    if let Err(e) =
                        self.transport.datanode(&node, DataNodeRequest::ReadVerified { block }).await
                    {
                        debug!(%block, %node, "Read-verified notice not delivered: {e}");
                    }
                    return Ok(data);
                }
                ReplicaRead::Corrupt {
                    observed_length,
                    reason,
                } => {
                    warn!(%block, %node, %reason, "Replica failed verification on read");
                    self.blacklist.add(block.id, &node);
                    let report = ReportCorruptMessage {
                        block,
                        node: node.clone(),
                        observed_length,
                        reason,
                        source: ReportSource::Client,
                    };
                    if let Err(e) = self.transport.report_corrupt(report).await {
                        warn!(%block, %node, "Failed to report corrupt replica: {e}");
                    }
                }
                ReplicaRead::Unavailable(reason) => {
                    debug!(%block, %node, "Replica unavailable: {reason}");
                }
            }
        }

        Err(ClientError::BlockUnreadable { block, tried })
    }

    async fn read_replica(&self, node: &NodeId, located: &LocatedBlock) -> ReplicaRead {
        let block = located.block;
        let response = match self.transport.datanode(node, DataNodeRequest::ReadReplica { block }).await {
            Ok(response) => response,
            Err(e) => return ReplicaRead::Unavailable(e.to_string()),
        };
        let (data, checksums) = match response {
            DataNodeResponse::Replica { data, checksums, .. } => (data, checksums),
            other => return ReplicaRead::Unavailable(format!("{other:?}")),
        };

        let observed_length = data.len() as u64;
        match checksums.verify(&data) {
            ChecksumCheck::Ok if observed_length == located.length => ReplicaRead::Good(data),
            ChecksumCheck::Ok | ChecksumCheck::LengthMismatch { .. } => ReplicaRead::Corrupt {
                observed_length,
                reason: CorruptionReason::Truncated,
            },
            ChecksumCheck::Mismatch { .. } => ReplicaRead::Corrupt {
                observed_length,
                reason: CorruptionReason::ChecksumMismatch,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use palisade_common::{checksum::Checksums, ReplicaLocation};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Canned cluster: one located block and per-node replica bytes
    #[derive(Default)]
    struct FakeCluster {
        located: Mutex<Option<LocatedBlocks>>,
        replicas: Mutex<BTreeMap<NodeId, (Vec<u8>, Checksums)>>,
        reports: Mutex<Vec<ReportCorruptMessage>>,
        verified: Mutex<Vec<NodeId>>,
        writes: Mutex<Vec<NodeId>>,
        namespace: Mutex<Vec<String>>,
    }

    impl ClusterTransport for FakeCluster {
        async fn namespace(&self, command: NamespaceCommand) -> Result<NamespaceCommandResponse> {
            self.namespace.lock().unwrap().push(format!("{command:?}"));
            Ok(match command {
                NamespaceCommand::CreateFile { path, .. } => {
                    NamespaceCommandResponse::Created { path }
                }
                NamespaceCommand::AddBlock { .. } => {
                    NamespaceCommandResponse::BlockAdded(LocatedBlock {
                        block: Block::new(1, 1000),
                        offset: 0,
                        length: 0,
                        locations: ["a", "b"]
                            .iter()
                            .map(|n| ReplicaLocation {
                                node: NodeId::from(*n),
                                corrupt: false,
                            })
                            .collect(),
                        corrupt: false,
                    })
                }
                NamespaceCommand::CommitBlock { block, .. } => {
                    NamespaceCommandResponse::Committed { block }
                }
                NamespaceCommand::CloseFile { path } => NamespaceCommandResponse::Closed { path },
                NamespaceCommand::DeleteFile { path } => {
                    NamespaceCommandResponse::Error(format!("file {path} not found"))
                }
            })
        }

        async fn query_blocks(&self, _query: BlocksStateQuery) -> Result<BlocksStateQueryResponse> {
            Ok(match self.located.lock().unwrap().clone() {
                Some(located) => BlocksStateQueryResponse::LocatedBlocks(located),
                None => BlocksStateQueryResponse::NotFound,
            })
        }

        async fn datanode(&self, node: &NodeId, request: DataNodeRequest) -> Result<DataNodeResponse> {
            match request {
                DataNodeRequest::WriteReplica { block, data, .. } => {
                    self.writes.lock().unwrap().push(node.clone());
                    Ok(DataNodeResponse::Written {
                        block,
                        length: data.len() as u64,
                    })
                }
                DataNodeRequest::ReadReplica { block } => {
                    let replicas = self.replicas.lock().unwrap();
                    let (data, checksums) =
                        replicas.get(node).cloned().ok_or_else(|| anyhow!("no route to {node}"))?;
                    Ok(DataNodeResponse::Replica {
                        block,
                        data,
                        checksums,
                    })
                }
                DataNodeRequest::ReadVerified { .. } => {
                    self.verified.lock().unwrap().push(node.clone());
                    Ok(DataNodeResponse::Acknowledged)
                }
            }
        }

        async fn report_corrupt(&self, report: ReportCorruptMessage) -> Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    const DATA: &[u8] = b"the quick brown fox jumps over the lazy dog";

    fn cluster(nodes: &[(&str, Vec<u8>)]) -> FakeCluster {
        let cluster = FakeCluster::default();
        let checksums = Checksums::compute(DATA, 8);
        *cluster.located.lock().unwrap() = Some(LocatedBlocks {
            file_length: DATA.len() as u64,
            under_construction: false,
            blocks: vec![LocatedBlock {
                block: Block::new(1, 1000),
                offset: 0,
                length: DATA.len() as u64,
                locations: nodes
                    .iter()
                    .map(|(node, _)| ReplicaLocation {
                        node: NodeId::from(*node),
                        corrupt: false,
                    })
                    .collect(),
                corrupt: false,
            }],
        });
        for (node, data) in nodes {
            cluster
                .replicas
                .lock()
                .unwrap()
                .insert(NodeId::from(*node), (data.clone(), checksums.clone()));
        }
        cluster
    }

    fn damaged() -> Vec<u8> {
        let mut data = DATA.to_vec();
        data[3] ^= 0x55;
        data
    }

    #[tokio::test]
    async fn corrupt_replica_is_reported_and_skipped() {
        let mut client = PalisadeClient::new(cluster(&[("a", damaged()), ("b", DATA.to_vec())]));
        let data = client.read_file("/f").await.unwrap();
        assert_eq!(data, DATA);

        let reports = client.transport.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].node, NodeId::from("a"));
        assert_eq!(reports[0].reason, CorruptionReason::ChecksumMismatch);
        assert_eq!(reports[0].source, ReportSource::Client);
        assert!(client.blacklist().contains(1, &NodeId::from("a")));
        assert_eq!(*client.transport.verified.lock().unwrap(), vec![NodeId::from("b")]);
    }

    #[tokio::test]
    async fn all_replicas_corrupt_reports_each_once() {
        let mut client = PalisadeClient::new(cluster(&[
            ("a", damaged()),
            ("b", damaged()),
            ("c", DATA[..10].to_vec()),
        ]));
        let err = client.read_file("/f").await.unwrap_err();
        assert!(matches!(err, ClientError::BlockUnreadable { tried: 3, .. }));

        let reasons: Vec<_> =
            client.transport.reports.lock().unwrap().iter().map(|r| r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                CorruptionReason::ChecksumMismatch,
                CorruptionReason::ChecksumMismatch,
                CorruptionReason::Truncated
            ]
        );

        // Retrying the block before a new locations query skips everything
        let located = client.transport.located.lock().unwrap().clone().unwrap();
        let err = client.read_block(&located.blocks[0]).await.unwrap_err();
        assert!(matches!(err, ClientError::BlockUnreadable { tried: 0, .. }));
        assert_eq!(client.transport.reports.lock().unwrap().len(), 3);

        // A fresh locations query clears the blacklist
        client.locate("/f").await.unwrap();
        assert!(client.blacklist().is_empty());
    }

    #[tokio::test]
    async fn unreachable_node_is_not_reported() {
        let fake = cluster(&[("a", DATA.to_vec())]);
        fake.replicas.lock().unwrap().clear();
        let mut client = PalisadeClient::new(fake);
        assert!(matches!(
            client.read_file("/f").await,
            Err(ClientError::BlockUnreadable { tried: 1, .. })
        ));
        assert!(client.transport.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_goes_to_every_pipeline_node_then_commits() {
        let client = PalisadeClient::new(FakeCluster::default());
        let blocks = client.write_file("/f", DATA, 1024, Some(2)).await.unwrap();
        assert_eq!(blocks, vec![Block::new(1, 1000)]);
        assert_eq!(*client.transport.writes.lock().unwrap(), vec![NodeId::from("a"), NodeId::from("b")]);

        let calls = client.transport.namespace.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert!(calls[2].starts_with("CommitBlock"));
        assert!(calls[3].starts_with("CloseFile"));
    }

    #[tokio::test]
    async fn namespace_errors_surface() {
        let client = PalisadeClient::new(FakeCluster::default());
        assert!(matches!(client.delete("/missing").await, Err(ClientError::Namespace(_))));
    }
}
