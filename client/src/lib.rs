//! Palisade client
//! Namespace calls, the block write pipeline and checksum-verified reads.
//! A replica that fails verification on read is reported to the block
//! manager and skipped by this client until its next locations query.

pub mod blacklist;
pub mod bus;
pub mod client;
pub mod transport;

pub use blacklist::ReadBlacklist;
pub use bus::{BusTransport, ClientTopics};
pub use client::{ClientError, PalisadeClient};
pub use transport::ClusterTransport;
