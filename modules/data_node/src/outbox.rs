//! Ordered, retrying delivery of reports to the block manager.
//!
//! Corrupt-replica reports and data node events are queued here instead of
//! being published inline, so the verifier and command handlers never block
//! on the bus. A failed publish is retried with linear backoff before the
//! message is dropped; the next full block report repairs anything lost.

use anyhow::Result;
use palisade_common::messages::Message;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Queued message with its destination topic
#[derive(Debug)]
pub struct Envelope {
    pub topic: String,
    pub message: Arc<Message>,
}

#[derive(Clone)]
pub struct ReportOutbox {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl ReportOutbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn send(&self, topic: &str, message: Message) {
        let envelope = Envelope {
            topic: topic.to_string(),
            message: Arc::new(message),
        };
        if self.sender.send(envelope).is_err() {
            error!("Report outbox closed, dropping message for '{topic}'");
        }
    }

    /// Drain the queue in order until every sender is gone
    pub async fn run<F, Fut>(
        mut receiver: mpsc::UnboundedReceiver<Envelope>,
        policy: RetryPolicy,
        mut publish: F,
    ) where
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(envelope) = receiver.recv().await {
            let topic = envelope.topic.clone();
            let message = envelope.message.clone();
            let delivered = deliver_with_retry(policy, || {
                publish(Envelope {
                    topic: topic.clone(),
                    message: message.clone(),
                })
            })
            .await;
            if let Err(e) = delivered {
                error!("Giving up on report to '{topic}': {e:#}");
            }
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted
pub async fn deliver_with_retry<F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = policy.attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if tries < attempts => {
                warn!(tries, "Report delivery failed, retrying: {e:#}");
                tokio::time::sleep(policy.backoff * tries).await;
            }
            Err(e) => return Err(e),
        }
    }
}
