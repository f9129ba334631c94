use anyhow::{anyhow, Result};
use caryatid_sdk::Context;
use std::sync::Arc;

use crate::messages::Message;

/// Send a request on `topic` and pull the expected payload out of the response
pub async fn query_state<T, F>(
    context: &Arc<Context<Message>>,
    topic: &str,
    request_msg: Arc<Message>,
    extractor: F,
) -> Result<T>
where
    F: FnOnce(Message) -> Option<Result<T>>,
{
    let raw_msg = context.message_bus.request(topic, request_msg).await?;
    let message = Arc::try_unwrap(raw_msg).unwrap_or_else(|arc| (*arc).clone());

    extractor(message)
        .unwrap_or_else(|| Err(anyhow!("Unexpected response message type while calling {topic}")))
}
