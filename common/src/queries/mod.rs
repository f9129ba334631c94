use crate::messages::Message;
use caryatid_sdk::Context;
use std::sync::Arc;

pub mod blocks;
pub mod utils;
pub mod verifier;

pub fn get_query_topic(context: Arc<Context<Message>>, topic: (&str, &str)) -> String {
    context.config.get_string(topic.0).unwrap_or_else(|_| topic.1.to_string())
}
