//! Request reader: consumes invocations, dispatches them to VMs and
//! commits offsets.
//!
//! ```text
//! KafkaRequestReader (poll loop, commit tick, assignment changes)
//!   └── PartitionRouter
//!         └── one worker per partition: OffsetManager slot, concurrency permit
//!               └── Dispatcher task per message: lease VM, boot if cold,
//!                   queue for the VM, await response, produce reply
//! ```
//!
//! A failed message is never acknowledged, so the partition's commit cursor
//! stops at it and the message is redelivered after a restart.

mod dispatcher;
mod kafka;
mod partitions;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{InvocationRequest, InvocationResponse};

pub use dispatcher::{DispatchError, Dispatcher};
pub use kafka::{KafkaReplySink, KafkaRequestReader, KafkaSettings};
pub use partitions::{PartitionRouter, RouterConfig};

/// Header carrying the id that links a request to its reply.
pub const CORRELATION_ID_HEADER: &str = "correlationId";
/// Header naming the topic the reply goes to.
pub const REPLY_TO_HEADER: &str = "replyTo";

/// Errors from the consumer loop.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Failure to produce a reply.
#[derive(Debug, Error)]
#[error("failed to produce reply to {topic}: {message}")]
pub struct ReplyError {
    pub topic: String,
    pub message: String,
}

/// Failure of a request enricher.
#[derive(Debug, Error)]
#[error("enricher {enricher} failed: {message}")]
pub struct EnrichError {
    pub enricher: String,
    pub message: String,
}

/// A consumed message, detached from the consumer.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Non-empty header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Destination of function responses.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Produce `response` to `topic`, keyed by `key`, tagged with `correlation_id`.
    async fn send_reply(
        &self,
        topic: &str,
        key: &str,
        correlation_id: &str,
        response: &InvocationResponse,
    ) -> Result<(), ReplyError>;
}

/// Processes one message to completion.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), DispatchError>;
}

/// Fills in request fields before dispatch.
///
/// The dispatcher runs its enrichers in order; each one sees the output of
/// the previous one and only applies when [`RequestEnricher::can_enrich`]
/// accepts the request.
#[async_trait]
pub trait RequestEnricher: Send + Sync {
    fn name(&self) -> &str;

    fn can_enrich(&self, request: &InvocationRequest) -> bool;

    async fn enrich(&self, request: &mut InvocationRequest) -> Result<(), EnrichError>;
}
