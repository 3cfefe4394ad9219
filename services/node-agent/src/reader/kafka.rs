//! Kafka consumer loop and reply producer.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as KafkaMessage, Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    InboundMessage, PartitionRouter, ReaderError, ReplyError, ReplySink, CORRELATION_ID_HEADER,
};
use crate::models::InvocationResponse;

/// How long a reply may wait in the producer queue.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    pub request_topic: String,
    pub commit_interval: Duration,
}

impl InboundMessage {
    fn from_kafka(message: &impl KafkaMessage) -> Self {
        let mut headers = HashMap::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                if let Some(value) = header.value {
                    headers.insert(
                        header.key.to_string(),
                        String::from_utf8_lossy(value).to_string(),
                    );
                }
            }
        }

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).to_string()),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// Consumes the request topic with manual commits.
pub struct KafkaRequestReader {
    consumer: StreamConsumer,
    settings: KafkaSettings,
    router: PartitionRouter,
}

impl KafkaRequestReader {
    pub fn new(settings: KafkaSettings, router: PartitionRouter) -> Result<Self, ReaderError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        Ok(Self {
            consumer,
            settings,
            router,
        })
    }

    /// Consume until shutdown, then flush the last commit offsets.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReaderError> {
        self.consumer.subscribe(&[self.settings.request_topic.as_str()])?;
        info!(
            topic = %self.settings.request_topic,
            group_id = %self.settings.group_id,
            "Request reader subscribed"
        );

        let mut commit_tick = tokio::time::interval(self.settings.commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut assigned: HashSet<i32> = HashSet::new();

        loop {
            tokio::select! {
                received = self.consumer.recv() => {
                    let inbound = match received {
                        Ok(message) => InboundMessage::from_kafka(&message),
                        Err(e) => {
                            warn!(error = %e, "Kafka receive error");
                            continue;
                        }
                    };
                    debug!(
                        partition = inbound.partition,
                        offset = inbound.offset,
                        "Received request"
                    );
                    self.router.route(inbound).await;
                }
                _ = commit_tick.tick() => {
                    self.sync_assignment(&mut assigned, &shutdown);
                    self.flush_commits();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Request reader shutting down");
                        break;
                    }
                }
            }
        }

        self.flush_commits();
        Ok(())
    }

    /// Revoke partitions that left the consumer's assignment.
    fn sync_assignment(&mut self, assigned: &mut HashSet<i32>, shutdown: &watch::Receiver<bool>) {
        let current: HashSet<i32> = match self.consumer.assignment() {
            Ok(list) => list
                .elements()
                .iter()
                .filter(|element| element.topic() == self.settings.request_topic)
                .map(|element| element.partition())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read partition assignment");
                return;
            }
        };

        for partition in assigned.difference(&current) {
            self.router.revoke(*partition, shutdown.clone());
        }
        for partition in current.difference(assigned) {
            info!(partition = partition, "Partition assigned");
        }
        *assigned = current;
    }

    fn flush_commits(&mut self) {
        let positions = self.router.commit_positions();
        if positions.is_empty() {
            return;
        }

        let mut list = TopicPartitionList::new();
        for (partition, offset) in &positions {
            if let Err(e) = list.add_partition_offset(
                &self.settings.request_topic,
                *partition,
                Offset::Offset(*offset),
            ) {
                warn!(partition = partition, offset = offset, error = %e, "Invalid commit offset");
                return;
            }
        }

        match self.consumer.commit(&list, CommitMode::Async) {
            Ok(()) => {
                debug!(positions = ?positions, "Committed offsets");
                self.router.mark_committed(&positions);
            }
            Err(e) => warn!(error = %e, "Failed to commit offsets"),
        }
    }
}

/// Produces function responses to the topic named by each request.
pub struct KafkaReplySink {
    producer: FutureProducer,
}

impl KafkaReplySink {
    pub fn new(brokers: &str) -> Result<Self, ReaderError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl ReplySink for KafkaReplySink {
    async fn send_reply(
        &self,
        topic: &str,
        key: &str,
        correlation_id: &str,
        response: &InvocationResponse,
    ) -> Result<(), ReplyError> {
        let payload = serde_json::to_vec(response).map_err(|e| ReplyError {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        let headers = OwnedHeaders::new().insert(Header {
            key: CORRELATION_ID_HEADER,
            value: Some(correlation_id.as_bytes()),
        });

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, REPLY_TIMEOUT)
            .await
            .map_err(|(e, _)| ReplyError {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic = %topic, correlation_id = %correlation_id, "Produced reply");
        Ok(())
    }
}
