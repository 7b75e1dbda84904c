use async_trait::async_trait;
use futures::future::try_join_all;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key_strategy::KeyStrategy;
use super::serializer::JsonSerializer;
use super::Sink;
use crate::config::KafkaConfig;
use crate::dispatch::Batch;
use crate::postgres::ChangeRecord;
use crate::rules::CaptureRule;
use crate::{Error, Result};

/// Publishes each record as one JSON message.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    key: KeyStrategy,
    serializer: JsonSerializer,
    timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig, rule: &CaptureRule) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("batch.size", config.batch_size.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()?;

        let topic = rule.topic.clone().unwrap_or_else(|| config.topic.clone());
        info!(topic = %topic, rule = %rule.pattern, "kafka sink ready");

        Ok(Self {
            producer,
            topic,
            key: KeyStrategy::parse(&config.key_strategy, rule)?,
            serializer: JsonSerializer::default(),
            timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    fn encode(&self, record: &ChangeRecord) -> Result<(Option<String>, Vec<u8>)> {
        Ok((self.key.extract_key(record), self.serializer.serialize(record)?))
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        let messages = batch
            .records()
            .iter()
            .map(|record| self.encode(record))
            .collect::<Result<Vec<_>>>()?;

        let deliveries = messages.iter().map(|(key, payload)| {
            let mut record = FutureRecord::<str, [u8]>::to(&self.topic).payload(payload.as_slice());
            record.key = key.as_deref();
            self.producer.send(record, Timeout::After(self.timeout))
        });

        try_join_all(deliveries.map(|delivery| async move {
            delivery.await.map(|_| ()).map_err(|(e, _)| Error::Kafka(e))
        }))
        .await?;

        debug!(topic = %self.topic, messages = messages.len(), "batch published");
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(self.timeout)) {
            warn!(topic = %self.topic, error = %e, "kafka flush on close failed");
        }
    }
}
