//! Delivery targets for dispatched batches.

pub mod kafka;
pub mod key_strategy;
pub mod serializer;
pub mod stdout;

use async_trait::async_trait;

use crate::config::{OutputConfig, SinkKind};
use crate::dispatch::Batch;
use crate::rules::CaptureRule;
use crate::{Error, Result};

pub use kafka::KafkaSink;
pub use key_strategy::KeyStrategy;
pub use serializer::{Envelope, JsonSerializer, SerializationFormat};
pub use stdout::StdoutSink;

/// A destination for change records.
///
/// `write` must either accept the whole batch or fail; a failed batch is
/// offered again later, unchanged.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, batch: &Batch) -> Result<()>;

    /// Flushes and releases resources. Called once at shutdown.
    async fn close(&self) {}
}

/// Instantiates the sinks a capture rule routes to, in configured order.
pub fn build_sinks(
    kinds: &[SinkKind],
    outputs: &OutputConfig,
    rule: &CaptureRule,
) -> Result<Vec<Box<dyn Sink>>> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(kinds.len());
    for kind in kinds {
        match kind {
            SinkKind::Kafka => {
                let config = outputs.kafka.as_ref().ok_or_else(|| {
                    Error::Config(format!(
                        "table '{}' routes to kafka but [output.kafka] is missing",
                        rule.pattern
                    ))
                })?;
                sinks.push(Box::new(KafkaSink::new(config, rule)?));
            }
            SinkKind::Stdout => {
                let pretty = outputs.stdout.as_ref().is_some_and(|s| s.pretty);
                sinks.push(Box::new(StdoutSink::new(pretty)));
            }
        }
    }
    Ok(sinks)
}
