use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::warn;

use super::serializer::{JsonSerializer, SerializationFormat};
use super::Sink;
use crate::dispatch::Batch;
use crate::{Error, Result};

/// Writes one JSON document per record to standard output.
pub struct StdoutSink {
    out: Mutex<Stdout>,
    serializer: JsonSerializer,
}

impl StdoutSink {
    pub fn new(pretty: bool) -> Self {
        let format = if pretty {
            SerializationFormat::JsonPretty
        } else {
            SerializationFormat::JsonCompact
        };
        Self {
            out: Mutex::new(tokio::io::stdout()),
            serializer: JsonSerializer::new(format),
        }
    }

    fn render(&self, batch: &Batch) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for record in batch.records() {
            buf.extend(self.serializer.serialize(record)?);
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        let buf = self.render(batch)?;
        let mut out = self.out.lock().await;
        out.write_all(&buf).await.map_err(|e| Error::Sink {
            sink: "stdout".to_string(),
            message: e.to_string(),
        })?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.out.lock().await.flush().await {
            warn!(error = %e, "stdout flush on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::{ChangeRecord, ColumnValue, Operation};

    #[test]
    fn test_render_one_line_per_record() {
        let records = (1..=3)
            .map(|i| {
                let mut record = ChangeRecord {
                    operation: Operation::Insert,
                    table: "orders".to_string(),
                    ..Default::default()
                };
                record.push_column("id", ColumnValue::Int(i));
                record
            })
            .collect();

        let sink = StdoutSink::new(false);
        let rendered = sink.render(&Batch::new(records)).unwrap();
        let text = String::from_utf8(rendered).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("\"id\":3"));
    }

    #[tokio::test]
    async fn test_write_then_close() {
        let sink = StdoutSink::new(true);
        sink.write(&Batch::new(Vec::new())).await.unwrap();
        sink.close().await;
        // Closing twice only flushes again.
        sink.close().await;
    }
}
