use serde::Serialize;

use crate::postgres::ChangeRecord;
use crate::Result;

/// The JSON document emitted per record: the record's own fields plus its
/// document id under `pk`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(flatten)]
    pub record: &'a ChangeRecord,
    pub pk: Option<String>,
}

impl<'a> Envelope<'a> {
    pub fn new(record: &'a ChangeRecord) -> Self {
        Self {
            record,
            pk: record.document_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializationFormat {
    #[default]
    JsonCompact,
    JsonPretty,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    format: SerializationFormat,
}

impl JsonSerializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn serialize(&self, record: &ChangeRecord) -> Result<Vec<u8>> {
        let envelope = Envelope::new(record);
        let bytes = match self.format {
            SerializationFormat::JsonCompact => serde_json::to_vec(&envelope)?,
            SerializationFormat::JsonPretty => serde_json::to_vec_pretty(&envelope)?,
        };
        Ok(bytes)
    }
}
