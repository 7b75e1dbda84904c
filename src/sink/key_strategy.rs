use serde_json::Value;
use tracing::debug;

use crate::postgres::{ChangeRecord, ColumnValue};
use crate::rules::CaptureRule;
use crate::{Error, Result};

/// How a message key is derived from a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum KeyStrategy {
    TableName,
    /// Column values joined with `:`.
    PrimaryKey(Vec<String>),
    /// Dotted path into a JSON column, e.g. `payload.customer.id`.
    FieldPath(String),
    #[default]
    None,
}

impl KeyStrategy {
    /// Parses `id`, `table`, `none` or `field:<path>`. `id` uses the rule's id fields.
    pub fn parse(spec: &str, rule: &CaptureRule) -> Result<Self> {
        match spec {
            "id" => Ok(KeyStrategy::PrimaryKey(rule.id_fields.clone())),
            "table" => Ok(KeyStrategy::TableName),
            "none" => Ok(KeyStrategy::None),
            _ => match spec.strip_prefix("field:") {
                Some(path) if !path.is_empty() => Ok(KeyStrategy::FieldPath(path.to_string())),
                _ => Err(Error::Config(format!("unknown key strategy '{}'", spec))),
            },
        }
    }

    pub fn extract_key(&self, record: &ChangeRecord) -> Option<String> {
        match self {
            KeyStrategy::TableName => Some(record.qualified_table()),
            KeyStrategy::PrimaryKey(columns) => extract_composite_key(record, columns),
            KeyStrategy::FieldPath(path) => extract_field_value(record, path),
            KeyStrategy::None => None,
        }
    }
}

fn extract_field_value(record: &ChangeRecord, field_path: &str) -> Option<String> {
    let mut parts = field_path.split('.');
    let column = parts.next()?;
    let value = match record.column(column) {
        Some(value) => value,
        None => {
            debug!("Field '{}' not found in record", column);
            return None;
        }
    };

    let mut current = match value {
        ColumnValue::Json(json) => json,
        other => {
            // Only JSON columns have nested fields.
            return match parts.next() {
                Some(_) => None,
                None => other.to_key_string(),
            };
        }
    };
    for part in parts {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in record", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => Some(current.to_string()),
    }
}

fn extract_composite_key(record: &ChangeRecord, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        match record.column(field).and_then(ColumnValue::to_key_string) {
            Some(value) => key_parts.push(value),
            None => {
                debug!("Missing field '{}' for composite key", field);
                return None;
            }
        }
    }

    if key_parts.is_empty() {
        None
    } else {
        Some(key_parts.join(":"))
    }
}
