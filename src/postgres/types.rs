use base64::Engine;
use chrono::NaiveDateTime;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::rules::CaptureRule;
use crate::{Error, Result};

/// Position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::decode(format!("invalid LSN '{}'", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::decode(format!("invalid LSN '{}'", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| Error::decode(format!("invalid LSN '{}'", s)))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Begin,
    Insert,
    Update,
    Delete,
    Commit,
    Unknown,
}

impl Operation {
    /// Maps a test_decoding keyword onto an operation. Unrecognised keywords
    /// (TRUNCATE, logical messages, ...) map to `Unknown`.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "BEGIN" => Operation::Begin,
            "INSERT" => Operation::Insert,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            "COMMIT" => Operation::Commit,
            _ => Operation::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Begin => "BEGIN",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Commit => "COMMIT",
            Operation::Unknown => "UNKNOWN",
        }
    }

    pub fn is_row_change(&self) -> bool {
        matches!(
            self,
            Operation::Insert | Operation::Update | Operation::Delete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(NaiveDateTime),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Text form used for keys and document ids. `None` for nulls.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Bool(b) => Some(b.to_string()),
            ColumnValue::Int(i) => Some(i.to_string()),
            ColumnValue::Float(f) => Some(f.to_string()),
            ColumnValue::Text(s) => Some(s.clone()),
            ColumnValue::Bytes(b) => Some(base64::engine::general_purpose::STANDARD.encode(b)),
            ColumnValue::Json(serde_json::Value::String(s)) => Some(s.clone()),
            ColumnValue::Json(v) => Some(v.to_string()),
            ColumnValue::Timestamp(ts) => Some(ts.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

/// Layout of `timestamp without time zone` values.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_none(),
            ColumnValue::Bool(b) => serializer.serialize_bool(*b),
            ColumnValue::Int(i) => serializer.serialize_i64(*i),
            ColumnValue::Float(f) => serializer.serialize_f64(*f),
            ColumnValue::Text(s) => serializer.serialize_str(s),
            ColumnValue::Bytes(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            ColumnValue::Json(v) => v.serialize(serializer),
            ColumnValue::Timestamp(ts) => {
                serializer.collect_str(&ts.format("%Y-%m-%dT%H:%M:%S%.f"))
            }
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Bool(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

/// One captured row mutation, or a transaction marker.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    #[serde(rename = "op")]
    pub operation: Operation,
    pub schema: String,
    pub table: String,
    #[serde(serialize_with = "serialize_columns")]
    pub columns: Vec<Column>,
    #[serde(rename = "lsn")]
    pub position: Lsn,
    #[serde(rename = "ts_ms")]
    pub captured_at_millis: i64,
    #[serde(rename = "rule", serialize_with = "serialize_rule")]
    pub matched_rule: Option<Arc<CaptureRule>>,
}

impl Default for ChangeRecord {
    fn default() -> Self {
        Self {
            operation: Operation::Unknown,
            schema: String::new(),
            table: String::new(),
            columns: Vec::new(),
            position: Lsn::ZERO,
            captured_at_millis: 0,
            matched_rule: None,
        }
    }
}

impl ChangeRecord {
    /// Clears every field while keeping allocated capacity for reuse.
    pub fn reset(&mut self) {
        self.operation = Operation::Unknown;
        self.schema.clear();
        self.table.clear();
        self.columns.clear();
        self.position = Lsn::ZERO;
        self.captured_at_millis = 0;
        self.matched_rule = None;
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    pub fn push_column(&mut self, name: impl Into<String>, value: ColumnValue) {
        self.columns.push(Column {
            name: name.into(),
            value,
        });
    }

    /// Document id derived from the matched rule's id fields.
    pub fn document_id(&self) -> Option<String> {
        self.matched_rule
            .as_ref()
            .and_then(|rule| rule.document_id(self))
    }

    pub fn qualified_table(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}

fn serialize_columns<S: Serializer>(
    columns: &[Column],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(columns.len()))?;
    for column in columns {
        map.serialize_entry(&column.name, &column.value)?;
    }
    map.end()
}

fn serialize_rule<S: Serializer>(
    rule: &Option<Arc<CaptureRule>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match rule {
        Some(rule) => serializer.serialize_str(&rule.pattern),
        None => serializer.serialize_none(),
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
