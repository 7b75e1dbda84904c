use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::trace;

use super::types::{now_millis, ChangeRecord, ColumnValue, Lsn, Operation, TIMESTAMP_FORMAT};
use crate::pool::RecordPool;
use crate::{Error, Result};

/// Placeholder test_decoding prints for TOASTed values an UPDATE left untouched.
const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

/// Decoder for the textual `test_decoding` output plugin.
///
/// Messages look like:
///
/// ```text
/// BEGIN 529
/// table public.orders: INSERT: id[integer]:1 name[text]:'x'
/// table public.orders: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'y'
/// table public.orders: DELETE: id[integer]:42
/// COMMIT 529
/// ```
pub struct WalDecoder {
    pool: Arc<RecordPool>,
}

impl WalDecoder {
    pub fn new(pool: Arc<RecordPool>) -> Self {
        Self { pool }
    }

    /// Decodes one WAL change message observed at `lsn`.
    ///
    /// Returns `Ok(None)` for empty messages. Unrecognised keywords produce an
    /// `Operation::Unknown` record rather than an error.
    pub fn decode(&self, data: &[u8], lsn: Lsn) -> Result<Option<ChangeRecord>> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::decode(format!("WAL message is not UTF-8: {}", e)))?;
        let text = text.trim_end();
        if text.is_empty() {
            return Ok(None);
        }

        let mut record = self.pool.acquire();
        match parse_message(text, &mut record) {
            Ok(()) => {
                record.position = lsn;
                record.captured_at_millis = now_millis();
                trace!(
                    op = %record.operation,
                    table = %record.table,
                    lsn = %lsn,
                    columns = record.columns.len(),
                    "decoded WAL message"
                );
                Ok(Some(record))
            }
            Err(e) => {
                self.pool.release_one(record);
                Err(e)
            }
        }
    }
}

fn parse_message(text: &str, record: &mut ChangeRecord) -> Result<()> {
    let mut cursor = Cursor::new(text);
    let keyword = cursor.take_word();

    match keyword {
        "BEGIN" => record.operation = Operation::Begin,
        "COMMIT" => record.operation = Operation::Commit,
        "table" => parse_table_change(&mut cursor, record)?,
        _ => record.operation = Operation::Unknown,
    }
    Ok(())
}

fn parse_table_change(cursor: &mut Cursor<'_>, record: &mut ChangeRecord) -> Result<()> {
    cursor.skip_spaces();
    let relation = cursor.take_relation()?;
    split_relation(relation, &mut record.schema, &mut record.table)?;
    if record.table.is_empty() {
        return Err(Error::decode(format!("empty relation in '{}'", cursor.text)));
    }

    cursor.expect(':')?;
    cursor.skip_spaces();
    let keyword = cursor.take_until(':');
    record.operation = Operation::from_keyword(keyword);
    cursor.expect(':')?;

    if !record.operation.is_row_change() {
        return Ok(());
    }
    parse_columns(cursor, record)
}

fn parse_columns(cursor: &mut Cursor<'_>, record: &mut ChangeRecord) -> Result<()> {
    let mut keep = true;

    loop {
        cursor.skip_spaces();
        if cursor.is_empty() {
            return Ok(());
        }
        if cursor.eat("(no-tuple-data)") {
            continue;
        }
        if cursor.eat("old-key:") {
            keep = false;
            continue;
        }
        if cursor.eat("new-tuple:") {
            keep = true;
            continue;
        }

        let name = cursor.take_column_name()?;
        cursor.expect('[')?;
        let type_name = cursor.take_type()?;
        let (raw, quoted) = cursor.take_value()?;

        if !keep || (!quoted && raw == UNCHANGED_TOAST) {
            continue;
        }
        let value = convert_value(&raw, quoted, type_name);
        record.push_column(name, value);
    }
}

/// Splits `schema.table` on the first dot outside double quotes and unquotes both parts.
fn split_relation(relation: &str, schema: &mut String, table: &mut String) -> Result<()> {
    let mut in_quotes = false;
    let mut split = None;
    for (i, c) in relation.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                split = Some(i);
                break;
            }
            _ => {}
        }
    }

    match split {
        Some(i) => {
            unquote_identifier(&relation[..i], schema)?;
            unquote_identifier(&relation[i + 1..], table)?;
        }
        None => unquote_identifier(relation, table)?,
    }
    Ok(())
}

fn unquote_identifier(ident: &str, out: &mut String) -> Result<()> {
    out.clear();
    match ident.strip_prefix('"') {
        Some(inner) => {
            let inner = inner
                .strip_suffix('"')
                .ok_or_else(|| Error::decode(format!("unterminated identifier {}", ident)))?;
            out.push_str(&inner.replace("\"\"", "\""));
        }
        None => out.push_str(ident),
    }
    Ok(())
}

/// Converts a textual cell into a native value using its declared SQL type.
///
/// The unquoted literal `null` is a null of any type. Values that do not
/// parse as their declared type fall back to text.
pub fn convert_value(raw: &str, quoted: bool, type_name: &str) -> ColumnValue {
    if !quoted && raw == "null" {
        return ColumnValue::Null;
    }

    let text = || ColumnValue::Text(raw.to_string());
    match type_name {
        "boolean" => match raw {
            "true" | "t" => ColumnValue::Bool(true),
            "false" | "f" => ColumnValue::Bool(false),
            _ => text(),
        },
        "smallint" | "integer" | "bigint" | "smallserial" | "serial" | "bigserial" | "oid" => raw
            .parse::<i64>()
            .map(ColumnValue::Int)
            .unwrap_or_else(|_| text()),
        "real" | "double precision" | "numeric" | "decimal" | "float" => raw
            .parse::<f64>()
            .map(ColumnValue::Float)
            .unwrap_or_else(|_| text()),
        "json" | "jsonb" => serde_json::from_str(raw)
            .map(ColumnValue::Json)
            .unwrap_or_else(|_| text()),
        "timestamp without time zone" => NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .map(ColumnValue::Timestamp)
            .unwrap_or_else(|_| text()),
        "bytea" => decode_bytea(raw).map(ColumnValue::Bytes).unwrap_or_else(text),
        _ => text(),
    }
}

/// Decodes the `\x`-prefixed hex output format of bytea.
fn decode_bytea(raw: &str) -> Option<Vec<u8>> {
    let hex = raw.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn skip_spaces(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start_matches(' ').len();
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(Error::decode(format!(
                "expected '{}' at offset {} in '{}'",
                c, self.pos, self.text
            )))
        }
    }

    fn take_word(&mut self) -> &'a str {
        let rest = self.rest();
        let end = rest.find(' ').unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn take_until(&mut self, c: char) -> &'a str {
        let rest = self.rest();
        let end = rest.find(c).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    /// Relation name up to the first `:` outside double quotes.
    fn take_relation(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let mut in_quotes = false;
        for (i, c) in rest.char_indices() {
            match c {
                '"' => in_quotes = !in_quotes,
                ':' if !in_quotes => {
                    self.pos += i;
                    return Ok(&rest[..i]);
                }
                _ => {}
            }
        }
        Err(Error::decode(format!("missing operation in '{}'", self.text)))
    }

    fn take_column_name(&mut self) -> Result<String> {
        let rest = self.rest();
        if rest.starts_with('"') {
            let mut name = String::new();
            let mut chars = rest.char_indices().skip(1).peekable();
            while let Some((i, c)) = chars.next() {
                if c == '"' {
                    if matches!(chars.peek(), Some((_, '"'))) {
                        name.push('"');
                        chars.next();
                        continue;
                    }
                    self.pos += i + 1;
                    return Ok(name);
                }
                name.push(c);
            }
            Err(Error::decode(format!(
                "unterminated column name in '{}'",
                self.text
            )))
        } else {
            let end = rest
                .find('[')
                .ok_or_else(|| Error::decode(format!("missing column type in '{}'", self.text)))?;
            self.pos += end;
            Ok(rest[..end].to_string())
        }
    }

    /// Type name between `[` and the `]:` that closes it (array types contain `[]`).
    fn take_type(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find("]:")
            .ok_or_else(|| Error::decode(format!("unterminated column type in '{}'", self.text)))?;
        self.pos += end + 2;
        Ok(&rest[..end])
    }

    /// A single-quoted literal with `''` escapes, or an unquoted run up to the next space.
    fn take_value(&mut self) -> Result<(String, bool)> {
        let rest = self.rest();
        if let Some(body) = rest.strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = body.char_indices().peekable();
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        value.push('\'');
                        chars.next();
                        continue;
                    }
                    self.pos += i + 2;
                    return Ok((value, true));
                }
                value.push(c);
            }
            Err(Error::decode(format!(
                "unterminated string literal in '{}'",
                self.text
            )))
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            if end == 0 {
                return Err(Error::decode(format!(
                    "missing value at offset {} in '{}'",
                    self.pos, self.text
                )));
            }
            self.pos += end;
            Ok((rest[..end].to_string(), false))
        }
    }
}
