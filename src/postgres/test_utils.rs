//! Builders for `test_decoding` lines used by the decoder tests.

/// A cell as test_decoding prints it.
#[derive(Debug, Clone, Copy)]
pub enum MockValue<'a> {
    /// Numbers and booleans are printed bare.
    Raw(&'a str),
    /// Everything else is single quoted with `'` doubled.
    Quoted(&'a str),
    Null,
    UnchangedToast,
}

/// Mock message builder for one relation.
pub struct MockLineBuilder {
    schema: String,
    table: String,
}

impl MockLineBuilder {
    pub fn new(table: &str) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn insert(&self, columns: &[(&str, &str, MockValue<'_>)]) -> String {
        self.change("INSERT", &format_columns(columns))
    }

    pub fn update(
        &self,
        old_key: &[(&str, &str, MockValue<'_>)],
        new_tuple: &[(&str, &str, MockValue<'_>)],
    ) -> String {
        if old_key.is_empty() {
            return self.change("UPDATE", &format_columns(new_tuple));
        }
        let body = format!(
            "old-key: {} new-tuple: {}",
            format_columns(old_key),
            format_columns(new_tuple)
        );
        self.change("UPDATE", &body)
    }

    pub fn delete(&self, key: &[(&str, &str, MockValue<'_>)]) -> String {
        if key.is_empty() {
            return self.change("DELETE", "(no-tuple-data)");
        }
        self.change("DELETE", &format_columns(key))
    }

    fn change(&self, op: &str, body: &str) -> String {
        format!(
            "table {}.{}: {}: {}",
            quote_ident(&self.schema),
            quote_ident(&self.table),
            op,
            body
        )
    }
}

pub fn begin(xid: u32) -> String {
    format!("BEGIN {}", xid)
}

pub fn commit(xid: u32) -> String {
    format!("COMMIT {}", xid)
}

/// Double-quotes identifiers that are not plain lowercase words.
pub fn quote_ident(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Hex output format of bytea.
pub fn encode_bytea(bytes: &[u8]) -> String {
    let mut out = String::from("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn format_columns(columns: &[(&str, &str, MockValue<'_>)]) -> String {
    columns
        .iter()
        .map(|(name, type_name, value)| {
            let value = match value {
                MockValue::Raw(v) => v.to_string(),
                MockValue::Quoted(v) => format!("'{}'", v.replace('\'', "''")),
                MockValue::Null => "null".to_string(),
                MockValue::UnchangedToast => "unchanged-toast-datum".to_string(),
            };
            format!("{}[{}]:{}", quote_ident(name), type_name, value)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_output() {
        let line = MockLineBuilder::new("orders").insert(&[
            ("id", "integer", MockValue::Raw("1")),
            ("name", "text", MockValue::Quoted("it's")),
        ]);
        assert_eq!(
            line,
            "table public.orders: INSERT: id[integer]:1 name[text]:'it''s'"
        );
        assert_eq!(quote_ident("Order Items"), "\"Order Items\"");
        assert_eq!(encode_bytea(&[0xde, 0xad]), "\\xdead");
    }
}
