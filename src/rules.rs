//! Table capture rules and the memoizing matcher that selects them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::TableConfig;
use crate::postgres::ChangeRecord;

/// A table-name pattern, its column allow-list and sink routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRule {
    pub pattern: String,
    pub primary_key: String,
    /// Empty keeps every column.
    pub columns: HashSet<String>,
    pub index: Option<String>,
    pub topic: Option<String>,
    pub id_fields: Vec<String>,
}

impl CaptureRule {
    pub fn new(pattern: impl Into<String>, primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        Self {
            pattern: pattern.into(),
            id_fields: vec![primary_key.clone()],
            primary_key,
            columns: HashSet::new(),
            index: None,
            topic: None,
        }
    }

    pub fn from_table(table: &TableConfig) -> Self {
        let id_fields = if table.id_fields.is_empty() {
            vec![table.primary_key.clone()]
        } else {
            table.id_fields.clone()
        };
        Self {
            pattern: table.name.clone(),
            primary_key: table.primary_key.clone(),
            columns: table.columns.iter().cloned().collect(),
            index: table.index.clone(),
            topic: table.topic.clone(),
            id_fields,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn retains(&self, column: &str) -> bool {
        self.columns.is_empty() || column == self.primary_key || self.columns.contains(column)
    }

    /// Drops every column outside the allow-list. The primary key always stays.
    pub fn project(&self, record: &mut ChangeRecord) {
        if self.columns.is_empty() {
            return;
        }
        record.columns.retain(|c| self.retains(&c.name));
    }

    /// Joins the id fields of a record with `:`. `None` if any field is missing or null.
    pub fn document_id(&self, record: &ChangeRecord) -> Option<String> {
        let mut parts = Vec::with_capacity(self.id_fields.len());
        for field in &self.id_fields {
            parts.push(record.column(field)?.to_key_string()?);
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(":"))
        }
    }
}

/// Glob-style table filter with positive and negative memoization.
pub struct RuleMatcher {
    rules: Vec<Arc<CaptureRule>>,
    hits: HashMap<String, Arc<CaptureRule>>,
    misses: HashSet<String>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<CaptureRule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            hits: HashMap::new(),
            misses: HashSet::new(),
        }
    }

    pub fn rules(&self) -> &[Arc<CaptureRule>] {
        &self.rules
    }

    /// First rule, in declaration order, whose pattern matches `table`.
    pub fn matches(&mut self, table: &str) -> Option<Arc<CaptureRule>> {
        if let Some(rule) = self.hits.get(table) {
            return Some(Arc::clone(rule));
        }
        if self.misses.contains(table) {
            return None;
        }

        match self.rules.iter().find(|r| glob_match(&r.pattern, table)) {
            Some(rule) => {
                debug!(table = %table, rule = %rule.pattern, "table matched capture rule");
                self.hits.insert(table.to_string(), Arc::clone(rule));
                Some(Arc::clone(rule))
            }
            None => {
                debug!(table = %table, "table matches no capture rule");
                self.misses.insert(table.to_string());
                None
            }
        }
    }
}

/// Shell-glob match: `*` is any run (including empty), `?` exactly one character.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0, 0);
    // Position of the last `*` and the name index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some('?') => {
                p += 1;
                n += 1;
            }
            Some(c) if *c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    n = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
