//! Historical backfill from a consistent dump.
//!
//! When a slot is freshly created the server exports a snapshot of the
//! slot's consistent point. `pg_dump --snapshot=<id>` then sees exactly the
//! rows that predate the first streamed change. Its `--column-inserts`
//! output is parsed line by line while the process runs and every row is
//! pushed through the stream's transaction buffer as an INSERT.

use sqlparser::ast::{Expr, ObjectName, SetExpr, Statement, UnaryOperator, Value, Values};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::pool::RecordPool;
use crate::postgres::{now_millis, ChangeRecord, ColumnValue, Lsn, Operation};
use crate::transaction::TransactionBuffer;
use crate::{Error, Result};

const DEFAULT_DUMP_UTILITY: &str = "pg_dump";

pub struct SnapshotBootstrapper {
    dump_path: PathBuf,
    params: PostgresConfig,
    tables: Vec<String>,
    pool: Arc<RecordPool>,
}

impl SnapshotBootstrapper {
    pub fn new(
        dump_path: PathBuf,
        params: PostgresConfig,
        tables: Vec<String>,
        pool: Arc<RecordPool>,
    ) -> Self {
        Self {
            dump_path,
            params,
            tables,
            pool,
        }
    }

    /// Resolves the configured dump utility, or `pg_dump`, against `PATH`.
    pub fn resolve_dump_path(configured: Option<&str>) -> Result<PathBuf> {
        let name = configured
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_DUMP_UTILITY);
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        resolve_in(name, &path_var).ok_or_else(|| Error::Snapshot {
            message: format!("dump utility '{}' not found", name),
        })
    }

    pub fn command_args(&self, snapshot: &str) -> Vec<String> {
        let mut args = vec![
            format!("--host={}", self.params.host),
            format!("--port={}", self.params.port),
            format!("--username={}", self.params.username),
            "--no-password".to_string(),
            "--data-only".to_string(),
            "--column-inserts".to_string(),
        ];
        args.extend(self.tables.iter().map(|t| format!("--table={}", t)));
        args.push(format!("--snapshot={}", snapshot));
        args.push(self.params.database.clone());
        args
    }

    /// Dumps the snapshot into `buffer`, returning the number of rows parsed.
    ///
    /// A malformed statement is logged and skipped; a failing dump process
    /// is an error.
    pub async fn run(&self, snapshot: &str, buffer: &mut TransactionBuffer) -> Result<u64> {
        info!(
            dump = %self.dump_path.display(),
            snapshot = %snapshot,
            tables = ?self.tables,
            "starting historical snapshot"
        );

        let mut command = Command::new(&self.dump_path);
        command
            .args(self.command_args(snapshot))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if !self.params.password.is_empty() {
            command.env("PGPASSWORD", &self.params.password);
        }

        let mut child = command.spawn().map_err(|e| Error::Snapshot {
            message: format!("failed to spawn {}: {}", self.dump_path.display(), e),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Snapshot {
            message: "dump stdout is not piped".to_string(),
        })?;

        let mut lines = LinesStream::new(BufReader::new(stdout).lines());
        let mut accumulator = StatementAccumulator::default();
        let mut rows: u64 = 0;
        let mut skipped: u64 = 0;

        while let Some(line) = lines.next().await {
            let Some(statement) = accumulator.push_line(&line?) else {
                continue;
            };

            let mut record = self.pool.acquire();
            match DumpParser::parse_statement(&statement, &mut record) {
                Ok(()) => {
                    rows += 1;
                    buffer.push(record).await?;
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping unparsable dump statement");
                    self.pool.release_one(record);
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::Snapshot {
                message: format!("{} exited with {}", self.dump_path.display(), status),
            });
        }
        if accumulator.is_pending() {
            warn!("dump ended inside an unterminated statement");
        }

        buffer.flush().await?;
        info!(rows, skipped, "historical snapshot finished");
        Ok(rows)
    }
}

fn resolve_in(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

/// Joins dump output lines into complete `INSERT` statements.
///
/// A string literal may span lines, so a statement ends only at a `;` that
/// closes a line outside quotes. Lines that do not start an INSERT are ignored.
#[derive(Debug, Default)]
pub struct StatementAccumulator {
    buffer: String,
    in_quote: bool,
}

impl StatementAccumulator {
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if self.buffer.is_empty() {
            if !line.starts_with("INSERT") {
                return None;
            }
        } else {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);

        for c in line.chars() {
            if c == '\'' {
                self.in_quote = !self.in_quote;
            }
        }

        if !self.in_quote && line.trim_end().ends_with(';') {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

pub struct DumpParser;

impl DumpParser {
    /// Parses one `INSERT INTO schema.table (cols) VALUES (...)` statement
    /// into `record`.
    pub fn parse_statement(sql: &str, record: &mut ChangeRecord) -> Result<()> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| Error::decode(format!("{}: {}", e, sql)))?;

        let Some(Statement::Insert {
            table_name,
            columns,
            source,
            ..
        }) = statements.into_iter().next()
        else {
            return Err(Error::decode(format!("not an INSERT statement: {}", sql)));
        };

        let SetExpr::Values(Values { rows, .. }) = *source.body else {
            return Err(Error::decode(format!("INSERT without VALUES: {}", sql)));
        };
        let Some(row) = rows.into_iter().next() else {
            return Err(Error::decode(format!("INSERT without rows: {}", sql)));
        };
        if columns.len() != row.len() {
            return Err(Error::decode(format!(
                "{} columns but {} values: {}",
                columns.len(),
                row.len(),
                sql
            )));
        }

        record.reset();
        split_object_name(&table_name, &mut record.schema, &mut record.table);
        for (column, expr) in columns.into_iter().zip(row) {
            let value = literal_value(expr)
                .ok_or_else(|| Error::decode(format!("unsupported value for {}", column.value)))?;
            record.push_column(column.value, value);
        }
        record.operation = Operation::Insert;
        record.position = Lsn::ZERO;
        record.captured_at_millis = now_millis();

        debug!(table = %record.table, columns = record.columns.len(), "parsed dump row");
        Ok(())
    }
}

fn split_object_name(name: &ObjectName, schema: &mut String, table: &mut String) {
    let parts = &name.0;
    if let Some(last) = parts.last() {
        table.push_str(&last.value);
    }
    if parts.len() >= 2 {
        schema.push_str(&parts[parts.len() - 2].value);
    }
}

fn literal_value(expr: Expr) -> Option<ColumnValue> {
    match expr {
        Expr::Value(value) => match value {
            Value::Null => Some(ColumnValue::Null),
            Value::Boolean(b) => Some(ColumnValue::Bool(b)),
            Value::Number(n, _) => Some(number_value(&n)),
            Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s) => {
                Some(ColumnValue::Text(s))
            }
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal_value(*expr)? {
            ColumnValue::Int(i) => Some(ColumnValue::Int(-i)),
            ColumnValue::Float(f) => Some(ColumnValue::Float(-f)),
            _ => None,
        },
        Expr::Cast { expr, .. } => literal_value(*expr),
        Expr::Nested(expr) => literal_value(*expr),
        _ => None,
    }
}

fn number_value(n: &str) -> ColumnValue {
    if let Ok(i) = n.parse::<i64>() {
        return ColumnValue::Int(i);
    }
    n.parse::<f64>()
        .map(ColumnValue::Float)
        .unwrap_or_else(|_| ColumnValue::Text(n.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> Result<ChangeRecord> {
        let mut record = ChangeRecord::default();
        DumpParser::parse_statement(sql, &mut record).map(|_| record)
    }

    #[test]
    fn test_parse_insert_statement() {
        let record = parse(
            "INSERT INTO public.orders (id, status, amount, paid, note, delta) \
             VALUES (42, 'it''s paid', 19.99, true, NULL, -3);",
        )
        .unwrap();

        assert_eq!(record.operation, Operation::Insert);
        assert_eq!(record.position, Lsn::ZERO);
        assert_eq!(record.schema, "public");
        assert_eq!(record.table, "orders");
        assert_eq!(record.column("id"), Some(&ColumnValue::Int(42)));
        assert_eq!(record.column("status"), Some(&ColumnValue::from("it's paid")));
        assert_eq!(record.column("amount"), Some(&ColumnValue::Float(19.99)));
        assert_eq!(record.column("paid"), Some(&ColumnValue::Bool(true)));
        assert_eq!(record.column("note"), Some(&ColumnValue::Null));
        assert_eq!(record.column("delta"), Some(&ColumnValue::Int(-3)));
    }

    #[test]
    fn test_parse_quoted_identifiers() {
        let record =
            parse(r#"INSERT INTO "Sales"."Order Items" ("Line No", sku) VALUES (1, 'A-1');"#)
                .unwrap();
        assert_eq!(record.schema, "Sales");
        assert_eq!(record.table, "Order Items");
        assert_eq!(record.column("Line No"), Some(&ColumnValue::Int(1)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("INSERT INTO orders (id) VALUES (;").is_err());
        assert!(parse("INSERT INTO orders (id, name) VALUES (1);").is_err());
        assert!(parse("SELECT pg_catalog.setval('orders_id_seq', 42, true);").is_err());
        assert!(parse("INSERT INTO orders (id) SELECT 1;").is_err());
    }

    #[test]
    fn test_accumulator_single_and_multi_line() {
        let mut acc = StatementAccumulator::default();
        assert!(acc.push_line("SET statement_timeout = 0;").is_none());
        assert!(acc.push_line("").is_none());
        assert!(!acc.is_pending());

        let stmt = acc.push_line("INSERT INTO public.t (id) VALUES (1);").unwrap();
        assert_eq!(stmt, "INSERT INTO public.t (id) VALUES (1);");

        assert!(acc
            .push_line("INSERT INTO public.t (id, body) VALUES (2, 'first line;")
            .is_none());
        assert!(acc.is_pending());
        assert!(acc.push_line("still; quoted").is_none());
        assert!(acc.push_line("done');").is_some());
        assert!(!acc.is_pending());
    }

    #[test]
    fn test_multi_line_literal_round_trip() {
        let mut acc = StatementAccumulator::default();
        assert!(acc
            .push_line("INSERT INTO public.t (id, body) VALUES (2, 'first line;")
            .is_none());
        let stmt = acc.push_line("second line');").unwrap();
        assert!(!acc.is_pending());

        let record = parse(&stmt).unwrap();
        assert_eq!(
            record.column("body"),
            Some(&ColumnValue::from("first line;\nsecond line"))
        );
    }

    #[test]
    fn test_command_args() {
        let params = PostgresConfig {
            host: "db.internal".to_string(),
            port: 5433,
            database: "shop".to_string(),
            username: "replicator".to_string(),
            password: "secret".to_string(),
            connect_timeout_secs: 30,
        };
        let bootstrapper = SnapshotBootstrapper::new(
            PathBuf::from("/usr/bin/pg_dump"),
            params,
            vec!["orders*".to_string()],
            Arc::new(RecordPool::new(8)),
        );

        let args = bootstrapper.command_args("00000003-00000002-1");
        assert_eq!(
            args,
            vec![
                "--host=db.internal",
                "--port=5433",
                "--username=replicator",
                "--no-password",
                "--data-only",
                "--column-inserts",
                "--table=orders*",
                "--snapshot=00000003-00000002-1",
                "shop",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[derive(Clone, Default)]
    struct CollectedIds(Arc<parking_lot::Mutex<Vec<Option<ColumnValue>>>>);

    #[async_trait::async_trait]
    impl crate::sink::Sink for CollectedIds {
        fn name(&self) -> &str {
            "ids"
        }

        async fn write(&self, batch: &crate::dispatch::Batch) -> Result<()> {
            self.0
                .lock()
                .extend(batch.records().iter().map(|r| r.column("id").cloned()));
            Ok(())
        }
    }

    #[cfg(unix)]
    fn dump_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn bootstrap_buffer(
        ids: &CollectedIds,
    ) -> (
        TransactionBuffer,
        crate::dispatch::DispatchScheduler,
        Arc<RecordPool>,
    ) {
        let pool = Arc::new(RecordPool::new(64));
        let scheduler = crate::dispatch::DispatchScheduler::start(
            vec![Box::new(ids.clone())],
            &crate::config::DispatchConfig::default(),
            Arc::clone(&pool),
            Box::new(|_| {}),
        );
        let matcher = crate::rules::RuleMatcher::new(vec![crate::rules::CaptureRule::new("orders", "id")]);
        let buffer = TransactionBuffer::new(matcher, scheduler.handle(), Arc::clone(&pool), 1000);
        (buffer, scheduler, pool)
    }

    fn params() -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "shop".to_string(),
            username: "replicator".to_string(),
            password: String::new(),
            connect_timeout_secs: 1,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_skips_malformed_statements() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dump_script(
            dir.path(),
            "dump_ok",
            "cat <<'SQL'\n\
             SET statement_timeout = 0;\n\
             INSERT INTO public.orders (id) VALUES (1);\n\
             INSERT INTO public.orders (id) VALUES (;\n\
             INSERT INTO public.orders (id) VALUES (2);\n\
             SQL\n",
        );

        let ids = CollectedIds::default();
        let (mut buffer, scheduler, pool) = bootstrap_buffer(&ids);
        let bootstrapper =
            SnapshotBootstrapper::new(tool, params(), vec!["orders".to_string()], pool);

        let rows = bootstrapper.run("00000003-00000002-1", &mut buffer).await.unwrap();
        assert_eq!(rows, 2);
        assert!(buffer.is_empty());

        scheduler.stop().await.unwrap();
        assert_eq!(
            *ids.0.lock(),
            vec![Some(ColumnValue::Int(1)), Some(ColumnValue::Int(2))]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_fails_when_dump_exits_nonzero() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dump_script(
            dir.path(),
            "dump_fail",
            "echo 'INSERT INTO public.orders (id) VALUES (7);'\nexit 3\n",
        );

        let ids = CollectedIds::default();
        let (mut buffer, scheduler, pool) = bootstrap_buffer(&ids);
        let bootstrapper =
            SnapshotBootstrapper::new(tool, params(), vec!["orders".to_string()], pool);

        let err = bootstrapper
            .run("00000003-00000002-1", &mut buffer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Snapshot { .. }), "unexpected error {:?}", err);

        // The partial export is never committed.
        assert_eq!(buffer.discard(), 1);
        scheduler.stop().await.unwrap();
        assert!(ids.0.lock().is_empty());
    }

    #[test]
    fn test_resolve_dump_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("pg_dump");
        std::fs::write(&tool, b"#!/bin/sh\n").unwrap();

        let path_var = std::env::join_paths([dir.path()]).unwrap();
        assert_eq!(resolve_in("pg_dump", &path_var), Some(tool.clone()));
        assert_eq!(resolve_in("pg_restore", &path_var), None);
        assert_eq!(resolve_in(tool.to_str().unwrap(), &path_var), Some(tool));
        assert!(SnapshotBootstrapper::resolve_dump_path(Some("/nonexistent/pg_dump")).is_err());
    }
}
