use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
}

/// Filters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub chat_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Record about to be written; id is assigned by the database.
struct NewLogRecord {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    chat_id: Option<String>,
    user_id: Option<String>,
}

/// SQLite sink holding warn+ records for operator attention. Failures
/// that exhaust their retry budget end up queryable here.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

const LOG_DDL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    span_id TEXT,
    chat_id TEXT,
    user_id TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_chat ON logs(chat_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(LOG_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Best-effort write; a failing log sink must never take down the
    /// caller's operation.
    fn store(&self, record: &NewLogRecord) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, chat_id, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.chat_id,
                record.user_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses: Vec<(&str, Box<dyn rusqlite::types::ToSql>)> = Vec::new();
        if let Some(level) = &q.level {
            clauses.push(("level = ", Box::new(level.clone())));
        }
        if let Some(target) = &q.target {
            clauses.push(("target LIKE ", Box::new(format!("%{target}%"))));
        }
        if let Some(chat_id) = &q.chat_id {
            clauses.push(("chat_id = ", Box::new(chat_id.clone())));
        }
        if let Some(since) = &q.since {
            clauses.push(("timestamp >= ", Box::new(since.clone())));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, chat_id, user_id
             FROM logs WHERE 1=1",
        );
        for (i, (clause, _)) in clauses.iter().enumerate() {
            sql.push_str(&format!(" AND {clause}?{}", i + 1));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::types::ToSql> =
            clauses.iter().map(|(_, p)| p.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                chat_id: row.get(7)?,
                user_id: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing Layer that routes warn+ events into the sink.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Extracts the message, chat/user correlation ids, and remaining fields
/// from a tracing event or span.
struct FieldVisitor {
    message: Option<String>,
    chat_id: Option<String>,
    user_id: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            chat_id: None,
            user_id: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Route well-known field names to their slots; everything else
    /// lands in the JSON bag.
    fn assign(&mut self, name: &str, value: serde_json::Value) {
        let as_text = || match &value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string().trim_matches('"').to_string(),
        };
        match name {
            "message" => self.message = Some(as_text()),
            "chat_id" => self.chat_id = Some(as_text()),
            "user_id" => self.user_id = Some(as_text()),
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }

    fn fields_json(&self) -> Option<String> {
        if self.fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&self.fields).unwrap_or_default())
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        let trimmed = rendered.trim_matches('"').to_string();
        self.assign(field.name(), serde_json::Value::String(trimmed));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.assign(field.name(), serde_json::Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.assign(field.name(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.assign(field.name(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.assign(field.name(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.assign(field.name(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit chat/user correlation.
struct SpanFields {
    chat_id: Option<String>,
    user_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only warn+ records reach the operator path.
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        // Inherit correlation ids from enclosing spans when the event
        // itself did not carry them.
        if visitor.chat_id.is_none() || visitor.user_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(inherited) = extensions.get::<SpanFields>() {
                        if visitor.chat_id.is_none() {
                            visitor.chat_id.clone_from(&inherited.chat_id);
                        }
                        if visitor.user_id.is_none() {
                            visitor.user_id.clone_from(&inherited.user_id);
                        }
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        self.sink.store(&NewLogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.clone().unwrap_or_default(),
            fields: visitor.fields_json(),
            span_id,
            chat_id: visitor.chat_id,
            user_id: visitor.user_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if visitor.chat_id.is_some() || visitor.user_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    chat_id: visitor.chat_id,
                    user_id: visitor.user_id,
                });
            }
        }
    }
}
