use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use haven_core::context::EntryKind;
use haven_core::ids::{ChatId, EntryId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One stored unit of conversation history. Payload is ciphertext; only
/// `plaintext_len` is kept in the clear, for threshold accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextEntryRow {
    pub id: EntryId,
    pub chat_id: ChatId,
    pub session_id: SessionId,
    /// Starting ordinal; for a summary, the start of the replaced range.
    pub ordinal: i64,
    /// End of the covered range (== ordinal for verbatim entries).
    pub ordinal_end: i64,
    pub kind: EntryKind,
    pub ciphertext: String,
    pub plaintext_len: i64,
    pub key_version: u32,
    /// Rewritten out of the current view but retained for audit.
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

/// Verbatim accumulation since the last summary, for trigger evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerbatimStats {
    pub entries: i64,
    pub bytes: i64,
}

const SELECT_COLS: &str = "id, chat_id, session_id, ordinal, ordinal_end, kind, ciphertext,
                           plaintext_len, key_version, superseded, created_at";

pub struct ContextEntryRepo {
    db: Database,
}

impl ContextEntryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a verbatim entry at the next ordinal. Ordinal allocation
    /// and insert happen under one connection lock, so ordinals stay
    /// contiguous; callers serialize per chat for cross-operation order.
    #[instrument(skip(self, ciphertext), fields(chat_id = %chat_id, session_id = %session_id))]
    pub fn append_verbatim(
        &self,
        chat_id: &ChatId,
        session_id: &SessionId,
        ciphertext: &str,
        plaintext_len: i64,
        key_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ContextEntryRow, StoreError> {
        let id = EntryId::new();

        self.db.with_conn(|conn| {
            // Max over every tier, superseded included: replaced ordinals
            // are never reused.
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM context_entries WHERE chat_id = ?1",
                [chat_id.as_str()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO context_entries
                 (id, chat_id, session_id, ordinal, ordinal_end, kind, ciphertext, plaintext_len, key_version, superseded, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, 'verbatim', ?5, ?6, ?7, 0, ?8)",
                rusqlite::params![
                    id.as_str(),
                    chat_id.as_str(),
                    session_id.as_str(),
                    next,
                    ciphertext,
                    plaintext_len,
                    key_version,
                    row_helpers::to_ts(&now),
                ],
            )?;

            Ok(ContextEntryRow {
                id: id.clone(),
                chat_id: chat_id.clone(),
                session_id: session_id.clone(),
                ordinal: next,
                ordinal_end: next,
                kind: EntryKind::Verbatim,
                ciphertext: ciphertext.to_string(),
                plaintext_len,
                key_version,
                superseded: false,
                created_at: now,
            })
        })
    }

    /// The materialized current-context view: at most one summary
    /// followed by trailing verbatim entries, in ordinal order.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn current_view(&self, chat_id: &ChatId) -> Result<Vec<ContextEntryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM context_entries
                 WHERE chat_id = ?1 AND superseded = 0
                 ORDER BY ordinal ASC"
            ))?;
            let mut rows = stmt.query([chat_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// The current summary entry, if one exists.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn current_summary(&self, chat_id: &ChatId) -> Result<Option<ContextEntryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM context_entries
                 WHERE chat_id = ?1 AND kind = 'summary' AND superseded = 0"
            ))?;
            let mut rows = stmt.query([chat_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entry(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Count and plaintext bytes of current verbatim entries, i.e. the
    /// accumulation since the last summary.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn verbatim_stats(&self, chat_id: &ChatId) -> Result<VerbatimStats, StoreError> {
        self.db.with_conn(|conn| {
            let (entries, bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(plaintext_len), 0) FROM context_entries
                 WHERE chat_id = ?1 AND kind = 'verbatim' AND superseded = 0",
                [chat_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(VerbatimStats { entries, bytes })
        })
    }

    /// Rewrite the current view: mark verbatim entries in
    /// [start, end] (plus any prior summary) superseded, and insert one
    /// summary entry covering the range. A single transaction; a failure
    /// anywhere leaves the view untouched.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, ciphertext), fields(chat_id = %chat_id, start, end))]
    pub fn replace_range(
        &self,
        chat_id: &ChatId,
        session_id: &SessionId,
        start: i64,
        end: i64,
        ciphertext: &str,
        plaintext_len: i64,
        key_version: u32,
        now: DateTime<Utc>,
    ) -> Result<ContextEntryRow, StoreError> {
        if start > end {
            return Err(StoreError::Conflict(format!(
                "invalid replace range {start}..{end} for chat {chat_id}"
            )));
        }

        let id = EntryId::new();

        self.db.with_tx(|tx| {
            let replaced = tx.execute(
                "UPDATE context_entries SET superseded = 1
                 WHERE chat_id = ?1 AND superseded = 0
                   AND ((kind = 'verbatim' AND ordinal >= ?2 AND ordinal <= ?3)
                        OR kind = 'summary')",
                rusqlite::params![chat_id.as_str(), start, end],
            )?;
            if replaced == 0 {
                return Err(StoreError::Conflict(format!(
                    "replace range {start}..{end} matched nothing for chat {chat_id}"
                )));
            }

            tx.execute(
                "INSERT INTO context_entries
                 (id, chat_id, session_id, ordinal, ordinal_end, kind, ciphertext, plaintext_len, key_version, superseded, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'summary', ?6, ?7, ?8, 0, ?9)",
                rusqlite::params![
                    id.as_str(),
                    chat_id.as_str(),
                    session_id.as_str(),
                    start,
                    end,
                    ciphertext,
                    plaintext_len,
                    key_version,
                    row_helpers::to_ts(&now),
                ],
            )?;

            Ok(ContextEntryRow {
                id: id.clone(),
                chat_id: chat_id.clone(),
                session_id: session_id.clone(),
                ordinal: start,
                ordinal_end: end,
                kind: EntryKind::Summary,
                ciphertext: ciphertext.to_string(),
                plaintext_len,
                key_version,
                superseded: false,
                created_at: now,
            })
        })
    }

    /// Audit access: the immutable originals a summary replaced. The
    /// ordinal range on a summary entry inverts to exactly these rows.
    #[instrument(skip(self), fields(chat_id = %chat_id, start, end))]
    pub fn superseded_range(
        &self,
        chat_id: &ChatId,
        start: i64,
        end: i64,
    ) -> Result<Vec<ContextEntryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM context_entries
                 WHERE chat_id = ?1 AND kind = 'verbatim' AND superseded = 1
                   AND ordinal >= ?2 AND ordinal <= ?3
                 ORDER BY ordinal ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![chat_id.as_str(), start, end])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Total rows for a chat, every tier included.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn count(&self, chat_id: &ChatId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM context_entries WHERE chat_id = ?1",
                [chat_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ContextEntryRow, StoreError> {
    let kind_str: String = row_helpers::get(row, 5, "context_entries", "kind")?;
    let created: String = row_helpers::get(row, 10, "context_entries", "created_at")?;
    let superseded: i64 = row_helpers::get(row, 9, "context_entries", "superseded")?;

    Ok(ContextEntryRow {
        id: EntryId::from_raw(row_helpers::get::<String>(row, 0, "context_entries", "id")?),
        chat_id: ChatId::from_raw(row_helpers::get::<String>(row, 1, "context_entries", "chat_id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            2,
            "context_entries",
            "session_id",
        )?),
        ordinal: row_helpers::get(row, 3, "context_entries", "ordinal")?,
        ordinal_end: row_helpers::get(row, 4, "context_entries", "ordinal_end")?,
        kind: row_helpers::parse_enum(&kind_str, "context_entries", "kind")?,
        ciphertext: row_helpers::get(row, 6, "context_entries", "ciphertext")?,
        plaintext_len: row_helpers::get(row, 7, "context_entries", "plaintext_len")?,
        key_version: row_helpers::get(row, 8, "context_entries", "key_version")?,
        superseded: superseded != 0,
        created_at: row_helpers::parse_datetime(&created, "context_entries", "created_at")?,
    })
}
