use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use haven_core::ids::{ChatId, UpdateId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One durably recorded inbound event. Immutable once stored; edits are
/// new rows that supersede the old one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRow {
    pub id: UpdateId,
    pub chat_id: ChatId,
    pub platform_id: String,
    pub dedup_key: String,
    pub revision: u32,
    /// Update this row replaces (set for edits).
    pub supersedes: Option<UpdateId>,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

const SELECT_COLS: &str =
    "id, chat_id, platform_id, dedup_key, revision, supersedes, payload, ingested_at";

pub struct UpdateRepo {
    db: Database,
}

impl UpdateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an update unless its dedup key already exists for the chat.
    /// Returns the new row, or None when a concurrent (or earlier)
    /// ingestion already claimed the key. Uniqueness lives in the
    /// `(chat_id, dedup_key)` index, so two racing paths cannot both
    /// insert; at-least-once delivery collapses to one durable write.
    #[instrument(skip(self, payload), fields(chat_id = %chat_id, dedup_key))]
    pub fn insert_if_new(
        &self,
        chat_id: &ChatId,
        platform_id: &str,
        dedup_key: &str,
        revision: u32,
        supersedes: Option<&UpdateId>,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<UpdateRow>, StoreError> {
        let id = UpdateId::new();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO updates (id, chat_id, platform_id, dedup_key, revision, supersedes, payload, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (chat_id, dedup_key) DO NOTHING",
                rusqlite::params![
                    id.as_str(),
                    chat_id.as_str(),
                    platform_id,
                    dedup_key,
                    revision,
                    supersedes.map(|s| s.as_str()),
                    serde_json::to_string(payload)?,
                    row_helpers::to_ts(&now),
                ],
            )?;

            if inserted == 0 {
                return Ok(None);
            }

            Ok(Some(UpdateRow {
                id: id.clone(),
                chat_id: chat_id.clone(),
                platform_id: platform_id.to_string(),
                dedup_key: dedup_key.to_string(),
                revision,
                supersedes: supersedes.cloned(),
                payload: payload.clone(),
                ingested_at: now,
            }))
        })
    }

    #[instrument(skip(self), fields(chat_id = %chat_id, dedup_key))]
    pub fn find_by_dedup_key(
        &self,
        chat_id: &ChatId,
        dedup_key: &str,
    ) -> Result<Option<UpdateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM updates WHERE chat_id = ?1 AND dedup_key = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![chat_id.as_str(), dedup_key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_update(row)?)),
                None => Ok(None),
            }
        })
    }

    /// The current (highest-revision) update for a platform message.
    #[instrument(skip(self), fields(chat_id = %chat_id, platform_id))]
    pub fn current_for_platform_id(
        &self,
        chat_id: &ChatId,
        platform_id: &str,
    ) -> Result<Option<UpdateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM updates
                 WHERE chat_id = ?1 AND platform_id = ?2
                 ORDER BY revision DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(rusqlite::params![chat_id.as_str(), platform_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_update(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn count(&self, chat_id: &ChatId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM updates WHERE chat_id = ?1",
                [chat_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_update(row: &rusqlite::Row<'_>) -> Result<UpdateRow, StoreError> {
    let payload_str: String = row_helpers::get(row, 6, "updates", "payload")?;
    let ingested: String = row_helpers::get(row, 7, "updates", "ingested_at")?;
    let supersedes: Option<String> = row_helpers::get_opt(row, 5, "updates", "supersedes")?;

    Ok(UpdateRow {
        id: UpdateId::from_raw(row_helpers::get::<String>(row, 0, "updates", "id")?),
        chat_id: ChatId::from_raw(row_helpers::get::<String>(row, 1, "updates", "chat_id")?),
        platform_id: row_helpers::get(row, 2, "updates", "platform_id")?,
        dedup_key: row_helpers::get(row, 3, "updates", "dedup_key")?,
        revision: row_helpers::get(row, 4, "updates", "revision")?,
        supersedes: supersedes.map(UpdateId::from_raw),
        payload: row_helpers::parse_json(&payload_str, "updates", "payload")?,
        ingested_at: row_helpers::parse_datetime(&ingested, "updates", "ingested_at")?,
    })
}
