use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use haven_core::ids::{ChatId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRow {
    pub id: ChatId,
    pub platform_ref: String,
    /// Owning user; every context entry for this chat is encrypted with
    /// this user's key.
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(platform_ref, user_id = %user_id))]
    pub fn get_or_create(&self, platform_ref: &str, user_id: &UserId) -> Result<ChatRow, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(row) = query_by_platform(conn, platform_ref)? {
                return Ok(row);
            }

            let id = ChatId::new();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO chats (id, platform_ref, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), platform_ref, user_id.as_str(), row_helpers::to_ts(&now)],
            )?;

            Ok(ChatRow {
                id,
                platform_ref: platform_ref.to_string(),
                user_id: user_id.clone(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(chat_id = %id))]
    pub fn get(&self, id: &ChatId) -> Result<ChatRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, platform_ref, user_id, created_at FROM chats WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_chat(row),
                None => Err(StoreError::NotFound(format!("chat {id}"))),
            }
        })
    }
}

fn query_by_platform(
    conn: &rusqlite::Connection,
    platform_ref: &str,
) -> Result<Option<ChatRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, platform_ref, user_id, created_at FROM chats WHERE platform_ref = ?1",
    )?;
    let mut rows = stmt.query([platform_ref])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_chat(row)?)),
        None => Ok(None),
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> Result<ChatRow, StoreError> {
    let created: String = row_helpers::get(row, 3, "chats", "created_at")?;
    Ok(ChatRow {
        id: ChatId::from_raw(row_helpers::get::<String>(row, 0, "chats", "id")?),
        platform_ref: row_helpers::get(row, 1, "chats", "platform_ref")?,
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "chats", "user_id")?),
        created_at: row_helpers::parse_datetime(&created, "chats", "created_at")?,
    })
}
