use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use haven_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub platform_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user key-derivation metadata. The symmetric key itself is never
/// stored, only what is needed to derive it on demand.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    pub user_id: UserId,
    pub salt: Vec<u8>,
    pub version: u32,
    pub rotated_at: Option<DateTime<Utc>>,
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Look up a user by platform reference, creating the row and its key
    /// record (with the supplied salt) on first contact. The salt is only
    /// used for creation; an existing record's salt is immutable.
    #[instrument(skip(self, salt), fields(platform_ref))]
    pub fn get_or_create(&self, platform_ref: &str, salt: &[u8]) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(row) = query_by_platform(conn, platform_ref)? {
                return Ok(row);
            }

            let id = UserId::new();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO users (id, platform_ref, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), platform_ref, row_helpers::to_ts(&now), row_helpers::to_ts(&now)],
            )?;
            conn.execute(
                "INSERT INTO key_records (user_id, salt, version) VALUES (?1, ?2, 1)",
                rusqlite::params![
                    id.as_str(),
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, salt),
                ],
            )?;

            Ok(UserRow {
                id,
                platform_ref: platform_ref.to_string(),
                created_at: now,
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, platform_ref, created_at, updated_at FROM users WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    /// Fetch the key record for a user. Absence means key material was
    /// never provisioned; callers surface that as fatal for the user.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn key_record(&self, id: &UserId) -> Result<Option<KeyRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, salt, version, rotated_at FROM key_records WHERE user_id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_key_record(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Bump the derivation version and stamp the rotation time. Existing
    /// entries remain decryptable via their recorded per-entry version.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn bump_key_version(&self, id: &UserId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::to_ts(&Utc::now());
            let changed = conn.execute(
                "UPDATE key_records SET version = version + 1, rotated_at = ?1 WHERE user_id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("key record for user {id}")));
            }
            let version: u32 = conn.query_row(
                "SELECT version FROM key_records WHERE user_id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(version)
        })
    }
}

fn query_by_platform(
    conn: &rusqlite::Connection,
    platform_ref: &str,
) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, platform_ref, created_at, updated_at FROM users WHERE platform_ref = ?1",
    )?;
    let mut rows = stmt.query([platform_ref])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_user(row)?)),
        None => Ok(None),
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    let created: String = row_helpers::get(row, 2, "users", "created_at")?;
    let updated: String = row_helpers::get(row, 3, "users", "updated_at")?;
    Ok(UserRow {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        platform_ref: row_helpers::get(row, 1, "users", "platform_ref")?,
        created_at: row_helpers::parse_datetime(&created, "users", "created_at")?,
        updated_at: row_helpers::parse_datetime(&updated, "users", "updated_at")?,
    })
}

fn row_to_key_record(row: &rusqlite::Row<'_>) -> Result<KeyRecord, StoreError> {
    let salt_b64: String = row_helpers::get(row, 1, "key_records", "salt")?;
    let salt = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &salt_b64)
        .map_err(|e| StoreError::CorruptRow {
            table: "key_records",
            column: "salt",
            detail: format!("invalid base64: {e}"),
        })?;
    let rotated: Option<String> = row_helpers::get_opt(row, 3, "key_records", "rotated_at")?;
    Ok(KeyRecord {
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 0, "key_records", "user_id")?),
        salt,
        version: row_helpers::get(row, 2, "key_records", "version")?,
        rotated_at: rotated
            .map(|r| row_helpers::parse_datetime(&r, "key_records", "rotated_at"))
            .transpose()?,
    })
}
