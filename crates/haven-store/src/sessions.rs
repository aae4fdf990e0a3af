use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use haven_core::ids::{ChatId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub chat_id: ChatId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub idled_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// User messages only; bot replies and edits don't count.
    pub message_count: u32,
    pub last_user_activity: Option<DateTime<Utc>>,
    pub last_bot_activity: Option<DateTime<Utc>>,
}

const SELECT_COLS: &str = "id, chat_id, state, started_at, last_active_at, idled_at, closed_at,
                           message_count, last_user_activity, last_bot_activity";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Allocate a new session for a chat. The storage layer enforces at
    /// most one non-closed session per chat; a second open session is a
    /// Conflict, not a silent overwrite.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn create(&self, chat_id: &ChatId, now: DateTime<Utc>) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, chat_id, state, started_at, last_active_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)",
                rusqlite::params![id.as_str(), chat_id.as_str(), row_helpers::to_ts(&now)],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("chat {chat_id} already has an open session"))
                }
                other => StoreError::Database(other.to_string()),
            })?;

            Ok(SessionRow {
                id: id.clone(),
                chat_id: chat_id.clone(),
                state: SessionState::Active,
                started_at: now,
                last_active_at: now,
                idled_at: None,
                closed_at: None,
                message_count: 0,
                last_user_activity: None,
                last_bot_activity: None,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// The current non-closed session for a chat, if any.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn open_for_chat(&self, chat_id: &ChatId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions WHERE chat_id = ?1 AND state != 'closed'"
            ))?;
            let mut rows = stmt.query([chat_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Record activity on a session. User messages bump the message
    /// count; edits and bot replies only move the activity clocks.
    #[instrument(skip(self), fields(session_id = %id, is_user, counts_message))]
    pub fn record_activity(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
        is_user: bool,
        counts_message: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let ts = row_helpers::to_ts(&now);
            let activity_col = if is_user { "last_user_activity" } else { "last_bot_activity" };
            let bump = if is_user && counts_message { 1 } else { 0 };
            let changed = conn.execute(
                &format!(
                    "UPDATE sessions SET last_active_at = MAX(last_active_at, ?1),
                            {activity_col} = MAX(COALESCE({activity_col}, ?1), ?1),
                            message_count = message_count + ?2
                     WHERE id = ?3"
                ),
                rusqlite::params![ts, bump, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Write a new state, stamping the matching lifecycle timestamp.
    #[instrument(skip(self), fields(session_id = %id, state = %state))]
    pub fn set_state(
        &self,
        id: &SessionId,
        state: SessionState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let ts = row_helpers::to_ts(&now);
            let changed = match state {
                SessionState::Active => conn.execute(
                    "UPDATE sessions SET state = 'active', idled_at = NULL, last_active_at = MAX(last_active_at, ?1)
                     WHERE id = ?2",
                    rusqlite::params![ts, id.as_str()],
                )?,
                SessionState::Idle => conn.execute(
                    "UPDATE sessions SET state = 'idle', idled_at = ?1 WHERE id = ?2",
                    rusqlite::params![ts, id.as_str()],
                )?,
                SessionState::Closed => conn.execute(
                    "UPDATE sessions SET state = 'closed', closed_at = ?1 WHERE id = ?2",
                    rusqlite::params![ts, id.as_str()],
                )?,
            };
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Every non-closed session, for the external scheduler's sweep.
    #[instrument(skip(self))]
    pub fn list_open(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions WHERE state != 'closed' ORDER BY started_at ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Sessions closed within [from, to), newest last.
    #[instrument(skip(self))]
    pub fn closed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM sessions
                 WHERE closed_at IS NOT NULL AND closed_at >= ?1 AND closed_at < ?2
                 ORDER BY closed_at ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![row_helpers::to_ts(&from), row_helpers::to_ts(&to)])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let state_str: String = row_helpers::get(row, 2, "sessions", "state")?;
    let started: String = row_helpers::get(row, 3, "sessions", "started_at")?;
    let last_active: String = row_helpers::get(row, 4, "sessions", "last_active_at")?;
    let idled: Option<String> = row_helpers::get_opt(row, 5, "sessions", "idled_at")?;
    let closed: Option<String> = row_helpers::get_opt(row, 6, "sessions", "closed_at")?;
    let user_act: Option<String> = row_helpers::get_opt(row, 8, "sessions", "last_user_activity")?;
    let bot_act: Option<String> = row_helpers::get_opt(row, 9, "sessions", "last_bot_activity")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        chat_id: ChatId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "chat_id")?),
        state: row_helpers::parse_enum(&state_str, "sessions", "state")?,
        started_at: row_helpers::parse_datetime(&started, "sessions", "started_at")?,
        last_active_at: row_helpers::parse_datetime(&last_active, "sessions", "last_active_at")?,
        idled_at: idled
            .map(|t| row_helpers::parse_datetime(&t, "sessions", "idled_at"))
            .transpose()?,
        closed_at: closed
            .map(|t| row_helpers::parse_datetime(&t, "sessions", "closed_at"))
            .transpose()?,
        message_count: row_helpers::get(row, 7, "sessions", "message_count")?,
        last_user_activity: user_act
            .map(|t| row_helpers::parse_datetime(&t, "sessions", "last_user_activity"))
            .transpose()?,
        last_bot_activity: bot_act
            .map(|t| row_helpers::parse_datetime(&t, "sessions", "last_bot_activity"))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chats::ChatRepo;
    use crate::users::UserRepo;

    fn setup() -> (Database, ChatId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let user = users.get_or_create("tg:1", &[1u8; 16]).unwrap();
        let chats = ChatRepo::new(db.clone());
        let chat = chats.get_or_create("tg:chat:1", &user.id).unwrap();
        (db, chat.id)
    }

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn create_session() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.message_count, 0);
    }

    #[test]
    fn second_open_session_is_conflict() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        let result = repo.create(&chat_id, t("2026-03-01T10:01:00Z"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn new_session_allowed_after_close() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let s1 = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        repo.set_state(&s1.id, SessionState::Closed, t("2026-03-01T11:00:00Z")).unwrap();

        let s2 = repo.create(&chat_id, t("2026-03-01T12:00:00Z")).unwrap();
        assert_ne!(s1.id, s2.id);
    }

    #[test]
    fn open_for_chat_finds_active_and_idle() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        assert!(repo.open_for_chat(&chat_id).unwrap().is_none());

        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        assert_eq!(repo.open_for_chat(&chat_id).unwrap().unwrap().id, session.id);

        repo.set_state(&session.id, SessionState::Idle, t("2026-03-01T10:30:00Z")).unwrap();
        assert_eq!(repo.open_for_chat(&chat_id).unwrap().unwrap().id, session.id);

        repo.set_state(&session.id, SessionState::Closed, t("2026-03-01T11:00:00Z")).unwrap();
        assert!(repo.open_for_chat(&chat_id).unwrap().is_none());
    }

    #[test]
    fn record_activity_user_message() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();

        repo.record_activity(&session.id, t("2026-03-01T10:05:00Z"), true, true).unwrap();
        repo.record_activity(&session.id, t("2026-03-01T10:06:00Z"), true, true).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.message_count, 2);
        assert_eq!(fetched.last_user_activity, Some(t("2026-03-01T10:06:00Z")));
        assert_eq!(fetched.last_active_at, t("2026-03-01T10:06:00Z"));
        assert!(fetched.last_bot_activity.is_none());
    }

    #[test]
    fn record_activity_edit_does_not_count() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();

        repo.record_activity(&session.id, t("2026-03-01T10:05:00Z"), true, false).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.message_count, 0);
        assert_eq!(fetched.last_user_activity, Some(t("2026-03-01T10:05:00Z")));
    }

    #[test]
    fn record_activity_bot_reply() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();

        repo.record_activity(&session.id, t("2026-03-01T10:05:00Z"), false, false).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.message_count, 0);
        assert_eq!(fetched.last_bot_activity, Some(t("2026-03-01T10:05:00Z")));
    }

    #[test]
    fn activity_timestamps_never_move_backwards() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();

        repo.record_activity(&session.id, t("2026-03-01T10:10:00Z"), true, true).unwrap();
        // Late out-of-order delivery with an earlier timestamp
        repo.record_activity(&session.id, t("2026-03-01T10:02:00Z"), true, true).unwrap();

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.last_user_activity, Some(t("2026-03-01T10:10:00Z")));
        assert_eq!(fetched.message_count, 2);
    }

    #[test]
    fn set_state_stamps_timestamps() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();

        repo.set_state(&session.id, SessionState::Idle, t("2026-03-01T10:30:00Z")).unwrap();
        let idle = repo.get(&session.id).unwrap();
        assert_eq!(idle.state, SessionState::Idle);
        assert_eq!(idle.idled_at, Some(t("2026-03-01T10:30:00Z")));

        // Back to active clears the idle stamp
        repo.set_state(&session.id, SessionState::Active, t("2026-03-01T10:40:00Z")).unwrap();
        let active = repo.get(&session.id).unwrap();
        assert_eq!(active.state, SessionState::Active);
        assert!(active.idled_at.is_none());

        repo.set_state(&session.id, SessionState::Closed, t("2026-03-01T11:00:00Z")).unwrap();
        let closed = repo.get(&session.id).unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert_eq!(closed.closed_at, Some(t("2026-03-01T11:00:00Z")));
    }

    #[test]
    fn list_open_excludes_closed() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let s1 = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        repo.set_state(&s1.id, SessionState::Closed, t("2026-03-01T11:00:00Z")).unwrap();
        repo.create(&chat_id, t("2026-03-01T12:00:00Z")).unwrap();

        let open = repo.list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].id, s1.id);
    }

    #[test]
    fn closed_between_range() {
        let (db, chat_id) = setup();
        let repo = SessionRepo::new(db);
        let s1 = repo.create(&chat_id, t("2026-03-01T10:00:00Z")).unwrap();
        repo.set_state(&s1.id, SessionState::Closed, t("2026-03-01T11:00:00Z")).unwrap();

        let hits = repo
            .closed_between(t("2026-03-01T10:00:00Z"), t("2026-03-01T12:00:00Z"))
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = repo
            .closed_between(t("2026-03-01T11:30:00Z"), t("2026-03-01T12:00:00Z"))
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn invalid_state_returns_corrupt_row() {
        let (db, chat_id) = setup();
        let session_id = SessionId::new();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, chat_id, state, started_at, last_active_at)
                 VALUES (?1, ?2, 'INVALID', ?3, ?3)",
                rusqlite::params![session_id.as_str(), chat_id.as_str(), row_helpers::to_ts(&Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&session_id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
