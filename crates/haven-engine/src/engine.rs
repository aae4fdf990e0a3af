use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use haven_core::context::{EntryKind, Turn, WindowBody, WindowEntry};
use haven_core::events::{EventPayload, RawEvent};
use haven_core::ids::{ChatId, UserId};
use haven_crypto::KeyManager;
use haven_llm::SummarizationAgent;
use haven_store::chats::{ChatRepo, ChatRow};
use haven_store::context::{ContextEntryRepo, ContextEntryRow};
use haven_store::sessions::{SessionRepo, SessionRow, SessionState};
use haven_store::users::{KeyRecord, UserRepo};
use haven_store::Database;

use crate::compress::{CompressionOutcome, CompressionPolicy, Compressor, KeyContext};
use crate::dedup::{Deduplicator, IngestOutcome};
use crate::error::EngineError;
use crate::locks::ChatLockCoordinator;
use crate::retry::{with_backoff, BackoffPolicy};
use crate::session::{transition, SessionTrigger};

/// Inactivity and dormancy windows driving the session lifecycle.
#[derive(Clone, Debug)]
pub struct SessionPolicy {
    /// No update for this long → the session goes idle on the next tick.
    pub inactivity_window: Duration,
    /// No update for this long → the session closes on the next tick.
    pub dormancy_window: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            inactivity_window: Duration::from_secs(60 * 60),
            dormancy_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub session: SessionPolicy,
    pub compression: CompressionPolicy,
    pub backoff: BackoffPolicy,
}

/// What one ingestion did.
#[derive(Debug)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    /// Present when the event was accepted.
    pub session: Option<SessionRow>,
    /// Present when the event carried conversational text.
    pub entry: Option<ContextEntryRow>,
    /// Present when a context append ran trigger evaluation.
    pub compression: Option<CompressionOutcome>,
}

/// What appending a bot reply did.
#[derive(Debug)]
pub struct AppendReport {
    pub entry: ContextEntryRow,
    pub compression: CompressionOutcome,
}

/// Result of a scheduler tick for one chat.
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing open; the scheduler may fire after a close.
    NoSession,
    Unchanged(SessionState),
    Idled(SessionRow),
    Closed(SessionRow),
}

/// The session & encrypted context engine. Ingests deduplicated events,
/// drives the per-chat session lifecycle, appends encrypted context, and
/// compresses it when policy thresholds are reached. Everything that
/// mutates one chat's state runs inside that chat's lock section.
pub struct SessionEngine {
    users: UserRepo,
    chats: ChatRepo,
    sessions: SessionRepo,
    entries: ContextEntryRepo,
    dedup: Deduplicator,
    compressor: Compressor,
    locks: ChatLockCoordinator,
    keys: Arc<KeyManager>,
    config: EngineConfig,
}

impl SessionEngine {
    pub fn new(
        db: Database,
        keys: Arc<KeyManager>,
        summarizer: Arc<dyn SummarizationAgent>,
        config: EngineConfig,
    ) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            chats: ChatRepo::new(db.clone()),
            sessions: SessionRepo::new(db.clone()),
            entries: ContextEntryRepo::new(db.clone()),
            dedup: Deduplicator::new(db.clone()),
            compressor: Compressor::new(db, summarizer, config.compression.clone()),
            locks: ChatLockCoordinator::new(),
            keys,
            config,
        }
    }

    /// Handle one inbound event: deduplicate, then, under the chat
    /// lock, advance the session, append to the context store, and
    /// evaluate the compression trigger. At-least-once redelivery and
    /// cross-chat reordering are both safe here.
    #[instrument(skip(self, event), fields(platform_id = %event.platform_id, chat_ref = %event.chat_ref))]
    pub async fn ingest(&self, event: &RawEvent) -> Result<IngestReport, EngineError> {
        let now = event.occurred_at;

        let salt = KeyManager::generate_salt();
        let user = with_backoff(&self.config.backoff, "users.get_or_create", || {
            self.users.get_or_create(&event.sender_ref, &salt)
        })
        .await?;
        let chat = with_backoff(&self.config.backoff, "chats.get_or_create", || {
            self.chats.get_or_create(&event.chat_ref, &user.id)
        })
        .await?;

        let outcome = with_backoff(&self.config.backoff, "dedup.ingest", || {
            self.dedup.ingest(&chat.id, event, now)
        })
        .await?;

        if !outcome.is_accepted() {
            return Ok(IngestReport {
                outcome,
                session: None,
                entry: None,
                compression: None,
            });
        }

        let _guard = self.locks.acquire(&chat.id).await;

        let session = self.ensure_active_session(&chat.id, now)?;
        let counts_message = matches!(event.payload, EventPayload::Message { .. });
        self.sessions
            .record_activity(&session.id, now, true, counts_message)?;

        let (entry, compression) = match event.turn_text() {
            Some(text) => {
                let entry = self.append_turn(&chat, &session.id, Turn::user(text), now)?;
                let compression = self.evaluate_compression(&chat, &session.id, now).await?;
                (Some(entry), Some(compression))
            }
            // Commands move the activity clocks but are not turns.
            None => (None, None),
        };

        let session = self.sessions.get(&session.id)?;
        Ok(IngestReport {
            outcome,
            session: Some(session),
            entry,
            compression,
        })
    }

    /// Record the bot's reply as an assistant turn. Replies participate
    /// in compression accounting like any other turn but never bump the
    /// user message count.
    #[instrument(skip(self, text), fields(chat_id = %chat_id))]
    pub async fn record_reply(
        &self,
        chat_id: &ChatId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<AppendReport, EngineError> {
        let chat = self.chats.get(chat_id)?;
        let _guard = self.locks.acquire(chat_id).await;

        let session = self
            .sessions
            .open_for_chat(chat_id)?
            .ok_or_else(|| EngineError::NoOpenSession(chat_id.to_string()))?;

        self.sessions
            .record_activity(&session.id, now, false, false)?;
        let entry = self.append_turn(&chat, &session.id, Turn::assistant(text), now)?;
        let compression = self.evaluate_compression(&chat, &session.id, now).await?;

        Ok(AppendReport { entry, compression })
    }

    /// Time-based trigger from the external scheduler. Evaluates the
    /// inactivity and dormancy windows against the session's last
    /// activity and applies whichever transition is due.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub async fn tick(
        &self,
        chat_id: &ChatId,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, EngineError> {
        let _guard = self.locks.acquire(chat_id).await;

        let session = match self.sessions.open_for_chat(chat_id)? {
            Some(session) => session,
            None => return Ok(TickOutcome::NoSession),
        };

        let elapsed = now
            .signed_duration_since(session.last_active_at)
            .to_std()
            .unwrap_or_default();

        if elapsed >= self.config.session.dormancy_window {
            transition(session.state, SessionTrigger::DormancyElapsed)?;
            self.sessions.set_state(&session.id, SessionState::Closed, now)?;
            let closed = self.sessions.get(&session.id)?;
            info!(chat_id = %chat_id, session_id = %closed.id, "session closed after dormancy");
            return Ok(TickOutcome::Closed(closed));
        }

        if elapsed >= self.config.session.inactivity_window {
            let next = transition(session.state, SessionTrigger::InactivityElapsed)?;
            if next != session.state {
                self.sessions.set_state(&session.id, SessionState::Idle, now)?;
                let idled = self.sessions.get(&session.id)?;
                info!(chat_id = %chat_id, session_id = %idled.id, "session went idle");
                return Ok(TickOutcome::Idled(idled));
            }
            return Ok(TickOutcome::Unchanged(session.state));
        }

        Ok(TickOutcome::Unchanged(session.state))
    }

    /// Explicit close request. The session is archived, not deleted; the
    /// next accepted update allocates a fresh one.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub async fn close_chat(
        &self,
        chat_id: &ChatId,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        let _guard = self.locks.acquire(chat_id).await;

        let session = self
            .sessions
            .open_for_chat(chat_id)?
            .ok_or_else(|| EngineError::NoOpenSession(chat_id.to_string()))?;

        transition(session.state, SessionTrigger::CloseRequested)?;
        self.sessions.set_state(&session.id, SessionState::Closed, now)?;
        let closed = self.sessions.get(&session.id)?;
        info!(chat_id = %chat_id, session_id = %closed.id, "session closed on request");
        Ok(closed)
    }

    /// The bounded, relevance-preserving context window: at most one
    /// summary followed by recent verbatim turns, decrypted. Recomputed
    /// on every call; mutation is cheap next to a model call.
    #[instrument(skip(self), fields(chat_id = %chat_id))]
    pub fn current_context(&self, chat_id: &ChatId) -> Result<Vec<WindowEntry>, EngineError> {
        let chat = self.chats.get(chat_id)?;
        let record = self.key_record_for(&chat.user_id)?;

        let view = self.entries.current_view(chat_id)?;
        let mut window = Vec::with_capacity(view.len());
        for row in view {
            // Each entry decrypts with the key version it was written
            // under; a mismatch fails closed rather than feeding the
            // model garbage.
            let key = self.keys.derive(&chat.user_id, &record.salt, row.key_version)?;
            let plain = haven_crypto::decrypt(&row.ciphertext, &key)?;
            let body = match row.kind {
                EntryKind::Verbatim => {
                    let turn: Turn = serde_json::from_str(&plain).map_err(|e| {
                        EngineError::Internal(format!(
                            "undecodable turn at ordinal {} in chat {chat_id}: {e}",
                            row.ordinal
                        ))
                    })?;
                    WindowBody::Verbatim(turn)
                }
                EntryKind::Summary => WindowBody::Summary(plain),
            };
            window.push(WindowEntry {
                ordinal: row.ordinal,
                ordinal_end: row.ordinal_end,
                body,
                created_at: row.created_at,
            });
        }
        Ok(window)
    }

    /// Bump the user's key-derivation version and drop cached keys.
    /// Existing entries keep decrypting through their recorded version.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn rotate_user_key(&self, user_id: &UserId) -> Result<u32, EngineError> {
        let version = self.users.bump_key_version(user_id)?;
        self.keys.invalidate(user_id);
        info!(user_id = %user_id, version, "rotated user key");
        Ok(version)
    }

    /// Non-closed sessions, for the external scheduler's tick sweep.
    pub fn open_sessions(&self) -> Result<Vec<SessionRow>, EngineError> {
        Ok(self.sessions.list_open()?)
    }

    /// Sessions closed within [from, to), for archive processing.
    pub fn closed_sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRow>, EngineError> {
        Ok(self.sessions.closed_between(from, to)?)
    }

    fn ensure_active_session(
        &self,
        chat_id: &ChatId,
        now: DateTime<Utc>,
    ) -> Result<SessionRow, EngineError> {
        match self.sessions.open_for_chat(chat_id)? {
            None => {
                let session = self.sessions.create(chat_id, now)?;
                info!(chat_id = %chat_id, session_id = %session.id, "opened new session");
                Ok(session)
            }
            Some(session) => {
                let next = transition(session.state, SessionTrigger::UpdateAccepted)?;
                if next != session.state {
                    self.sessions.set_state(&session.id, next, now)?;
                    info!(chat_id = %chat_id, session_id = %session.id, "session reactivated");
                }
                Ok(self.sessions.get(&session.id)?)
            }
        }
    }

    fn append_turn(
        &self,
        chat: &ChatRow,
        session_id: &haven_core::ids::SessionId,
        turn: Turn,
        now: DateTime<Utc>,
    ) -> Result<ContextEntryRow, EngineError> {
        let record = self.key_record_for(&chat.user_id)?;
        let key = self.keys.derive(&chat.user_id, &record.salt, record.version)?;

        let plain = serde_json::to_string(&turn)
            .map_err(|e| EngineError::Internal(format!("unencodable turn: {e}")))?;
        let ciphertext = haven_crypto::encrypt(&plain, &key)?;

        Ok(self.entries.append_verbatim(
            &chat.id,
            session_id,
            &ciphertext,
            plain.len() as i64,
            record.version,
            now,
        )?)
    }

    async fn evaluate_compression(
        &self,
        chat: &ChatRow,
        session_id: &haven_core::ids::SessionId,
        now: DateTime<Utc>,
    ) -> Result<CompressionOutcome, EngineError> {
        let record = self.key_record_for(&chat.user_id)?;
        let outcome = self
            .compressor
            .run_if_needed(
                &chat.id,
                session_id,
                &self.keys,
                KeyContext {
                    user: &chat.user_id,
                    salt: &record.salt,
                    version: record.version,
                },
                now,
            )
            .await;

        match &outcome {
            Ok(CompressionOutcome::Deferred { reason }) => {
                warn!(chat_id = %chat.id, reason, "compression deferred");
            }
            Ok(_) | Err(_) => {}
        }
        outcome
    }

    fn key_record_for(&self, user_id: &UserId) -> Result<KeyRecord, EngineError> {
        self.users
            .key_record(user_id)?
            .ok_or_else(|| {
                EngineError::Crypto(haven_crypto::CryptoError::MissingKeyMaterial(
                    user_id.to_string(),
                ))
            })
    }
}
