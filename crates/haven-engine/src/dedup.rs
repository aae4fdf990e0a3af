use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use haven_core::events::RawEvent;
use haven_core::ids::ChatId;
use haven_store::updates::{UpdateRepo, UpdateRow};
use haven_store::{Database, StoreError};

/// Result of ingesting one raw event.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Logically new; exactly one durable write happened.
    Accepted(UpdateRow),
    /// Seen before with identical content. A no-op, not an error.
    Duplicate,
    /// The event cannot be given an idempotent identity.
    Rejected(String),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Assigns idempotent identities to raw events and collapses redelivery.
/// Uniqueness is enforced by the updates table's (chat, dedup key)
/// index, so concurrent ingestion paths cannot double-insert.
pub struct Deduplicator {
    updates: UpdateRepo,
}

// Same identity re-claimed with changed content more times than any
// transport plausibly edits in one race window.
const MAX_REVISION_PROBES: u32 = 16;

impl Deduplicator {
    pub fn new(db: Database) -> Self {
        Self {
            updates: UpdateRepo::new(db),
        }
    }

    /// Dedup key over (chat, platform id, revision marker).
    pub fn dedup_key(chat_id: &ChatId, platform_id: &str, revision: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chat_id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(platform_id.as_bytes());
        hasher.update(b":");
        hasher.update(revision.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Ingest one event. Redelivered events with identical payloads are
    /// `Duplicate`; a changed payload under a claimed identity is an
    /// edit, stored as a new row superseding the old one.
    #[instrument(skip(self, event), fields(chat_id = %chat_id, platform_id = %event.platform_id))]
    pub fn ingest(
        &self,
        chat_id: &ChatId,
        event: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        if event.platform_id.trim().is_empty() {
            return Ok(IngestOutcome::Rejected("missing platform id".into()));
        }
        if event.chat_ref.trim().is_empty() {
            return Ok(IngestOutcome::Rejected("missing chat reference".into()));
        }

        let payload = serde_json::to_value(&event.payload)?;
        let mut revision = event.revision;

        for _ in 0..MAX_REVISION_PROBES {
            let key = Self::dedup_key(chat_id, &event.platform_id, revision);

            if let Some(existing) = self.updates.find_by_dedup_key(chat_id, &key)? {
                if existing.payload == payload {
                    debug!(dedup_key = %key, "duplicate event");
                    return Ok(IngestOutcome::Duplicate);
                }
                // Content changed under a claimed identity: the
                // transport edited without bumping its marker. Probe the
                // next revision slot.
                revision += 1;
                continue;
            }

            let supersedes = self
                .updates
                .current_for_platform_id(chat_id, &event.platform_id)?
                .map(|u| u.id);

            match self.updates.insert_if_new(
                chat_id,
                &event.platform_id,
                &key,
                revision,
                supersedes.as_ref(),
                &payload,
                now,
            )? {
                Some(row) => return Ok(IngestOutcome::Accepted(row)),
                // Lost a race for this key; loop re-reads and compares.
                None => continue,
            }
        }

        Err(StoreError::Conflict(format!(
            "revision probe budget exhausted for platform id {} in chat {chat_id}",
            event.platform_id
        )))
    }
}
