use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use haven_core::context::{EntryKind, Turn};
use haven_core::ids::{ChatId, SessionId, UserId};
use haven_crypto::KeyManager;
use haven_llm::SummarizationAgent;
use haven_store::context::{ContextEntryRepo, ContextEntryRow, VerbatimStats};
use haven_store::Database;

use crate::error::EngineError;

/// When and how much to compress. Externally supplied policy, not
/// hardcoded constants.
#[derive(Clone, Debug)]
pub struct CompressionPolicy {
    /// Fire when current verbatim plaintext reaches this many bytes.
    pub max_verbatim_bytes: i64,
    /// Fire when current verbatim entries reach this count.
    pub max_verbatim_entries: i64,
    /// Most recent entries kept verbatim for immediate continuity.
    pub retain_recent: i64,
    /// Budget for one summarization call; exceeding it defers the run.
    pub summarize_timeout: Duration,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            max_verbatim_bytes: 16 * 1024,
            max_verbatim_entries: 20,
            retain_recent: 4,
            summarize_timeout: Duration::from_secs(30),
        }
    }
}

impl CompressionPolicy {
    /// Whichever threshold is reached first wins.
    pub fn reached(&self, stats: &VerbatimStats) -> bool {
        stats.entries >= self.max_verbatim_entries || stats.bytes >= self.max_verbatim_bytes
    }
}

/// Result of one compression evaluation.
#[derive(Debug)]
pub enum CompressionOutcome {
    /// The current view was rewritten: one summary now covers the range.
    Compressed {
        summary: ContextEntryRow,
        replaced_turns: usize,
    },
    /// Thresholds not reached; nothing to do.
    NotNeeded,
    /// Thresholds reached but everything eligible is inside the retained
    /// tail; wait for more turns.
    TooFewEntries,
    /// The summarizer failed or timed out. The store is untouched; the
    /// next eligible trigger retries.
    Deferred { reason: String },
}

impl CompressionOutcome {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Compressed { .. })
    }
}

/// Key material needed to read and write one chat's entries.
#[derive(Clone, Copy)]
pub struct KeyContext<'a> {
    pub user: &'a UserId,
    pub salt: &'a [u8],
    /// Current derivation version; new entries are written with it.
    pub version: u32,
}

/// The compression pipeline. Reads the eligible verbatim prefix, asks
/// the summarization agent for a condensed narrative, and atomically
/// rewrites the current view. Callers hold the chat lock across `run`.
pub struct Compressor {
    entries: ContextEntryRepo,
    summarizer: Arc<dyn SummarizationAgent>,
    policy: CompressionPolicy,
}

impl Compressor {
    pub fn new(
        db: Database,
        summarizer: Arc<dyn SummarizationAgent>,
        policy: CompressionPolicy,
    ) -> Self {
        Self {
            entries: ContextEntryRepo::new(db),
            summarizer,
            policy,
        }
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Evaluate thresholds and compress when due.
    #[instrument(skip(self, keys, key_ctx), fields(chat_id = %chat_id))]
    pub async fn run_if_needed(
        &self,
        chat_id: &ChatId,
        session_id: &SessionId,
        keys: &KeyManager,
        key_ctx: KeyContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<CompressionOutcome, EngineError> {
        let stats = self.entries.verbatim_stats(chat_id)?;
        if !self.policy.reached(&stats) {
            return Ok(CompressionOutcome::NotNeeded);
        }
        self.run(chat_id, session_id, keys, key_ctx, now).await
    }

    async fn run(
        &self,
        chat_id: &ChatId,
        session_id: &SessionId,
        keys: &KeyManager,
        key_ctx: KeyContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<CompressionOutcome, EngineError> {
        let view = self.entries.current_view(chat_id)?;

        let prior = view.iter().find(|e| e.kind == EntryKind::Summary);
        let verbatim: Vec<&ContextEntryRow> = view
            .iter()
            .filter(|e| e.kind == EntryKind::Verbatim)
            .collect();

        let retain = self.policy.retain_recent.max(0) as usize;
        if verbatim.len() <= retain {
            return Ok(CompressionOutcome::TooFewEntries);
        }
        let eligible = &verbatim[..verbatim.len() - retain];

        // Previous summary is part of the input so nothing silently
        // drops across repeated compressions.
        let prior_text = match prior {
            Some(row) => {
                let key = keys.derive(key_ctx.user, key_ctx.salt, row.key_version)?;
                Some(haven_crypto::decrypt(&row.ciphertext, &key)?)
            }
            None => None,
        };

        let mut turns = Vec::with_capacity(eligible.len());
        for row in eligible {
            let key = keys.derive(key_ctx.user, key_ctx.salt, row.key_version)?;
            let plain = haven_crypto::decrypt(&row.ciphertext, &key)?;
            let turn: Turn = serde_json::from_str(&plain).map_err(|e| {
                EngineError::Internal(format!(
                    "undecodable turn at ordinal {} in chat {chat_id}: {e}",
                    row.ordinal
                ))
            })?;
            turns.push(turn.render());
        }

        let summary_text = match tokio::time::timeout(
            self.policy.summarize_timeout,
            self.summarizer.summarize(prior_text.as_deref(), &turns),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(chat_id = %chat_id, error = %e, "summarization failed, deferring compression");
                return Ok(CompressionOutcome::Deferred {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    chat_id = %chat_id,
                    timeout_ms = self.policy.summarize_timeout.as_millis() as u64,
                    "summarization timed out, deferring compression"
                );
                return Ok(CompressionOutcome::Deferred {
                    reason: format!(
                        "summarization timed out after {:?}",
                        self.policy.summarize_timeout
                    ),
                });
            }
        };

        let start = prior.map(|p| p.ordinal).unwrap_or(eligible[0].ordinal);
        let end = eligible.last().map(|e| e.ordinal).unwrap_or(start);

        let key = keys.derive(key_ctx.user, key_ctx.salt, key_ctx.version)?;
        let ciphertext = haven_crypto::encrypt(&summary_text, &key)?;

        let summary = self.entries.replace_range(
            chat_id,
            session_id,
            start,
            end,
            &ciphertext,
            summary_text.len() as i64,
            key_ctx.version,
            now,
        )?;

        info!(
            chat_id = %chat_id,
            start,
            end,
            replaced = eligible.len(),
            "compressed context range into summary"
        );

        Ok(CompressionOutcome::Compressed {
            summary,
            replaced_turns: eligible.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_crypto::KdfParams;
    use haven_llm::{MockReply, MockSummarizer};
    use haven_store::chats::ChatRepo;
    use haven_store::sessions::SessionRepo;
    use haven_store::users::UserRepo;
    use secrecy::SecretString;

    struct Fixture {
        db: Database,
        chat_id: ChatId,
        session_id: SessionId,
        user_id: UserId,
        salt: Vec<u8>,
        keys: KeyManager,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let salt = vec![9u8; 16];
        let user = users.get_or_create("tg:1", &salt).unwrap();
        let chats = ChatRepo::new(db.clone());
        let chat = chats.get_or_create("tg:chat:1", &user.id).unwrap();
        let sessions = SessionRepo::new(db.clone());
        let session = sessions.create(&chat.id, Utc::now()).unwrap();
        let keys = KeyManager::new(
            SecretString::from("master"),
            KdfParams::fast_insecure(),
            Duration::from_secs(3600),
        );
        Fixture {
            db,
            chat_id: chat.id,
            session_id: session.id,
            user_id: user.id,
            salt,
            keys,
        }
    }

    fn policy_10_3() -> CompressionPolicy {
        CompressionPolicy {
            max_verbatim_bytes: i64::MAX,
            max_verbatim_entries: 10,
            retain_recent: 3,
            summarize_timeout: Duration::from_secs(5),
        }
    }

    fn append_turns(fx: &Fixture, n: usize) {
        let repo = ContextEntryRepo::new(fx.db.clone());
        let key = fx.keys.derive(&fx.user_id, &fx.salt, 1).unwrap();
        for i in 0..n {
            let turn = Turn::user(format!("turn number {i}"));
            let plain = serde_json::to_string(&turn).unwrap();
            let ct = haven_crypto::encrypt(&plain, &key).unwrap();
            repo.append_verbatim(&fx.chat_id, &fx.session_id, &ct, plain.len() as i64, 1, Utc::now())
                .unwrap();
        }
    }

    fn key_ctx(fx: &Fixture) -> KeyContext<'_> {
        KeyContext {
            user: &fx.user_id,
            salt: &fx.salt,
            version: 1,
        }
    }

    #[tokio::test]
    async fn below_threshold_is_not_needed() {
        let fx = fixture();
        append_turns(&fx, 5);
        let compressor = Compressor::new(
            fx.db.clone(),
            Arc::new(MockSummarizer::always("sum")),
            policy_10_3(),
        );

        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, CompressionOutcome::NotNeeded));
    }

    #[tokio::test]
    async fn compresses_prefix_at_threshold() {
        let fx = fixture();
        append_turns(&fx, 10);
        let summarizer = Arc::new(MockSummarizer::always("the story so far"));
        let compressor = Compressor::new(fx.db.clone(), summarizer.clone(), policy_10_3());

        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();

        match outcome {
            CompressionOutcome::Compressed { summary, replaced_turns } => {
                assert_eq!(summary.ordinal, 1);
                assert_eq!(summary.ordinal_end, 7);
                assert_eq!(replaced_turns, 7);
            }
            other => panic!("expected compression, got {other:?}"),
        }

        // Summarizer saw the 7 eligible turns and no prior summary.
        let calls = summarizer.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].previous_summary.is_none());
        assert_eq!(calls[0].turns.len(), 7);
        assert_eq!(calls[0].turns[0], "user: turn number 0");

        // View: summary + 3 retained verbatim entries.
        let repo = ContextEntryRepo::new(fx.db.clone());
        let view = repo.current_view(&fx.chat_id).unwrap();
        assert_eq!(view.len(), 4);
        assert_eq!(view[0].kind, EntryKind::Summary);
    }

    #[tokio::test]
    async fn repeated_compression_incorporates_prior_summary() {
        let fx = fixture();
        append_turns(&fx, 10);
        let summarizer = Arc::new(MockSummarizer::new(vec![
            MockReply::text("first summary"),
            MockReply::text("second summary"),
        ]));
        let compressor = Compressor::new(fx.db.clone(), summarizer.clone(), policy_10_3());

        compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();

        // Accumulate past the threshold again: 3 retained + 7 new = 10.
        append_turns(&fx, 7);
        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();

        match outcome {
            CompressionOutcome::Compressed { summary, .. } => {
                // Range now starts where the first summary started.
                assert_eq!(summary.ordinal, 1);
                assert_eq!(summary.ordinal_end, 14);
            }
            other => panic!("expected compression, got {other:?}"),
        }

        let calls = summarizer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].previous_summary.as_deref(), Some("first summary"));
        assert_eq!(calls[1].turns.len(), 7);
    }

    #[tokio::test]
    async fn failure_defers_and_leaves_view_unchanged() {
        let fx = fixture();
        append_turns(&fx, 10);
        let summarizer = Arc::new(MockSummarizer::new(vec![MockReply::Error(
            haven_core::errors::AgentError::Unavailable("model down".into()),
        )]));
        let compressor = Compressor::new(fx.db.clone(), summarizer, policy_10_3());

        let repo = ContextEntryRepo::new(fx.db.clone());
        let before = repo.current_view(&fx.chat_id).unwrap();

        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, CompressionOutcome::Deferred { .. }));

        let after = repo.current_view(&fx.chat_id).unwrap();
        assert_eq!(before.len(), after.len());
        let before_ct: Vec<&str> = before.iter().map(|e| e.ciphertext.as_str()).collect();
        let after_ct: Vec<&str> = after.iter().map(|e| e.ciphertext.as_str()).collect();
        assert_eq!(before_ct, after_ct);
    }

    #[tokio::test]
    async fn timeout_defers() {
        let fx = fixture();
        append_turns(&fx, 10);
        let summarizer = Arc::new(MockSummarizer::new(vec![MockReply::delayed(
            Duration::from_millis(200),
            MockReply::text("too late"),
        )]));
        let mut policy = policy_10_3();
        policy.summarize_timeout = Duration::from_millis(20);
        let compressor = Compressor::new(fx.db.clone(), summarizer, policy);

        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();

        match outcome {
            CompressionOutcome::Deferred { reason } => {
                assert!(reason.contains("timed out"), "got: {reason}");
            }
            other => panic!("expected deferral, got {other:?}"),
        }

        let repo = ContextEntryRepo::new(fx.db.clone());
        assert_eq!(repo.current_view(&fx.chat_id).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn everything_in_retained_tail_waits() {
        let fx = fixture();
        append_turns(&fx, 3);
        let policy = CompressionPolicy {
            max_verbatim_bytes: 1, // byte threshold trips immediately
            max_verbatim_entries: 100,
            retain_recent: 3,
            summarize_timeout: Duration::from_secs(5),
        };
        let compressor = Compressor::new(
            fx.db.clone(),
            Arc::new(MockSummarizer::always("sum")),
            policy,
        );

        let outcome = compressor
            .run_if_needed(&fx.chat_id, &fx.session_id, &fx.keys, key_ctx(&fx), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, CompressionOutcome::TooFewEntries));
    }

    #[test]
    fn byte_threshold_counts() {
        let policy = CompressionPolicy {
            max_verbatim_bytes: 100,
            max_verbatim_entries: 1000,
            retain_recent: 2,
            summarize_timeout: Duration::from_secs(5),
        };
        assert!(!policy.reached(&VerbatimStats { entries: 3, bytes: 99 }));
        assert!(policy.reached(&VerbatimStats { entries: 3, bytes: 100 }));
        assert!(policy.reached(&VerbatimStats { entries: 1000, bytes: 1 }));
    }
}
