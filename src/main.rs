use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use haven_crypto::{KdfParams, KeyManager};
use haven_engine::{EngineConfig, SessionEngine, TickOutcome};
use haven_llm::{ExtractiveSummarizer, ReliableAgent, SummarizationAgent};
use haven_store::Database;
use haven_telemetry::{init_telemetry, TelemetryConfig};

const KEY_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let _telemetry = init_telemetry(TelemetryConfig::default());

    tracing::info!("starting haven session engine");

    let master = match std::env::var("HAVEN_MASTER_SECRET") {
        Ok(secret) if !secret.is_empty() => SecretString::from(secret),
        _ => {
            tracing::error!("HAVEN_MASTER_SECRET must be set; refusing to start without key material");
            std::process::exit(1);
        }
    };

    let haven_dir = dirs_home().join(".haven").join("database");
    std::fs::create_dir_all(&haven_dir).expect("Failed to create database directory");
    let db_path = haven_dir.join("haven.db");

    let db = Database::open(&db_path).expect("Failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let keys = Arc::new(KeyManager::new(master, KdfParams::default(), KEY_CACHE_TTL));

    // Degraded-mode summarizer; a transport integration swaps in its
    // model-backed agent here.
    let summarizer: Arc<dyn SummarizationAgent> =
        Arc::new(ReliableAgent::with_defaults(ExtractiveSummarizer::new(4096)));

    let engine = Arc::new(SessionEngine::new(
        db,
        keys.clone(),
        summarizer,
        EngineConfig::default(),
    ));

    // Periodic sweep: tick every open session and evict expired keys.
    let sweep_engine = engine.clone();
    let sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            keys.purge_expired();

            let sessions = match sweep_engine.open_sessions() {
                Ok(sessions) => sessions,
                Err(e) => {
                    tracing::error!(error = %e, "session sweep failed");
                    continue;
                }
            };

            let now = chrono::Utc::now();
            for session in sessions {
                match sweep_engine.tick(&session.chat_id, now).await {
                    Ok(TickOutcome::Idled(s)) => {
                        tracing::info!(chat_id = %s.chat_id, session_id = %s.id, "session idled");
                    }
                    Ok(TickOutcome::Closed(s)) => {
                        tracing::info!(chat_id = %s.chat_id, session_id = %s.id, "session closed");
                    }
                    Ok(_) => {}
                    // One chat's failure never stops the sweep.
                    Err(e) => {
                        tracing::error!(chat_id = %session.chat_id, error = %e, "tick failed");
                    }
                }
            }
        }
    });

    tracing::info!("haven engine ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    sweep.abort();
    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
