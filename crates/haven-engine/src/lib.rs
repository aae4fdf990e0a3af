pub mod compress;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod locks;
pub mod retry;
pub mod session;

pub use compress::{CompressionOutcome, CompressionPolicy};
pub use dedup::{Deduplicator, IngestOutcome};
pub use engine::{EngineConfig, IngestReport, SessionEngine, SessionPolicy, TickOutcome};
pub use error::EngineError;
pub use locks::ChatLockCoordinator;
