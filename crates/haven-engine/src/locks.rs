use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use haven_core::ids::ChatId;

/// Grants exclusive per-chat execution sections. Session transitions,
/// context appends and compression rewrites for one chat all serialize
/// here; different chats proceed independently.
///
/// tokio's Mutex queues waiters in FIFO order, so operations are applied
/// in arrival order, the ordering the deduplicator accepted them in.
#[derive(Default)]
pub struct ChatLockCoordinator {
    locks: DashMap<ChatId, Arc<Mutex<()>>>,
}

impl ChatLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a chat. Suspends (never busy-waits) until the
    /// section is free; the guard releases on drop.
    pub async fn acquire(&self, chat_id: &ChatId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(chat_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Run the future produced by `f` while holding the chat's lock and
    /// return its result.
    pub async fn with_chat_lock<T, F, Fut>(&self, chat_id: &ChatId, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _guard = self.acquire(chat_id).await;
        f().await
    }

    pub fn tracked_chats(&self) -> usize {
        self.locks.len()
    }
}
