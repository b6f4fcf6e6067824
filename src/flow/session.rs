use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// One async mutex per conversation.
///
/// An entry lives exactly as long as someone holds or waits on its mutex:
/// the last [`ConversationGuard`] to drop removes it, so a held lock is
/// never replaced by a fresh one.
#[derive(Clone, Debug, Default)]
pub struct ConversationLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive access to one conversation until dropped.
pub struct ConversationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    conversation_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `conversation_id`.
    pub async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        // cloned under the shard lock, so release-time cleanup sees this waiter
        let lock = self
            .locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        ConversationGuard {
            guard: Some(lock.lock_owned().await),
            conversation_id: conversation_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Conversations currently locked or waited on.
    pub fn entry_count(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let removed = self
            .locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some();
        if removed {
            trace!(conversation_id = %self.conversation_id, "conversation lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_is_serialised() {
        let locks = ConversationLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("c1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.entry_count(), 0);
    }

    #[tokio::test]
    async fn long_held_lock_keeps_excluding() {
        let locks = ConversationLocks::new();
        let held = locks.acquire("c1").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = tokio::time::timeout(Duration::from_millis(200), locks.acquire("c1")).await;
        assert!(second.is_err());
        assert_eq!(locks.entry_count(), 1);

        drop(held);
        let third = tokio::time::timeout(Duration::from_millis(200), locks.acquire("c1")).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn waiter_keeps_the_entry_alive() {
        let locks = ConversationLocks::new();
        let held = locks.acquire("c1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("c1").await;
                locks.entry_count()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(locks.entry_count(), 0);
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.entry_count(), 2);
    }
}
