//! Per-session mutual exclusion and the idle-session offload sweeper
//! (component E).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Every chat turn acquires the lock for its session up front and holds it
/// across the full user-message-append -> LLM-stream -> assistant-append ->
/// counter-persist sequence, so turns on the same session never interleave.
pub const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
pub const SESSION_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

struct CacheEntry<A> {
    lock: Arc<AsyncMutex<()>>,
    agent: Option<Arc<A>>,
    last_accessed: Instant,
}

/// Maintains `session_id -> mutex` for chat-turn serialization, and a
/// `session_id -> cached_agent` map. Generic over the cached agent type so
/// this module stays independent of the research-agent implementation.
pub struct SessionLockRegistry<A> {
    entries: SyncMutex<HashMap<String, CacheEntry<A>>>,
}

impl<A> Default for SessionLockRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> SessionLockRegistry<A> {
    pub fn new() -> Self {
        Self {
            entries: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock();
        match entries.get(session_id) {
            Some(entry) => entry.lock.clone(),
            None => {
                // No cached agent yet; the lock exists independently of the
                // agent cache so the first caller to touch a session can
                // always serialize against later callers.
                let lock = Arc::new(AsyncMutex::new(()));
                entries.insert(
                    session_id.to_string(),
                    CacheEntry {
                        lock: lock.clone(),
                        agent: None,
                        last_accessed: Instant::now(),
                    },
                );
                lock
            }
        }
    }

    /// Acquire the session's lock for the duration of one chat turn.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(session_id);
        lock.lock_owned().await
    }

    /// Look up a cached agent, bumping `last_accessed`.
    pub fn get_cached(&self, session_id: &str) -> Option<Arc<A>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(session_id)?;
        entry.last_accessed = Instant::now();
        entry.agent.clone()
    }

    /// Insert or replace the cached agent for a session (used to rehydrate
    /// after an offload).
    pub fn cache_agent(&self, session_id: &str, agent: Arc<A>) {
        let mut entries = self.entries.lock();
        let lock = entries
            .get(session_id)
            .map(|e| e.lock.clone())
            .unwrap_or_else(|| Arc::new(AsyncMutex::new(())));
        entries.insert(
            session_id.to_string(),
            CacheEntry {
                lock,
                agent: Some(agent),
                last_accessed: Instant::now(),
            },
        );
    }

    /// Evict a session entirely (lock and cached agent). Storage is
    /// untouched; a subsequent access rehydrates from there.
    pub fn evict(&self, session_id: &str) {
        self.entries.lock().remove(session_id);
    }

    /// Sweep entries idle longer than `timeout`, evicting the cached agent
    /// but not the lock map entry itself unless unreferenced elsewhere.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let mut evicted = Vec::new();
        entries.retain(|session_id, entry| {
            if entry.agent.is_some() && now.duration_since(entry.last_accessed) > timeout {
                evicted.push(session_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }
}

/// Spawn the background sweeper: wakes every [`SESSION_CLEANUP_INTERVAL`]
/// and evicts any session idle longer than [`SESSION_INACTIVITY_TIMEOUT`].
pub fn spawn_sweeper<A: Send + Sync + 'static>(
    registry: Arc<SessionLockRegistry<A>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SESSION_CLEANUP_INTERVAL).await;
            let evicted = registry.sweep_idle(SESSION_INACTIVITY_TIMEOUT);
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "swept idle sessions from cache");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_session_lock_serializes_turns() {
        let registry: Arc<SessionLockRegistry<()>> = Arc::new(SessionLockRegistry::new());

        let r1 = registry.clone();
        let r2 = registry.clone();
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let h1 = tokio::spawn(async move {
            let _guard = r1.acquire("s1").await;
            o1.lock().push("a-start");
            tokio::time::sleep(Duration::from_millis(20)).await;
            o1.lock().push("a-end");
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let h2 = tokio::spawn(async move {
            let _guard = r2.acquire("s1").await;
            o2.lock().push("b-start");
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let seq = order.lock().clone();
        assert_eq!(seq, vec!["a-start", "a-end", "b-start"]);
    }

    #[test]
    fn sweep_evicts_only_idle_cached_agents() {
        let registry: SessionLockRegistry<u32> = SessionLockRegistry::new();
        registry.cache_agent("fresh", Arc::new(1));
        registry.cache_agent("stale", Arc::new(2));
        {
            let mut entries = registry.entries.lock();
            entries.get_mut("stale").unwrap().last_accessed = Instant::now() - Duration::from_secs(7200);
        }

        let evicted = registry.sweep_idle(SESSION_INACTIVITY_TIMEOUT);
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.get_cached("fresh").is_some());
        assert!(registry.get_cached("stale").is_none());
    }
}
