use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use bridge_types::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    Conflict { current: Option<String> },
}

/// Thread id to backend session id mapping. A durable shared implementation
/// can replace the in-memory one without touching `SessionManager`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Option<String>;
    async fn put(&self, thread_id: &str, session_id: &str);
    /// Sets the slot to `new` (or clears it for `None`) only if it currently
    /// holds `expected`.
    async fn compare_and_swap(
        &self,
        thread_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> CasOutcome;
    async fn len(&self) -> usize;
}

/// Process-lifetime store. Lost on restart and not shared between instances.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, thread_id: &str) -> Option<String> {
        self.sessions.read().await.get(thread_id).cloned()
    }

    async fn put(&self, thread_id: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .insert(thread_id.to_string(), session_id.to_string());
    }

    async fn compare_and_swap(
        &self,
        thread_id: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> CasOutcome {
        let mut sessions = self.sessions.write().await;
        let current = sessions.get(thread_id).map(String::as_str);
        if current != expected {
            return CasOutcome::Conflict {
                current: current.map(str::to_string),
            };
        }
        match new {
            Some(session_id) => {
                sessions.insert(thread_id.to_string(), session_id.to_string());
            }
            None => {
                sessions.remove(thread_id);
            }
        }
        CasOutcome::Swapped
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoSession,
    SessionRequested,
    SessionActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: String,
    /// True when this call issued the backend creation.
    pub created: bool,
}

type KeyLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    locks: KeyLocks,
    requested: StdMutex<HashSet<String>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
            requested: StdMutex::new(HashSet::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()))
    }

    /// Returns the thread's session, running `create` at most once per
    /// thread id even under concurrent first turns. A failed creation leaves
    /// the thread without a session and propagates the error.
    pub async fn get_or_create<F, Fut>(&self, thread_id: &str, create: F) -> Result<SessionLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(session_id) = self.store.get(thread_id).await {
            return Ok(SessionLease {
                session_id,
                created: false,
            });
        }

        let _key = self.lock_key(thread_id).await;
        if let Some(session_id) = self.store.get(thread_id).await {
            return Ok(SessionLease {
                session_id,
                created: false,
            });
        }

        let _requested = RequestedMark::new(&self.requested, thread_id);
        let session_id = create().await?;

        match self
            .store
            .compare_and_swap(thread_id, None, Some(&session_id))
            .await
        {
            CasOutcome::Swapped => Ok(SessionLease {
                session_id,
                created: true,
            }),
            CasOutcome::Conflict {
                current: Some(winner),
            } => {
                tracing::warn!(
                    thread_id,
                    discarded_session = %session_id,
                    "session slot already claimed by another writer; adopting it"
                );
                Ok(SessionLease {
                    session_id: winner,
                    created: false,
                })
            }
            CasOutcome::Conflict { current: None } => {
                self.store.put(thread_id, &session_id).await;
                Ok(SessionLease {
                    session_id,
                    created: true,
                })
            }
        }
    }

    pub async fn phase(&self, thread_id: &str) -> SessionPhase {
        if self.store.get(thread_id).await.is_some() {
            SessionPhase::SessionActive
        } else if lock_unpoisoned(&self.requested).contains(thread_id) {
            SessionPhase::SessionRequested
        } else {
            SessionPhase::NoSession
        }
    }

    pub async fn session_for(&self, thread_id: &str) -> Option<String> {
        self.store.get(thread_id).await
    }

    /// Drops the mapping only if it still points at `session_id`.
    pub async fn invalidate(&self, thread_id: &str, session_id: &str) -> bool {
        matches!(
            self.store
                .compare_and_swap(thread_id, Some(session_id), None)
                .await,
            CasOutcome::Swapped
        )
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    async fn lock_key(&self, thread_id: &str) -> KeyLock<'_> {
        let lock = lock_unpoisoned(&self.locks)
            .entry(thread_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        KeyLock {
            locks: &self.locks,
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        }
    }
}

struct KeyLock<'a> {
    locks: &'a KeyLocks,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_unpoisoned(self.locks);
        if locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.thread_id);
        }
    }
}

struct RequestedMark<'a> {
    requested: &'a StdMutex<HashSet<String>>,
    thread_id: String,
}

impl<'a> RequestedMark<'a> {
    fn new(requested: &'a StdMutex<HashSet<String>>, thread_id: &str) -> Self {
        lock_unpoisoned(requested).insert(thread_id.to_string());
        Self {
            requested,
            thread_id: thread_id.to_string(),
        }
    }
}

impl Drop for RequestedMark<'_> {
    fn drop(&mut self) {
        lock_unpoisoned(self.requested).remove(&self.thread_id);
    }
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
