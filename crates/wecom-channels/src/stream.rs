//! Stream reply sessions.
//!
//! A stream session is a server-side placeholder for a reply that later
//! outbound writes fill in. The platform polls it by id until it is closed.
//!
//! Each session sits behind its own mutex so an outbound append and an
//! inbound drain only contend on that one session. A second map from
//! `(account, target)` to the open stream id enforces the single-open rule:
//! its entry lock serializes concurrent opens for the same pair.
//!
//! Lock order is `active` entry, then `sessions` shard, then session mutex.
//! Nothing takes them in the other direction.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Open,
    Closed,
}

/// Result of a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDrain {
    /// Chunks appended since the previous drain, in append order.
    pub chunks: Vec<String>,
    /// Status at drain time.
    pub status: StreamStatus,
    /// Every chunk so far, concatenated.
    pub content: String,
}

impl StreamDrain {
    /// Whether the session is closed and nothing new arrived since the last drain.
    pub fn is_terminal(&self) -> bool {
        self.status == StreamStatus::Closed && self.chunks.is_empty()
    }
}

#[derive(Debug)]
struct StreamSession {
    account_id: String,
    target: String,
    chunks: Vec<String>,
    cursor: usize,
    status: StreamStatus,
    created_at: Instant,
    last_access: Instant,
}

impl StreamSession {
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl
    }
}

type Slot = Arc<Mutex<StreamSession>>;

/// Concurrent registry of in-flight stream sessions.
pub struct StreamSessionTable {
    sessions: DashMap<String, Slot>,
    active: DashMap<(String, String), String>,
    ttl: Duration,
}

impl StreamSessionTable {
    /// Create an empty table with the given idle TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            active: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Open a new session for `(account_id, target)`, closing any open one.
    pub fn open(&self, account_id: &str, target: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let slot = Arc::new(Mutex::new(StreamSession {
            account_id: account_id.to_string(),
            target: target.to_string(),
            chunks: Vec::new(),
            cursor: 0,
            status: StreamStatus::Open,
            created_at: now,
            last_access: now,
        }));
        // Not reachable through `active` until the entry below is written.
        self.sessions.insert(id.clone(), slot);

        match self.active.entry((account_id.to_string(), target.to_string())) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(id.clone());
                if let Some(prev) = self.slot(&previous) {
                    lock(&prev).status = StreamStatus::Closed;
                }
                debug!(account = %account_id, target = %target, previous = %previous, stream = %id, "Replaced open stream");
            }
            Entry::Vacant(entry) => {
                entry.insert(id.clone());
                debug!(account = %account_id, target = %target, stream = %id, "Opened stream");
            }
        }
        id
    }

    /// Append a chunk to an open session.
    ///
    /// Returns `false` when the session is unknown, expired or closed.
    pub fn append(&self, stream_id: &str, chunk: &str) -> bool {
        let Some(slot) = self.slot(stream_id) else {
            return false;
        };
        let now = Instant::now();
        let mut session = lock(&slot);
        if session.expired(now, self.ttl) {
            drop(session);
            self.evict(stream_id);
            return false;
        }
        if session.status == StreamStatus::Closed {
            return false;
        }
        session.chunks.push(chunk.to_string());
        session.last_access = now;
        true
    }

    /// Take the chunks appended since the previous drain.
    ///
    /// Returns `None` when the session is unknown or expired.
    pub fn drain(&self, stream_id: &str) -> Option<StreamDrain> {
        self.drain_where(stream_id, |_| true)
    }

    /// [`drain`](Self::drain) restricted to sessions owned by `account_id`.
    ///
    /// A session of another account is reported as unknown and left untouched.
    pub fn drain_for(&self, account_id: &str, stream_id: &str) -> Option<StreamDrain> {
        self.drain_where(stream_id, |session| session.account_id == account_id)
    }

    fn drain_where(
        &self,
        stream_id: &str,
        owned: impl Fn(&StreamSession) -> bool,
    ) -> Option<StreamDrain> {
        let slot = self.slot(stream_id)?;
        let now = Instant::now();
        let mut session = lock(&slot);
        if session.expired(now, self.ttl) {
            drop(session);
            self.evict(stream_id);
            return None;
        }
        if !owned(&session) {
            return None;
        }
        let chunks = session.chunks[session.cursor..].to_vec();
        session.cursor = session.chunks.len();
        session.last_access = now;
        Some(StreamDrain {
            chunks,
            status: session.status,
            content: session.chunks.concat(),
        })
    }

    /// Mark a session closed. Returns `false` if it was unknown.
    pub fn close(&self, stream_id: &str) -> bool {
        let Some(slot) = self.slot(stream_id) else {
            return false;
        };
        let key = {
            let mut session = lock(&slot);
            session.status = StreamStatus::Closed;
            session.last_access = Instant::now();
            (session.account_id.clone(), session.target.clone())
        };
        self.active.remove_if(&key, |_, open| open == stream_id);
        true
    }

    /// Current status of a live session.
    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        let slot = self.slot(stream_id)?;
        let session = lock(&slot);
        if session.expired(Instant::now(), self.ttl) {
            return None;
        }
        Some(session.status)
    }

    /// Id of the open session for `(account_id, target)`, if any.
    pub fn active_stream(&self, account_id: &str, target: &str) -> Option<String> {
        let id = self
            .active
            .get(&(account_id.to_string(), target.to_string()))
            .map(|entry| entry.value().clone())?;
        match self.status(&id) {
            Some(StreamStatus::Open) => Some(id),
            _ => None,
        }
    }

    /// Append to the open session for `(account_id, target)`.
    ///
    /// Returns the stream id on success.
    pub fn append_to_active(&self, account_id: &str, target: &str, chunk: &str) -> Option<String> {
        let id = self
            .active
            .get(&(account_id.to_string(), target.to_string()))
            .map(|entry| entry.value().clone())?;
        self.append(&id, chunk).then_some(id)
    }

    /// Close the open session for `(account_id, target)`.
    pub fn close_active(&self, account_id: &str, target: &str) -> bool {
        let id = self
            .active
            .get(&(account_id.to_string(), target.to_string()))
            .map(|entry| entry.value().clone());
        match id {
            Some(id) => self.close(&id),
            None => false,
        }
    }

    /// Remove every session idle for longer than the TTL, open or closed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut evicted = Vec::new();
        self.sessions.retain(|id, slot| {
            let session = lock(slot);
            if session.expired(now, ttl) {
                debug!(
                    stream = %id,
                    age_ms = now.saturating_duration_since(session.created_at).as_millis() as u64,
                    "Evicting idle stream"
                );
                evicted.push((
                    id.clone(),
                    (session.account_id.clone(), session.target.clone()),
                ));
                false
            } else {
                true
            }
        });
        for (id, key) in &evicted {
            self.active.remove_if(key, |_, open| open == id);
        }
        evicted.len()
    }

    /// Run `evict_expired` every `interval` until `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = table.evict_expired();
                        if evicted > 0 {
                            info!(evicted, remaining = table.len(), "Stream sweep");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn slot(&self, stream_id: &str) -> Option<Slot> {
        self.sessions.get(stream_id).map(|s| Arc::clone(s.value()))
    }

    fn evict(&self, stream_id: &str) {
        let ttl = self.ttl;
        let removed = self
            .sessions
            .remove_if(stream_id, |_, slot| lock(slot).expired(Instant::now(), ttl));
        if let Some((id, slot)) = removed {
            let key = {
                let session = lock(&slot);
                (session.account_id.clone(), session.target.clone())
            };
            self.active.remove_if(&key, |_, open| *open == id);
        }
    }
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, StreamSession> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
