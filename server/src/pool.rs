//! Connection pool: capacity gate, per-connection audio token bucket and
//! idle-activity tracking. The pool tracks connections but owns no session
//! state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Refill-at-1Hz token bucket for inbound audio frames.
#[derive(Debug)]
pub struct AudioBucket {
    capacity: u32,
    tokens: u32,
    last_refill: Instant,
}

impl AudioBucket {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token; false means the frame should be silently dropped.
    pub fn try_take(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= Duration::from_secs(1) {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

struct ConnectionEntry {
    last_activity: Instant,
    audio_bucket: AudioBucket,
}

pub struct ConnectionPool {
    inner: Mutex<HashMap<Uuid, ConnectionEntry>>,
    capacity: usize,
    frames_per_sec: u32,
}

impl ConnectionPool {
    pub fn new(capacity: usize, frames_per_sec: u32) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
            frames_per_sec,
        }
    }

    /// Admit a new connection; `None` when the pool is at capacity.
    pub fn register(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() >= self.capacity {
            return None;
        }
        let id = Uuid::new_v4();
        inner.insert(
            id,
            ConnectionEntry {
                last_activity: Instant::now(),
                audio_bucket: AudioBucket::new(self.frames_per_sec),
            },
        );
        Some(id)
    }

    pub fn touch(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Rate-gate one audio frame for this connection.
    pub fn admit_audio_frame(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(&id) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                entry.audio_bucket.try_take()
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&id);
    }

    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Connections idle past `ttl`, removed and returned for closure.
    pub fn sweep_idle(&self, ttl: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<Uuid> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let pool = ConnectionPool::new(2, 10);
        let a = pool.register();
        let b = pool.register();
        assert!(a.is_some() && b.is_some());
        assert!(pool.register().is_none());
        pool.remove(a.unwrap());
        assert!(pool.register().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn audio_bucket_drops_excess_within_a_second() {
        let pool = ConnectionPool::new(1, 3);
        let id = pool.register().unwrap();
        assert!(pool.admit_audio_frame(id));
        assert!(pool.admit_audio_frame(id));
        assert!(pool.admit_audio_frame(id));
        // Fourth frame in the same second is dropped.
        assert!(!pool.admit_audio_frame(id));
        // Bucket refills after a second.
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(pool.admit_audio_frame(id));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_removes_stale_connections() {
        let pool = ConnectionPool::new(4, 10);
        let stale = pool.register().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let fresh = pool.register().unwrap();
        let swept = pool.sweep_idle(Duration::from_secs(5));
        assert_eq!(swept, vec![stale]);
        assert_eq!(pool.active(), 1);
        assert!(pool.admit_audio_frame(fresh));
    }

    #[test]
    fn unknown_connection_admits_nothing() {
        let pool = ConnectionPool::new(1, 10);
        assert!(!pool.admit_audio_frame(Uuid::new_v4()));
    }
}
