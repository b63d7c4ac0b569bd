use std::time::{Duration, Instant};

use dashmap::DashMap;

// Minimal key-value surface the health machinery needs. A deployment may
// back this with Redis; `MemoryKv` keeps everything in-process.
pub trait KvStore: Send + Sync {
    // Atomic increment; missing or expired keys count from zero.
    fn incr(&self, key: &str) -> i64;
    // Attach a TTL to an existing key. Returns false when the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> bool;
    fn setex(&self, key: &str, ttl: Duration, value: &str);
    fn get(&self, key: &str) -> Option<String>;
    fn del(&self, key: &str) -> bool;
}

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_if_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| entry.expired());
    }
}

impl KvStore for MemoryKv {
    fn incr(&self, key: &str) -> i64 {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KvEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.expired() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        next
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.drop_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn setex(&self, key: &str, ttl: Duration, value: &str) {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        self.drop_if_expired(key);
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn del(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}
