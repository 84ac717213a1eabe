use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::r#trait::{AtomicOps, KvStore, ReconcileOutcome, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn string(value: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            value: Value::Str(value.into()),
            expires_at,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn as_str(&self) -> Result<&str, StoreError> {
        match &self.value {
            Value::Str(s) => Ok(s),
            Value::List(_) => Err(wrong_type()),
        }
    }

    fn as_int(&self) -> Result<i64, StoreError> {
        self.as_str()?.parse::<i64>().map_err(|_| {
            StoreError::Command("ERR value is not an integer or out of range".to_string())
        })
    }
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

type Entries = HashMap<String, Entry>;

/// In-memory store with per-key TTLs.
///
/// Intended for tests/dev. Each atomic operation runs under one lock, which
/// gives the same linearizability a server-side script gives on Redis.
/// Time comes from `tokio::time`, so paused-clock tests can expire keys.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<Entries>,
    unavailable: AtomicBool,
    injected_failures: Mutex<Vec<&'static str>>,
    calls: AtomicU64,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a connection error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next call of operation `op` (e.g. `"set_if_absent"`) fail
    /// with a connection error. Other operations are unaffected.
    pub fn fail_next(&self, op: &'static str) {
        self.injected_failures.lock().push(op);
    }

    /// Number of store calls attempted so far (including failed ones).
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Raw expiry instant of a live key, `None` when absent or persistent.
    pub fn expires_at(&self, key: &str) -> Option<Instant> {
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, Instant::now());
        entries.get(key).and_then(|e| e.expires_at)
    }

    fn check_available(&self, op: &'static str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(
                "connection refused (store marked unavailable)".to_string(),
            ));
        }
        let mut injected = self.injected_failures.lock();
        if let Some(idx) = injected.iter().position(|failing| *failing == op) {
            injected.remove(idx);
            return Err(StoreError::Connection(format!("injected failure for {op}")));
        }
        Ok(())
    }

    /// Run `f` against the live (non-expired) view of `key`.
    fn with_key<T>(
        &self,
        op: &'static str,
        key: &str,
        f: impl FnOnce(&mut Entries, Instant) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check_available(op)?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge_expired(&mut entries, key, now);
        f(&mut entries, now)
    }
}

fn purge_expired(entries: &mut Entries, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

/// Resolve a Redis-style inclusive range to a half-open slice range.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize + 1))
}

/// Glob match supporting only `*`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if candidate.len() < first.len() + last.len()
        || !candidate.starts_with(first)
        || !candidate.ends_with(last)
    {
        return false;
    }
    let mut rest = &candidate[first.len()..candidate.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl AtomicOps for InMemoryKvStore {
    async fn acquire_slot(&self, key: &str, limit: i64, ttl: Duration) -> Result<i64, StoreError> {
        if limit <= 0 {
            self.check_available("acquire_slot")?;
            return Ok(1);
        }

        self.with_key("acquire_slot", key, |entries, now| {
            let current = match entries.get(key) {
                Some(entry) => entry.as_int()?,
                None => 0,
            };
            let next = current + 1;

            if next > limit {
                // Increment-then-undo leaves the value and its TTL untouched.
                if current <= 0 {
                    entries.remove(key);
                }
                return Ok(0);
            }

            entries.insert(key.to_string(), Entry::string(next.to_string(), Some(now + ttl)));
            Ok(next)
        })
    }

    async fn release_slot(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.with_key("release_slot", key, |entries, now| {
            let Some(entry) = entries.get(key) else {
                return Ok(0);
            };
            let remaining = entry.as_int()? - 1;

            if remaining <= 0 {
                entries.remove(key);
                return Ok(0);
            }

            entries.insert(key.to_string(), Entry::string(remaining.to_string(), Some(now + ttl)));
            Ok(remaining)
        })
    }

    async fn refresh_leader_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.with_key("refresh_leader_lock", key, |entries, now| match entries.get_mut(key) {
            Some(entry) if entry.as_str().is_ok_and(|v| v == owner) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn release_leader_lock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.with_key("release_leader_lock", key, |entries, _| {
            let owned = entries
                .get(key)
                .is_some_and(|entry| entry.as_str().is_ok_and(|v| v == owner));
            if owned {
                entries.remove(key);
            }
            Ok(owned)
        })
    }

    async fn reconcile_counter(
        &self,
        key: &str,
        observed: i64,
        new_value: i64,
        ttl_secs: i64,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.with_key("reconcile_counter", key, |entries, now| {
            if ttl_secs <= 0 {
                return Ok(ReconcileOutcome::InvalidTtl);
            }
            let Some(entry) = entries.get(key) else {
                return Ok(ReconcileOutcome::Deleted);
            };
            let Some(current) = entry.as_str().ok().and_then(|v| v.parse::<i64>().ok()) else {
                return Ok(ReconcileOutcome::Invalid);
            };
            if current != observed {
                return Ok(ReconcileOutcome::Mismatch { current });
            }
            if new_value <= 0 {
                entries.remove(key);
                return Ok(ReconcileOutcome::Cleared);
            }

            let ttl = Duration::from_secs(ttl_secs as u64);
            entries.insert(key.to_string(), Entry::string(new_value.to_string(), Some(now + ttl)));
            Ok(ReconcileOutcome::Set)
        })
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_key("get", key, |entries, _| match entries.get(key) {
            Some(entry) => entry.as_str().map(|v| Some(v.to_string())),
            None => Ok(None),
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_key("set_with_ttl", key, |entries, now| {
            entries.insert(key.to_string(), Entry::string(value, Some(now + ttl)));
            Ok(())
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.with_key("set_if_absent", key, |entries, now| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(key.to_string(), Entry::string(value, Some(now + ttl)));
            Ok(true)
        })
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_key("take", key, |entries, _| match entries.get(key) {
            None => Ok(None),
            Some(entry) => {
                let value = entry.as_str()?.to_string();
                entries.remove(key);
                Ok(Some(value))
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_key("delete", key, |entries, _| Ok(entries.remove(key).is_some()))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.with_key("list_push", key, |entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(items) => {
                    items.push_back(value.to_string());
                    Ok(items.len())
                }
                Value::Str(_) => Err(wrong_type()),
            }
        })
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.with_key("list_range", key, |entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Str(_)) => Err(wrong_type()),
            Some(Value::List(items)) => Ok(match resolve_range(items.len(), start, stop) {
                Some((from, to)) => items.range(from..to).cloned().collect(),
                None => Vec::new(),
            }),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.with_key("list_remove", key, |entries, _| {
            let removed = match entries.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(0),
                Some(Value::Str(_)) => return Err(wrong_type()),
                Some(Value::List(items)) => match items.iter().position(|item| item == value) {
                    Some(idx) => {
                        items.remove(idx);
                        1
                    }
                    None => 0,
                },
            };
            // Redis drops a list key once it has no elements.
            if matches!(entries.get(key).map(|e| &e.value), Some(Value::List(items)) if items.is_empty())
            {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.with_key("list_len", key, |entries, _| match entries.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Str(_)) => Err(wrong_type()),
            Some(Value::List(items)) => Ok(items.len()),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check_available("scan_keys")?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
