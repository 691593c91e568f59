//! Replay-nonce manager: a bounded TTL map of single-use tokens, each
//! bound to the account it was issued to (or anonymous).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Lower bound on the nonce cache size.
const MIN_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct NonceEntry {
    /// `None` marks an anonymous nonce, consumable by any caller.
    account_id: Option<String>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct NonceStore {
    entries: HashMap<String, NonceEntry>,
    /// Insertion order, oldest first, for capacity eviction.
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct NonceManager {
    store: Mutex<NonceStore>,
    ttl: Duration,
    capacity: usize,
}

impl NonceManager {
    pub fn new(ttl_seconds: u64) -> Self {
        Self::with_capacity(ttl_seconds, MIN_CAPACITY)
    }

    fn with_capacity(ttl_seconds: u64, capacity: usize) -> Self {
        Self {
            store: Mutex::new(NonceStore::default()),
            ttl: Duration::from_secs(ttl_seconds),
            capacity: capacity.max(1),
        }
    }

    /// Issue a fresh 256-bit URL-safe nonce bound to `account_id`.
    pub fn new_nonce(&self, account_id: Option<&str>) -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);

        let mut store = self.store.lock();
        while store.entries.len() >= self.capacity {
            match store.order.pop_front() {
                Some(oldest) => {
                    store.entries.remove(&oldest);
                }
                None => break,
            }
        }
        store.entries.insert(
            nonce.clone(),
            NonceEntry {
                account_id: account_id.map(str::to_string),
                expires_at: Instant::now() + self.ttl,
            },
        );
        store.order.push_back(nonce.clone());

        nonce
    }

    /// Consume a nonce. Succeeds iff it exists, has not expired and was
    /// issued anonymously or to this same account. The entry is removed
    /// on success.
    pub fn pop_nonce(&self, nonce: &str, account_id: Option<&str>) -> bool {
        let mut store = self.store.lock();
        let Some(entry) = store.entries.get(nonce) else {
            return false;
        };
        if entry.expires_at < Instant::now() {
            store.entries.remove(nonce);
            return false;
        }
        match &entry.account_id {
            None => {}
            Some(owner) => {
                if account_id != Some(owner.as_str()) {
                    return false;
                }
            }
        }
        store.entries.remove(nonce);
        true
    }
}
