//! Thread-safe LRU for compiled grammars, with per-key single-flight.
//!
//! Multiple concurrent compilations of the same input produce exactly one
//! computation; the other callers block on a condvar and receive a clone of
//! the winner's artifact. Entries are accounted in bytes and evicted LRU.

use std::collections::HashSet;
use std::hash::Hash;

use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::error::Result;

struct State<K: Hash + Eq, V> {
    entries: LruCache<K, (V, usize)>,
    bytes: usize,
    in_flight: HashSet<K>,
}

/// Byte-bounded LRU with single-flight computation.
pub struct ThreadSafeLruCache<K: Hash + Eq + Clone, V: Clone> {
    state: Mutex<State<K, V>>,
    cond: Condvar,
    capacity_bytes: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> ThreadSafeLruCache<K, V> {
    /// Create a cache bounded to `capacity_bytes` (`usize::MAX` for
    /// unlimited, 0 to disable).
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                bytes: 0,
                in_flight: HashSet::new(),
            }),
            cond: Condvar::new(),
            capacity_bytes,
        }
    }

    /// Byte capacity.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Current size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    /// Return the cached value for `key`, or run `compute` to produce it.
    ///
    /// `compute` returns the value plus its byte size. Concurrent callers
    /// with the same key wait for the first one; when the computation fails
    /// the error goes to that caller and a waiter takes over the key.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<(V, usize)>,
    {
        {
            let mut state = self.state.lock();
            loop {
                if let Some((value, _)) = state.entries.get(&key) {
                    return Ok(value.clone());
                }
                if !state.in_flight.contains(&key) {
                    state.in_flight.insert(key.clone());
                    break;
                }
                self.cond.wait(&mut state);
            }
        }

        let outcome = compute();

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        self.cond.notify_all();
        match outcome {
            Ok((value, size)) => {
                if size <= self.capacity_bytes {
                    state.entries.put(key, (value.clone(), size));
                    state.bytes += size;
                    while state.bytes > self.capacity_bytes {
                        let Some((_, (_, evicted))) = state.entries.pop_lru() else {
                            break;
                        };
                        state.bytes -= evicted;
                    }
                }
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop every cached entry (in-flight computations are unaffected).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }
}
