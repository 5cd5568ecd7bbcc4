//! Memo tables for packrat parsing and bounded left recursion
//!
//! Both tables live in the per-parse session state and are dropped at the end
//! of every `parse_string` / `scan_string` call, so stale entries never leak
//! between parses.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use serde::Serialize;

use crate::config::CacheLimit;
use crate::error::Failure;
use crate::grammar::ExprId;
use crate::results::ParseResults;

/// Packrat cache counters for one parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries held by the packrat cache or recursion memo when the parse ended
    pub entries: usize,
}

/// Cached outcome of one match attempt.
pub(crate) type Outcome = Result<(usize, ParseResults), Failure>;

/// `(expression, location, pre-parse, actions enabled)`
pub(crate) type PackratKey = (ExprId, usize, bool, bool);

/// Memoization of every match attempt, evicting oldest entries first when bounded.
#[derive(Debug)]
pub(crate) struct PackratCache {
    limit: Option<usize>,
    map: HashMap<PackratKey, Outcome>,
    order: VecDeque<PackratKey>,
}

impl PackratCache {
    pub fn new(limit: CacheLimit) -> Self {
        let limit = match limit {
            CacheLimit::Unbounded => None,
            CacheLimit::Bounded(n) => Some(n.max(1)),
        };
        Self {
            limit,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &PackratKey) -> Option<&Outcome> {
        self.map.get(key)
    }

    pub fn insert(&mut self, key: PackratKey, value: Outcome) {
        if self.map.insert(key, value).is_some() {
            return;
        }
        if let Some(limit) = self.limit {
            self.order.push_back(key);
            while self.order.len() > limit {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// `(location, expression, actions enabled)`
pub(crate) type RecursionKey = (usize, ExprId, bool);

/// Best expansion found so far: its end (one before the start for the
/// failing seed) and its tokens or failure.
pub(crate) type MemoEntry = (isize, Result<ParseResults, Failure>);

/// Seed memo for bounded left recursion.
///
/// Entries for finished recursions are "deleted" by moving them into a
/// bounded recent-memory area, where they remain retrievable until evicted
/// in least-recently-used order. In unbounded mode nothing is ever evicted.
#[derive(Debug)]
pub(crate) struct RecursionMemo<K = RecursionKey, V = MemoEntry> {
    capacity: Option<usize>,
    active: HashMap<K, V>,
    memory: HashMap<K, V>,
    /// Recency order of `memory`, oldest first
    recency: VecDeque<K>,
}

impl<K: Copy + Eq + Hash, V> RecursionMemo<K, V> {
    pub fn new(limit: CacheLimit) -> Self {
        let capacity = match limit {
            CacheLimit::Unbounded => None,
            CacheLimit::Bounded(n) => Some(n.max(1)),
        };
        Self {
            capacity,
            active: HashMap::new(),
            memory: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.active.contains_key(key) {
            return self.active.get(key);
        }
        if self.memory.contains_key(key) {
            self.touch(key);
            return self.memory.get(key);
        }
        None
    }

    pub fn set(&mut self, key: K, value: V) {
        if self.memory.remove(&key).is_some() {
            self.recency.retain(|k| k != &key);
        }
        self.active.insert(key, value);
    }

    /// Retire an entry once its recursion has finished.
    pub fn delete(&mut self, key: &K) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if let Some(value) = self.active.remove(key) {
            self.memory.insert(*key, value);
            self.touch(key);
            while self.recency.len() > capacity {
                if let Some(old) = self.recency.pop_front() {
                    self.memory.remove(&old);
                }
            }
        }
    }

    fn touch(&mut self, key: &K) {
        self.recency.retain(|k| k != key);
        self.recency.push_back(*key);
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.memory.len()
    }
}
