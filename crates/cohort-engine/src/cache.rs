//! Per-evaluation sub-query result cache.
//!
//! Keys are (definition fingerprint, bound parameters). The cache is
//! single-flight: the first requester of a key computes the result while
//! concurrent requesters of the same key block until it is published.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::definition::SubjectId;
use crate::error::{EngineError, EngineResult};
use crate::params::ParameterMap;

/// Shared, immutable result set of one sub-query.
pub type SubjectSet = Arc<HashSet<SubjectId>>;

/// How often a waiter re-checks its cancellation token.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Identity of one sub-query evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    definition: Arc<str>,
    parameters: String,
}

impl CacheKey {
    /// Builds a key from a definition fingerprint and its bound parameters.
    pub fn new(fingerprint: impl Into<Arc<str>>, parameters: &ParameterMap) -> Self {
        Self {
            definition: fingerprint.into(),
            parameters: parameters.canonical(),
        }
    }

    /// The definition fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.definition
    }

    /// The canonical bound parameters.
    pub fn parameters(&self) -> &str {
        &self.parameters
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {{{}}}", self.definition, self.parameters)
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A ready entry existed.
    Hit,
    /// This caller computed the entry.
    Computed,
    /// Another caller computed the entry while this one waited.
    Waited,
}

#[derive(Clone)]
enum Outcome {
    Ready(SubjectSet),
    Failed(EngineError),
    /// The leader stopped without a result (cancelled, timed out or
    /// panicked). Waiters retry under their own token.
    Abandoned,
}

struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn publish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self, token: &CancellationToken) -> EngineResult<Outcome> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(done) = outcome.as_ref() {
                return Ok(done.clone());
            }
            token.check()?;
            self.done.wait_for(&mut outcome, WAIT_SLICE);
        }
    }
}

enum Slot {
    Ready(SubjectSet),
    Pending(Arc<Flight>),
}

/// Removes the pending slot and releases waiters if the leader never
/// finishes, including when `compute` panics.
struct Leader<'a> {
    cache: &'a EvaluationCache,
    key: CacheKey,
    flight: Arc<Flight>,
    finished: bool,
}

impl Leader<'_> {
    fn finish(mut self, ready: Option<SubjectSet>, outcome: Outcome) {
        {
            let mut slots = self.cache.slots.lock();
            match ready {
                Some(set) => slots.insert(self.key.clone(), Slot::Ready(set)),
                None => slots.remove(&self.key),
            };
        }
        self.flight.publish(outcome);
        self.finished = true;
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.slots.lock().remove(&self.key);
            self.flight.publish(Outcome::Abandoned);
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Ready entries.
    pub entries: usize,
    /// Entries currently being computed.
    pub pending: usize,
    /// Lookups answered from a ready entry.
    pub hits: u64,
    /// Lookups that computed their entry.
    pub computations: u64,
    /// Lookups that waited on another caller's computation.
    pub waits: u64,
    /// Computations that failed.
    pub failures: u64,
}

/// Single-flight cache of sub-query results.
///
/// Scoped to one top-level evaluation (or one indicator batch); nothing is
/// retained across calls unless the caller keeps the cache alive and passes
/// it to [`CohortEngine::evaluate_in`](crate::CohortEngine::evaluate_in).
///
/// # Example
///
/// ```rust
/// use std::collections::HashSet;
/// use cohort_engine::{CacheKey, CancellationToken, EvaluationCache, Lookup, ParameterMap};
///
/// let cache = EvaluationCache::new();
/// let token = CancellationToken::new();
/// let key = CacheKey::new("enc([\"ANC\"])", &ParameterMap::new());
///
/// let (set, lookup) = cache
///     .get_or_compute(&key, &token, || Ok([1, 2, 3].into_iter().collect::<HashSet<_>>()))
///     .unwrap();
/// assert_eq!(set.len(), 3);
/// assert_eq!(lookup, Lookup::Computed);
///
/// let (_, lookup) = cache.get_or_compute(&key, &token, || unreachable!()).unwrap();
/// assert_eq!(lookup, Lookup::Hit);
/// ```
pub struct EvaluationCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    hits: AtomicU64,
    computations: AtomicU64,
    waits: AtomicU64,
    failures: AtomicU64,
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Returns the ready result for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<SubjectSet> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(set)) => Some(set.clone()),
            _ => None,
        }
    }

    /// Returns true if a ready result exists for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Ready(_)))
    }

    /// Number of ready entries.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Returns true if there are no ready entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every ready entry. In-flight computations are unaffected.
    pub fn clear(&self) {
        self.slots
            .lock()
            .retain(|_, slot| matches!(slot, Slot::Pending(_)));
    }

    /// Returns the cached result for `key`, computing it with `compute` if
    /// no caller has done so yet.
    ///
    /// If another caller is already computing the same key, this call waits
    /// for that result instead of computing it again. While waiting it polls
    /// `token`, so a cancelled waiter returns promptly. A failed computation
    /// leaves no entry behind; its error is handed to every waiter, except
    /// for cancellation and timeouts, after which waiters retry under their
    /// own token.
    pub fn get_or_compute<F>(
        &self,
        key: &CacheKey,
        token: &CancellationToken,
        compute: F,
    ) -> EngineResult<(SubjectSet, Lookup)>
    where
        F: FnOnce() -> EngineResult<HashSet<SubjectId>>,
    {
        loop {
            let flight = {
                let mut slots = self.slots.lock();
                let pending = match slots.get(key) {
                    Some(Slot::Ready(set)) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok((set.clone(), Lookup::Hit));
                    }
                    Some(Slot::Pending(flight)) => Some(flight.clone()),
                    None => None,
                };
                match pending {
                    Some(flight) => flight,
                    None => {
                        let flight = Arc::new(Flight::new());
                        slots.insert(key.clone(), Slot::Pending(flight.clone()));
                        drop(slots);
                        return self.lead(key, flight, compute);
                    }
                }
            };

            self.waits.fetch_add(1, Ordering::Relaxed);
            trace!("waiting on in-flight sub-query {}", key);
            match flight.wait(token)? {
                Outcome::Ready(set) => return Ok((set, Lookup::Waited)),
                Outcome::Failed(err) => return Err(err),
                Outcome::Abandoned => token.check()?,
            }
        }
    }

    fn lead<F>(
        &self,
        key: &CacheKey,
        flight: Arc<Flight>,
        compute: F,
    ) -> EngineResult<(SubjectSet, Lookup)>
    where
        F: FnOnce() -> EngineResult<HashSet<SubjectId>>,
    {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let leader = Leader {
            cache: self,
            key: key.clone(),
            flight,
            finished: false,
        };

        match compute() {
            Ok(set) => {
                let set: SubjectSet = Arc::new(set);
                leader.finish(Some(set.clone()), Outcome::Ready(set.clone()));
                Ok((set, Lookup::Computed))
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let outcome = match err {
                    EngineError::Cancelled | EngineError::Timeout(_) => Outcome::Abandoned,
                    _ => Outcome::Failed(err.clone()),
                };
                leader.finish(None, outcome);
                Err(err)
            }
        }
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let (entries, pending) = {
            let slots = self.slots.lock();
            let entries = slots
                .values()
                .filter(|slot| matches!(slot, Slot::Ready(_)))
                .count();
            (entries, slots.len() - entries)
        };
        CacheStats {
            entries,
            pending,
            hits: self.hits.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for EvaluationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("EvaluationCache")
            .field("entries", &stats.entries)
            .field("pending", &stats.pending)
            .field("hits", &stats.hits)
            .finish()
    }
}
