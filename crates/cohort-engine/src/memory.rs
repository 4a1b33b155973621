//! In-memory [`DataStore`] and [`Dictionary`] implementations.
//!
//! Useful for tests and for embedding applications that already hold their
//! facts in memory. The store counts its calls so callers can assert how
//! often the engine reached for data.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDate;

use crate::cancel::CancellationToken;
use crate::definition::{ConceptRef, SubjectId};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::params::{DateRange, ParameterMap};
use crate::traits::{DataStore, Dictionary, ObservationQuery, ResolvedValue};

/// Dictionary backed by a hash map of code to concept.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDictionary {
    concepts: HashMap<String, ConceptRef>,
}

impl InMemoryDictionary {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a concept, returning the dictionary (builder style).
    pub fn with_concept(mut self, code: impl Into<String>, id: u64) -> Self {
        self.register(code, id);
        self
    }

    /// Registers a concept.
    pub fn register(&mut self, code: impl Into<String>, id: u64) {
        let code = code.into();
        self.concepts
            .insert(code.clone(), ConceptRef::new(id, code));
    }

    /// Number of registered concepts.
    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    /// Returns true if no concepts are registered.
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

impl Dictionary for InMemoryDictionary {
    fn resolve_concept(&self, code: &str) -> EngineResult<ConceptRef> {
        self.concepts
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConcept(code.to_string()))
    }
}

/// Value recorded for an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedValue {
    /// No value (presence only).
    Empty,
    /// Coded answer concept id.
    Coded(u64),
    /// Numeric value.
    Numeric(f64),
    /// Text value.
    Text(String),
}

#[derive(Debug, Clone)]
struct ObservationRecord {
    subject: SubjectId,
    concept: u64,
    value: ObservedValue,
    date: NaiveDate,
    encounter_type: Option<String>,
}

impl ObservationRecord {
    fn matches(&self, query: &ObservationQuery) -> bool {
        if self.concept != query.question.id || !query.range.contains(self.date) {
            return false;
        }
        if !query.encounter_types.is_empty() {
            match &self.encounter_type {
                Some(kind) if query.encounter_types.contains(kind) => {}
                _ => return false,
            }
        }
        match (&query.value, &self.value) {
            (None, _) => true,
            (Some(ResolvedValue::Coded(answers)), ObservedValue::Coded(id)) => {
                answers.iter().any(|answer| answer.id == *id)
            }
            (Some(ResolvedValue::Numeric(bounds)), ObservedValue::Numeric(n)) => {
                bounds.iter().all(|bound| bound.matches(*n))
            }
            (Some(ResolvedValue::Text(expected)), ObservedValue::Text(text)) => expected == text,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct EncounterRecord {
    subject: SubjectId,
    encounter_type: String,
    date: NaiveDate,
}

type Calculation =
    Arc<dyn Fn(&ParameterMap) -> Result<HashSet<SubjectId>, StoreError> + Send + Sync>;

/// Counters of store calls.
#[derive(Debug, Default)]
struct CallCounters {
    observation: AtomicUsize,
    encounter: AtomicUsize,
    calculation: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Tracks concurrent calls for the lifetime of one store call.
struct InFlight<'a>(&'a CallCounters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a CallCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Data store holding observations, encounters and calculations in memory.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use cohort_engine::memory::InMemoryStore;
///
/// let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
/// let mut store = InMemoryStore::new();
/// store.add_encounter(1, "ANC_VISIT", day);
/// store.add_encounter(2, "SMC", day);
/// store.register_calculation("onArt", |_params| Ok([2].into_iter().collect()));
///
/// assert_eq!(store.total_calls(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    observations: Vec<ObservationRecord>,
    encounters: Vec<EncounterRecord>,
    calculations: HashMap<String, Calculation>,
    latency: Duration,
    counters: CallCounters,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take at least `latency`, polling the token meanwhile.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Records an observation.
    pub fn add_observation(
        &mut self,
        subject: SubjectId,
        concept: u64,
        value: ObservedValue,
        date: NaiveDate,
    ) {
        self.observations.push(ObservationRecord {
            subject,
            concept,
            value,
            date,
            encounter_type: None,
        });
    }

    /// Records an observation taken during an encounter of `encounter_type`.
    pub fn add_encounter_observation(
        &mut self,
        subject: SubjectId,
        concept: u64,
        value: ObservedValue,
        date: NaiveDate,
        encounter_type: impl Into<String>,
    ) {
        self.observations.push(ObservationRecord {
            subject,
            concept,
            value,
            date,
            encounter_type: Some(encounter_type.into()),
        });
    }

    /// Records an encounter.
    pub fn add_encounter(
        &mut self,
        subject: SubjectId,
        encounter_type: impl Into<String>,
        date: NaiveDate,
    ) {
        self.encounters.push(EncounterRecord {
            subject,
            encounter_type: encounter_type.into(),
            date,
        });
    }

    /// Registers a calculation under `name`.
    pub fn register_calculation<F>(&mut self, name: impl Into<String>, calculation: F)
    where
        F: Fn(&ParameterMap) -> Result<HashSet<SubjectId>, StoreError> + Send + Sync + 'static,
    {
        self.calculations.insert(name.into(), Arc::new(calculation));
    }

    /// Observation filter calls so far.
    pub fn observation_calls(&self) -> usize {
        self.counters.observation.load(Ordering::SeqCst)
    }

    /// Encounter filter calls so far.
    pub fn encounter_calls(&self) -> usize {
        self.counters.encounter.load(Ordering::SeqCst)
    }

    /// Calculation calls so far.
    pub fn calculation_calls(&self) -> usize {
        self.counters.calculation.load(Ordering::SeqCst)
    }

    /// All calls so far.
    pub fn total_calls(&self) -> usize {
        self.observation_calls() + self.encounter_calls() + self.calculation_calls()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Resets all counters.
    pub fn reset_counters(&self) {
        self.counters.observation.store(0, Ordering::SeqCst);
        self.counters.encounter.store(0, Ordering::SeqCst);
        self.counters.calculation.store(0, Ordering::SeqCst);
        self.counters.peak_in_flight.store(0, Ordering::SeqCst);
    }

    fn pause(&self, token: &CancellationToken) -> Result<(), StoreError> {
        let started = Instant::now();
        loop {
            token.check().map_err(|err| match err {
                EngineError::Timeout(_) => StoreError::DeadlineExceeded,
                _ => StoreError::Cancelled,
            })?;
            let elapsed = started.elapsed();
            if elapsed >= self.latency {
                return Ok(());
            }
            thread::sleep((self.latency - elapsed).min(Duration::from_millis(5)));
        }
    }
}

impl DataStore for InMemoryStore {
    fn evaluate_observation_filter(
        &self,
        query: &ObservationQuery,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError> {
        self.counters.observation.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.pause(token)?;
        Ok(self
            .observations
            .iter()
            .filter(|record| record.matches(query))
            .map(|record| record.subject)
            .collect())
    }

    fn evaluate_encounter_filter(
        &self,
        encounter_types: &[String],
        range: &DateRange,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError> {
        self.counters.encounter.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.pause(token)?;
        Ok(self
            .encounters
            .iter()
            .filter(|record| {
                (encounter_types.is_empty() || encounter_types.contains(&record.encounter_type))
                    && range.contains(record.date)
            })
            .map(|record| record.subject)
            .collect())
    }

    fn evaluate_calculation(
        &self,
        name: &str,
        context: &ParameterMap,
        token: &CancellationToken,
    ) -> Result<HashSet<SubjectId>, StoreError> {
        self.counters.calculation.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.pause(token)?;
        let calculation = self
            .calculations
            .get(name)
            .ok_or_else(|| StoreError::Backend(format!("no calculation named '{}'", name)))?;
        calculation(context)
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut calculations: Vec<&str> = self.calculations.keys().map(String::as_str).collect();
        calculations.sort_unstable();
        f.debug_struct("InMemoryStore")
            .field("observations", &self.observations.len())
            .field("encounters", &self.encounters.len())
            .field("calculations", &calculations)
            .field("latency", &self.latency)
            .finish()
    }
}
