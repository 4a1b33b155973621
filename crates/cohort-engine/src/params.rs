//! Typed runtime parameters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;

use crate::error::{EngineError, EngineResult};

/// Parameter read by atomic filters as the inclusive lower date bound.
pub const ON_OR_AFTER: &str = "onOrAfter";
/// Parameter read by atomic filters as the inclusive upper date bound.
pub const ON_OR_BEFORE: &str = "onOrBefore";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParameterValue {
    /// Calendar date.
    Date(NaiveDate),
    /// Numeric value.
    Number(f64),
    /// Free text, including literal mapping values.
    Text(String),
    /// Concept code, resolved through the dictionary when used.
    Concept(String),
}

impl ParameterValue {
    /// The type of this value.
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::Date(_) => ParameterType::Date,
            ParameterValue::Number(_) => ParameterType::Number,
            ParameterValue::Text(_) => ParameterType::Text,
            ParameterValue::Concept(_) => ParameterType::Concept,
        }
    }

    /// Interprets the value as a date.
    ///
    /// Text values in `YYYY-MM-DD` form are accepted, since literal mapping
    /// values always bind as text.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParameterValue::Date(date) => Some(*date),
            ParameterValue::Text(text) => NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).ok(),
            _ => None,
        }
    }

    /// Interprets the value as a number. Numeric text is accepted.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(n) => Some(*n),
            ParameterValue::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the text or concept code, if the value is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(text) | ParameterValue::Concept(text) => Some(text),
            _ => None,
        }
    }

    fn write_canonical(&self, out: &mut String) {
        use std::fmt::Write;
        // Writing to a String cannot fail.
        let _ = match self {
            ParameterValue::Date(date) => write!(out, "d:{}", date.format(DATE_FORMAT)),
            ParameterValue::Number(n) => write!(out, "n:{}", n),
            ParameterValue::Text(text) => write!(out, "t:{:?}", text),
            ParameterValue::Concept(code) => write!(out, "c:{:?}", code),
        };
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Date(date) => write!(f, "{}", date.format(DATE_FORMAT)),
            ParameterValue::Number(n) => write!(f, "{}", n),
            ParameterValue::Text(text) => write!(f, "{}", text),
            ParameterValue::Concept(code) => write!(f, "concept {}", code),
        }
    }
}

impl From<NaiveDate> for ParameterValue {
    fn from(date: NaiveDate) -> Self {
        ParameterValue::Date(date)
    }
}

impl From<f64> for ParameterValue {
    fn from(n: f64) -> Self {
        ParameterValue::Number(n)
    }
}

impl From<i64> for ParameterValue {
    fn from(n: i64) -> Self {
        ParameterValue::Number(n as f64)
    }
}

impl From<&str> for ParameterValue {
    fn from(text: &str) -> Self {
        ParameterValue::Text(text.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(text: String) -> Self {
        ParameterValue::Text(text)
    }
}

/// Declared type of a composition parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParameterType {
    /// Calendar date.
    Date,
    /// Numeric value.
    Number,
    /// Free text.
    Text,
    /// Concept code.
    Concept,
}

impl ParameterType {
    /// Returns true if `value` can be used where this type is declared.
    pub fn accepts(self, value: &ParameterValue) -> bool {
        match self {
            ParameterType::Date => value.as_date().is_some(),
            ParameterType::Number => value.as_number().is_some(),
            ParameterType::Text => matches!(value, ParameterValue::Text(_)),
            ParameterType::Concept => value.as_str().is_some(),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::Date => "date",
            ParameterType::Number => "number",
            ParameterType::Text => "text",
            ParameterType::Concept => "concept",
        };
        f.write_str(name)
    }
}

/// Immutable-per-call map of parameter name to value.
///
/// Backed by a `BTreeMap` so iteration and [`canonical`](Self::canonical)
/// output are ordered by name.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use cohort_engine::ParameterMap;
///
/// let params = ParameterMap::new()
///     .with("startDate", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
///     .with("endDate", NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
///
/// assert_eq!(params.len(), 2);
/// assert_eq!(params.canonical(), "endDate=d:2024-01-31;startDate=d:2024-01-01");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParameterMap {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterMap {
    /// Creates an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, returning the map (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Looks up a value by name.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    /// Returns true if a value is bound under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Reads an optional date parameter.
    ///
    /// Absent parameters yield `Ok(None)`; present values that are not dates
    /// fail with [`EngineError::InvalidParameterValue`].
    pub fn date(&self, name: &str) -> EngineResult<Option<NaiveDate>> {
        match self.values.get(name) {
            None => Ok(None),
            Some(value) => value.as_date().map(Some).ok_or_else(|| {
                EngineError::InvalidParameterValue {
                    parameter: name.to_string(),
                    expected: ParameterType::Date,
                    found: value.to_string(),
                }
            }),
        }
    }

    /// Reads the `onOrAfter` / `onOrBefore` date range.
    pub fn date_range(&self) -> EngineResult<DateRange> {
        Ok(DateRange {
            on_or_after: self.date(ON_OR_AFTER)?,
            on_or_before: self.date(ON_OR_BEFORE)?,
        })
    }

    /// Deterministic textual form, used as part of cache keys.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(name);
            out.push('=');
            value.write_canonical(&mut out);
        }
        out
    }
}

impl<K: Into<String>, V: Into<ParameterValue>> FromIterator<(K, V)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ParameterMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// Inclusive date range; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DateRange {
    /// Inclusive lower bound.
    pub on_or_after: Option<NaiveDate>,
    /// Inclusive upper bound.
    pub on_or_before: Option<NaiveDate>,
}

impl DateRange {
    /// A range with no bounds.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A closed range.
    pub fn between(on_or_after: NaiveDate, on_or_before: NaiveDate) -> Self {
        Self {
            on_or_after: Some(on_or_after),
            on_or_before: Some(on_or_before),
        }
    }

    /// Returns true if `date` falls inside the range.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.on_or_after.map_or(true, |from| date >= from)
            && self.on_or_before.map_or(true, |to| date <= to)
    }

    /// Returns true if neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.on_or_after.is_none() && self.on_or_before.is_none()
    }
}
