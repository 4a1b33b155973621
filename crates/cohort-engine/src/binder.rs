//! Parameter mapping expressions.
//!
//! A mapping such as `onOrAfter=${startDate},onOrBefore=${endDate-1d}` tells
//! the binder how to derive a sub-query's parameters from its caller's.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, Months, NaiveDate};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, one_of, satisfy},
    combinator::{all_consuming, map, map_res, opt, recognize},
    sequence::{delimited, pair, tuple},
    IResult,
};

use crate::error::{EngineError, EngineResult};
use crate::params::{ParameterMap, ParameterValue};

/// Unit of a date offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetUnit {
    /// `d`
    Days,
    /// `w`
    Weeks,
    /// `m`; results are clamped to the end of the target month.
    Months,
    /// `y`
    Years,
}

impl OffsetUnit {
    fn symbol(self) -> char {
        match self {
            OffsetUnit::Days => 'd',
            OffsetUnit::Weeks => 'w',
            OffsetUnit::Months => 'm',
            OffsetUnit::Years => 'y',
        }
    }
}

/// Signed date offset attached to a `${source}` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateOffset {
    /// Signed amount.
    pub amount: i64,
    /// Unit of `amount`.
    pub unit: OffsetUnit,
}

impl DateOffset {
    /// Shifts `date` by the offset. Returns `None` on calendar overflow.
    pub fn apply(&self, date: NaiveDate) -> Option<NaiveDate> {
        let magnitude = self.amount.unsigned_abs();
        let forward = self.amount >= 0;
        match self.unit {
            OffsetUnit::Days => shift_days(date, magnitude, forward),
            OffsetUnit::Weeks => shift_days(date, magnitude.checked_mul(7)?, forward),
            OffsetUnit::Months => shift_months(date, magnitude, forward),
            OffsetUnit::Years => shift_months(date, magnitude.checked_mul(12)?, forward),
        }
    }
}

fn shift_days(date: NaiveDate, days: u64, forward: bool) -> Option<NaiveDate> {
    if forward {
        date.checked_add_days(Days::new(days))
    } else {
        date.checked_sub_days(Days::new(days))
    }
}

fn shift_months(date: NaiveDate, months: u64, forward: bool) -> Option<NaiveDate> {
    let months = Months::new(u32::try_from(months).ok()?);
    if forward {
        date.checked_add_months(months)
    } else {
        date.checked_sub_months(months)
    }
}

impl fmt::Display for DateOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}{}", self.amount, self.unit.symbol())
    }
}

/// Right-hand side of a mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MappingSource {
    /// `${name}` or `${name+offset}`: copy from the caller's parameters.
    Parameter {
        /// Caller parameter name.
        name: String,
        /// Optional date shift.
        offset: Option<DateOffset>,
    },
    /// Anything else, passed through verbatim as text.
    Literal(String),
}

impl fmt::Display for MappingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingSource::Parameter { name, offset: None } => write!(f, "${{{}}}", name),
            MappingSource::Parameter {
                name,
                offset: Some(offset),
            } => write!(f, "${{{}{}}}", name, offset),
            MappingSource::Literal(text) => f.write_str(text),
        }
    }
}

/// One `target=source` assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingEntry {
    /// Parameter name seen by the sub-query.
    pub target: String,
    /// Where its value comes from.
    pub source: MappingSource,
}

/// A parsed parameter-mapping expression.
///
/// # Example
///
/// ```rust
/// use chrono::NaiveDate;
/// use cohort_engine::{ParameterMap, ParameterMapping, ParameterValue};
///
/// let mapping = ParameterMapping::parse("onOrAfter=${endDate-12m},onOrBefore=${endDate}").unwrap();
/// let caller = ParameterMap::new().with("endDate", NaiveDate::from_ymd_opt(2024, 3, 31).unwrap());
///
/// let bound = mapping.bind(&caller).unwrap();
/// assert_eq!(
///     bound.get("onOrAfter"),
///     Some(&ParameterValue::Date(NaiveDate::from_ymd_opt(2023, 3, 31).unwrap()))
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParameterMapping {
    entries: Vec<MappingEntry>,
}

impl ParameterMapping {
    /// The mapping that binds nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list of `target=source` assignments.
    ///
    /// An empty (or all-whitespace) string is the empty mapping.
    pub fn parse(text: &str) -> EngineResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::empty());
        }

        let mut entries: Vec<MappingEntry> = Vec::new();
        for raw in text.split(',') {
            let entry = parse_entry(raw.trim())
                .map_err(|message| EngineError::invalid_mapping(text, message))?;
            if entries.iter().any(|e| e.target == entry.target) {
                return Err(EngineError::invalid_mapping(
                    text,
                    format!("target '{}' assigned twice", entry.target),
                ));
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Builds a mapping that forwards each named parameter unchanged.
    pub fn forward<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = names
            .into_iter()
            .map(|name| MappingEntry {
                target: name.to_string(),
                source: MappingSource::Parameter {
                    name: name.to_string(),
                    offset: None,
                },
            })
            .collect();
        Self { entries }
    }

    /// The parsed assignments, in source order.
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Returns true if the mapping binds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of caller parameters this mapping reads.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match &e.source {
            MappingSource::Parameter { name, .. } => Some(name.as_str()),
            MappingSource::Literal(_) => None,
        })
    }

    /// Computes the sub-query's parameters from the caller's.
    ///
    /// Never mutates `caller`. Fails with [`EngineError::UnboundParameter`]
    /// when a referenced source is absent.
    pub fn bind(&self, caller: &ParameterMap) -> EngineResult<ParameterMap> {
        let mut bound = ParameterMap::new();
        for entry in &self.entries {
            let value = match &entry.source {
                MappingSource::Literal(text) => ParameterValue::Text(text.clone()),
                MappingSource::Parameter { name, offset } => {
                    let value = caller
                        .get(name)
                        .ok_or_else(|| EngineError::unbound(name.as_str()))?;
                    match offset {
                        None => value.clone(),
                        Some(offset) => self.shift(entry, name, value, offset)?,
                    }
                }
            };
            bound.insert(entry.target.as_str(), value);
        }
        Ok(bound)
    }

    fn shift(
        &self,
        entry: &MappingEntry,
        name: &str,
        value: &ParameterValue,
        offset: &DateOffset,
    ) -> EngineResult<ParameterValue> {
        let mapping = || format!("{}={}", entry.target, entry.source);
        let date = value.as_date().ok_or_else(|| {
            EngineError::invalid_mapping(
                mapping(),
                format!("offset {} applied to non-date '{}' ({})", offset, name, value),
            )
        })?;
        offset.apply(date).map(ParameterValue::Date).ok_or_else(|| {
            EngineError::invalid_mapping(mapping(), format!("offset {} overflows {}", offset, date))
        })
    }
}

impl FromStr for ParameterMapping {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ParameterMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", entry.target, entry.source)?;
        }
        Ok(())
    }
}

/// Binds `caller` through a mapping given as text.
pub fn bind(caller: &ParameterMap, mapping: &str) -> EngineResult<ParameterMap> {
    ParameterMapping::parse(mapping)?.bind(caller)
}

fn parse_entry(raw: &str) -> Result<MappingEntry, String> {
    if raw.is_empty() {
        return Err("empty assignment".to_string());
    }
    let (target, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("'{}' is missing '='", raw))?;
    let target = target.trim();
    let value = value.trim();

    if target.is_empty() {
        return Err(format!("'{}' has an empty target", raw));
    }
    if all_consuming(identifier)(target).is_err() {
        return Err(format!("'{}' is not a valid parameter name", target));
    }

    let source = if value.starts_with("${") {
        if !value.ends_with('}') {
            return Err(format!("unterminated reference in '{}'", raw));
        }
        match all_consuming(reference)(value) {
            Ok((_, source)) => source,
            Err(_) => return Err(format!("malformed reference '{}'", value)),
        }
    } else if value.contains("${") {
        return Err(format!("reference must span the whole value in '{}'", raw));
    } else {
        MappingSource::Literal(value.to_string())
    };

    Ok(MappingEntry {
        target: target.to_string(),
        source,
    })
}

// ============================================================================
// Reference grammar: ${name} | ${name(+|-)N(d|w|m|y)}
// ============================================================================

fn reference(input: &str) -> IResult<&str, MappingSource> {
    map(
        delimited(tag("${"), pair(identifier, opt(offset)), char('}')),
        |(name, offset)| MappingSource::Parameter {
            name: name.to_string(),
            offset,
        },
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn offset(input: &str) -> IResult<&str, DateOffset> {
    map(
        tuple((one_of("+-"), amount, unit)),
        |(sign, amount, unit)| DateOffset {
            amount: if sign == '-' { -amount } else { amount },
            unit,
        },
    )(input)
}

fn amount(input: &str) -> IResult<&str, i64> {
    map_res(digit1, str::parse::<i64>)(input)
}

fn unit(input: &str) -> IResult<&str, OffsetUnit> {
    alt((
        map(char('d'), |_| OffsetUnit::Days),
        map(char('w'), |_| OffsetUnit::Weeks),
        map(char('m'), |_| OffsetUnit::Months),
        map(char('y'), |_| OffsetUnit::Years),
    ))(input)
}
