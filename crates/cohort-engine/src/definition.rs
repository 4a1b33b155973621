//! Cohort definitions: the sub-queries a composition combines.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use cohort_expr::Expr;

use crate::binder::ParameterMapping;
use crate::cache::CacheKey;
use crate::error::{EngineError, EngineResult};
use crate::params::{ParameterMap, ParameterType};

/// Identifier of a subject (patient).
pub type SubjectId = u64;

/// A concept code resolved by the [`Dictionary`](crate::Dictionary).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConceptRef {
    /// Store-internal identifier.
    pub id: u64,
    /// Code the concept was looked up by.
    pub code: String,
}

impl ConceptRef {
    /// Creates a concept reference.
    pub fn new(id: u64, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
        }
    }
}

/// Comparison applied to a numeric observation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RangeComparator {
    /// `<`
    LessThan,
    /// `<=`
    LessEqual,
    /// `=`
    Equal,
    /// `>=`
    GreaterEqual,
    /// `>`
    GreaterThan,
}

impl RangeComparator {
    /// Returns true if `observed <op> bound` holds.
    pub fn test(self, observed: f64, bound: f64) -> bool {
        match self {
            RangeComparator::LessThan => observed < bound,
            RangeComparator::LessEqual => observed <= bound,
            RangeComparator::Equal => observed == bound,
            RangeComparator::GreaterEqual => observed >= bound,
            RangeComparator::GreaterThan => observed > bound,
        }
    }

    /// Operator symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            RangeComparator::LessThan => "<",
            RangeComparator::LessEqual => "<=",
            RangeComparator::Equal => "=",
            RangeComparator::GreaterEqual => ">=",
            RangeComparator::GreaterThan => ">",
        }
    }
}

/// One side of a numeric range.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NumericBound {
    /// Operator.
    pub comparator: RangeComparator,
    /// Right-hand value.
    pub value: f64,
}

impl NumericBound {
    /// Returns true if `observed` satisfies the bound.
    pub fn matches(&self, observed: f64) -> bool {
        self.comparator.test(observed, self.value)
    }
}

impl fmt::Display for NumericBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparator.symbol(), self.value)
    }
}

/// Constraint on the value of an observation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueConstraint {
    /// Coded answer must be one of these concept codes.
    Coded(Vec<String>),
    /// Numeric value must satisfy every bound.
    Numeric(Vec<NumericBound>),
    /// Text value must equal this string.
    Text(String),
}

/// Subjects with at least one observation of a question concept in the
/// evaluation date range.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservationFilter {
    /// Question concept code.
    pub question: String,
    /// Optional value constraint.
    pub value: Option<ValueConstraint>,
    /// Restrict to observations recorded in these encounter types (empty = any).
    pub encounter_types: Vec<String>,
    /// Drop coded answers the dictionary does not know instead of failing.
    pub tolerate_missing_answers: bool,
}

impl ObservationFilter {
    /// Any observation of `question`.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            value: None,
            encounter_types: Vec::new(),
            tolerate_missing_answers: false,
        }
    }

    /// Requires a coded answer from `answers`.
    pub fn with_answers<I, S>(mut self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.value = Some(ValueConstraint::Coded(
            answers.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Adds a numeric bound; repeated calls build a range.
    pub fn with_numeric(mut self, comparator: RangeComparator, value: f64) -> Self {
        let bound = NumericBound { comparator, value };
        let bounds = match self.value.take() {
            Some(ValueConstraint::Numeric(mut bounds)) => {
                bounds.push(bound);
                bounds
            }
            _ => vec![bound],
        };
        self.value = Some(ValueConstraint::Numeric(bounds));
        self
    }

    /// Requires a text value.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.value = Some(ValueConstraint::Text(text.into()));
        self
    }

    /// Restricts the encounter types observations may come from.
    pub fn with_encounter_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.encounter_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Skips unknown answer codes rather than failing resolution.
    pub fn tolerate_missing_answers(mut self) -> Self {
        self.tolerate_missing_answers = true;
        self
    }
}

/// Subjects with an encounter of one of the given types in the date range.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncounterFilter {
    /// Accepted encounter types (empty = any encounter).
    pub encounter_types: Vec<String>,
}

impl EncounterFilter {
    /// Creates an encounter filter.
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            encounter_types: types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Subjects for which an externally registered calculation holds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalculationFilter {
    /// Registered calculation name.
    pub name: String,
    /// Fixed parameters, merged under the bound parameters at evaluation.
    pub parameters: ParameterMap,
}

impl CalculationFilter {
    /// Creates a calculation filter with no fixed parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: ParameterMap::new(),
        }
    }

    /// Adds a fixed calculation parameter.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<crate::params::ParameterValue>,
    ) -> Self {
        self.parameters.insert(name, value);
        self
    }
}

/// A sub-query definition.
#[derive(Debug, Clone, PartialEq)]
pub enum CohortDefinition {
    /// Observation presence/value filter.
    Observation(ObservationFilter),
    /// Encounter presence filter.
    Encounter(EncounterFilter),
    /// External per-subject calculation.
    Calculation(CalculationFilter),
    /// Nested boolean composition.
    Composite(Composition),
}

impl CohortDefinition {
    /// Short name of the variant, for logs and plans.
    pub fn kind(&self) -> &'static str {
        match self {
            CohortDefinition::Observation(_) => "observation",
            CohortDefinition::Encounter(_) => "encounter",
            CohortDefinition::Calculation(_) => "calculation",
            CohortDefinition::Composite(_) => "composite",
        }
    }

    /// Returns true for definitions that call the data store directly.
    pub fn is_atomic(&self) -> bool {
        !matches!(self, CohortDefinition::Composite(_))
    }

    /// Structural identity.
    ///
    /// Two definitions with equal fingerprints select the same subjects for
    /// the same bound parameters.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        self.write_fingerprint(&mut out);
        out
    }

    fn write_fingerprint(&self, out: &mut String) {
        // Writing to a String cannot fail.
        let _ = match self {
            CohortDefinition::Observation(filter) => {
                let _ = write!(out, "obs(q={:?}", filter.question);
                match &filter.value {
                    None => {}
                    Some(ValueConstraint::Coded(answers)) => {
                        let _ = write!(out, ";coded={:?}", answers);
                    }
                    Some(ValueConstraint::Numeric(bounds)) => {
                        out.push_str(";numeric=[");
                        for bound in bounds {
                            let _ = write!(out, "{},", bound);
                        }
                        out.push(']');
                    }
                    Some(ValueConstraint::Text(text)) => {
                        let _ = write!(out, ";text={:?}", text);
                    }
                }
                if !filter.encounter_types.is_empty() {
                    let _ = write!(out, ";enc={:?}", filter.encounter_types);
                }
                if filter.tolerate_missing_answers {
                    out.push_str(";lenient");
                }
                write!(out, ")")
            }
            CohortDefinition::Encounter(filter) => {
                write!(out, "enc({:?})", filter.encounter_types)
            }
            CohortDefinition::Calculation(filter) => {
                write!(out, "calc({:?};{})", filter.name, filter.parameters.canonical())
            }
            CohortDefinition::Composite(composition) => {
                let _ = write!(out, "comp({}", composition.expr());
                if let Some(universe) = composition.universe() {
                    let _ = write!(out, ";universe={}", universe);
                }
                for (name, mapped) in composition.searches().iter() {
                    let _ = write!(out, ";{}=[{}|{}]", name, mapped.fingerprint(), mapped.mapping());
                }
                write!(out, ")")
            }
        };
    }
}

impl From<ObservationFilter> for CohortDefinition {
    fn from(filter: ObservationFilter) -> Self {
        CohortDefinition::Observation(filter)
    }
}

impl From<EncounterFilter> for CohortDefinition {
    fn from(filter: EncounterFilter) -> Self {
        CohortDefinition::Encounter(filter)
    }
}

impl From<CalculationFilter> for CohortDefinition {
    fn from(filter: CalculationFilter) -> Self {
        CohortDefinition::Calculation(filter)
    }
}

impl From<Composition> for CohortDefinition {
    fn from(composition: Composition) -> Self {
        CohortDefinition::Composite(composition)
    }
}

macro_rules! impl_into_shared_definition {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arc<CohortDefinition> {
                fn from(value: $ty) -> Self {
                    Arc::new(CohortDefinition::from(value))
                }
            }
        )*
    };
}

impl_into_shared_definition!(ObservationFilter, EncounterFilter, CalculationFilter, Composition);

/// A definition together with the mapping that derives its parameters.
///
/// The fingerprint is computed once here, so shared bindings hash cheaply.
#[derive(Debug, Clone)]
pub struct Mapped {
    definition: Arc<CohortDefinition>,
    mapping: ParameterMapping,
    fingerprint: Arc<str>,
}

impl Mapped {
    /// Binds a definition through a mapping expression such as
    /// `onOrAfter=${startDate},onOrBefore=${endDate}`.
    pub fn new(
        definition: impl Into<Arc<CohortDefinition>>,
        mapping: &str,
    ) -> EngineResult<Self> {
        Ok(Self::with_mapping(
            definition,
            ParameterMapping::parse(mapping)?,
        ))
    }

    /// Binds a definition through an already parsed mapping.
    pub fn with_mapping(
        definition: impl Into<Arc<CohortDefinition>>,
        mapping: ParameterMapping,
    ) -> Self {
        let definition = definition.into();
        let fingerprint = definition.fingerprint().into();
        Self {
            definition,
            mapping,
            fingerprint,
        }
    }

    /// Binds a definition with the empty mapping.
    pub fn unmapped(definition: impl Into<Arc<CohortDefinition>>) -> Self {
        Self::with_mapping(definition, ParameterMapping::empty())
    }

    /// The bound definition.
    pub fn definition(&self) -> &Arc<CohortDefinition> {
        &self.definition
    }

    /// The parameter mapping.
    pub fn mapping(&self) -> &ParameterMapping {
        &self.mapping
    }

    /// Structural fingerprint of the definition.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Cache identity of this binding evaluated with `bound` parameters.
    pub fn cache_key(&self, bound: &ParameterMap) -> CacheKey {
        CacheKey::new(self.fingerprint.clone(), bound)
    }
}

impl PartialEq for Mapped {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.mapping == other.mapping
    }
}

/// Operand name to binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Searches {
    bindings: BTreeMap<String, Mapped>,
}

impl Searches {
    /// Creates an empty binding table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding, returning the table (builder style).
    pub fn with(mut self, name: impl Into<String>, mapped: Mapped) -> Self {
        self.insert(name, mapped);
        self
    }

    /// Adds or replaces a binding.
    pub fn insert(&mut self, name: impl Into<String>, mapped: Mapped) {
        self.bindings.insert(name.into(), mapped);
    }

    /// Looks up a binding.
    pub fn get(&self, name: &str) -> Option<&Mapped> {
        self.bindings.get(name)
    }

    /// Returns true if `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterates over bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Mapped)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A boolean composition over named sub-queries.
///
/// The expression is parsed at construction, so a `Composition` value is
/// always syntactically valid.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{Composition, EncounterFilter, Mapped, ParameterType};
///
/// let anc = EncounterFilter::new(["ANC_VISIT"]);
/// let composition = Composition::new("hasAppointment NOT hasVisit")
///     .unwrap()
///     .with_search("hasAppointment", Mapped::new(anc.clone(), "onOrBefore=${endDate}").unwrap())
///     .with_search("hasVisit", Mapped::new(anc, "onOrAfter=${startDate},onOrBefore=${endDate}").unwrap())
///     .with_parameter("startDate", ParameterType::Date)
///     .with_parameter("endDate", ParameterType::Date);
///
/// assert_eq!(composition.expr().to_string(), "hasAppointment AND NOT hasVisit");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    name: Option<String>,
    expression: String,
    expr: Expr,
    searches: Searches,
    parameters: Vec<(String, ParameterType)>,
    universe: Option<String>,
}

impl Composition {
    /// Parses a composition string with no bindings yet.
    pub fn new(expression: &str) -> EngineResult<Self> {
        let expr = cohort_expr::parse(expression)?;
        Ok(Self {
            name: None,
            expression: expression.to_string(),
            expr,
            searches: Searches::new(),
            parameters: Vec::new(),
            universe: None,
        })
    }

    /// Parses a composition string with a complete binding table.
    pub fn from_parts(expression: &str, searches: Searches) -> EngineResult<Self> {
        let mut composition = Self::new(expression)?;
        composition.searches = searches;
        Ok(composition)
    }

    /// Wraps an already built expression.
    pub fn from_expr(expr: Expr, searches: Searches) -> Self {
        Self {
            name: None,
            expression: expr.to_string(),
            expr,
            searches,
            parameters: Vec::new(),
            universe: None,
        }
    }

    /// Sets a display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Binds an operand.
    pub fn with_search(mut self, name: impl Into<String>, mapped: Mapped) -> Self {
        self.searches.insert(name, mapped);
        self
    }

    /// Declares a parameter callers must supply.
    pub fn with_parameter(mut self, name: impl Into<String>, kind: ParameterType) -> Self {
        let name = name.into();
        self.parameters.retain(|(existing, _)| *existing != name);
        self.parameters.push((name, kind));
        self
    }

    /// Names the operand whose set `NOT` complements against.
    pub fn with_universe(mut self, operand: impl Into<String>) -> Self {
        self.universe = Some(operand.into());
        self
    }

    /// Display name, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The parsed expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Operand bindings.
    pub fn searches(&self) -> &Searches {
        &self.searches
    }

    /// Declared parameters, in declaration order.
    pub fn parameters(&self) -> &[(String, ParameterType)] {
        &self.parameters
    }

    /// Universe operand, if declared.
    pub fn universe(&self) -> Option<&str> {
        self.universe.as_deref()
    }

    /// Label used in logs and plans.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.expression)
    }

    /// Checks the caller's map against the declared parameters and returns
    /// the declared ones with their bound values.
    pub fn check_parameters(&self, caller: &ParameterMap) -> EngineResult<ParameterMap> {
        let mut declared = ParameterMap::new();
        for (name, kind) in &self.parameters {
            let value = caller
                .get(name)
                .ok_or_else(|| EngineError::unbound(name.as_str()))?;
            if !kind.accepts(value) {
                return Err(EngineError::InvalidParameterValue {
                    parameter: name.clone(),
                    expected: *kind,
                    found: value.to_string(),
                });
            }
            declared.insert(name.as_str(), value.clone());
        }
        Ok(declared)
    }
}
