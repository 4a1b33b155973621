//! Indicator definitions.

use cohort_engine::{Composition, Expr, Mapped, ParameterType, Searches};

/// Operand name an indicator's cohort is bound to in generated compositions.
pub(crate) const COHORT: &str = "cohort";

/// A named count over a mapped cohort definition.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{EncounterFilter, Mapped};
/// use cohort_indicators::Indicator;
///
/// let anc = Mapped::new(
///     EncounterFilter::new(["ANC"]),
///     "onOrAfter=${startDate},onOrBefore=${endDate}",
/// )
/// .unwrap();
/// let indicator = Indicator::new("ANC visits", anc);
/// assert_eq!(indicator.name(), "ANC visits");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    name: String,
    description: Option<String>,
    cohort: Mapped,
    parameters: Vec<(String, ParameterType)>,
}

impl Indicator {
    /// Creates an indicator counting the subjects of `cohort`.
    pub fn new(name: impl Into<String>, cohort: Mapped) -> Self {
        Self {
            name: name.into(),
            description: None,
            cohort,
            parameters: Vec::new(),
        }
    }

    /// Sets a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares a parameter callers must supply.
    pub fn with_parameter(mut self, name: impl Into<String>, kind: ParameterType) -> Self {
        let name = name.into();
        self.parameters.retain(|(existing, _)| *existing != name);
        self.parameters.push((name, kind));
        self
    }

    /// Indicator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The mapped cohort being counted.
    pub fn cohort(&self) -> &Mapped {
        &self.cohort
    }

    /// Declared parameters.
    pub fn parameters(&self) -> &[(String, ParameterType)] {
        &self.parameters
    }

    /// Single-operand composition selecting the indicator's cohort.
    pub(crate) fn composition(&self) -> Composition {
        self.restricted_to(Expr::operand(COHORT), Searches::new())
            .with_name(self.name.as_str())
    }

    /// Composition of `expr` over the indicator's cohort and `searches`,
    /// declaring the indicator's parameters.
    pub(crate) fn restricted_to(&self, expr: Expr, searches: Searches) -> Composition {
        let searches = searches.with(COHORT, self.cohort.clone());
        self.parameters.iter().fold(
            Composition::from_expr(expr, searches),
            |composition, (name, kind)| composition.with_parameter(name.as_str(), *kind),
        )
    }
}
