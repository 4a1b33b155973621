//! Dimensions: named partitions used to disaggregate indicators.

use cohort_engine::{Mapped, ParameterType};

/// Operand name a dimension option is bound to in generated compositions.
pub(crate) const OPTION: &str = "option";

/// A named set of mapped option cohorts, such as gender or age group.
///
/// Options keep their insertion order, which is also the order of cells in a
/// [`Disaggregation`](crate::Disaggregation). Options need not be disjoint.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{CalculationFilter, Mapped};
/// use cohort_indicators::Dimension;
///
/// let gender = Dimension::new("gender")
///     .with_option("M", Mapped::unmapped(CalculationFilter::new("males")))
///     .with_option("F", Mapped::unmapped(CalculationFilter::new("females")));
///
/// assert_eq!(gender.option_keys().collect::<Vec<_>>(), vec!["M", "F"]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    options: Vec<(String, Mapped)>,
    parameters: Vec<(String, ParameterType)>,
}

impl Dimension {
    /// Creates a dimension with no options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Adds an option, replacing any existing option with the same key in
    /// place.
    pub fn with_option(mut self, key: impl Into<String>, cohort: Mapped) -> Self {
        let key = key.into();
        match self.options.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = cohort,
            None => self.options.push((key, cohort)),
        }
        self
    }

    /// Declares a parameter callers must supply.
    pub fn with_parameter(mut self, name: impl Into<String>, kind: ParameterType) -> Self {
        let name = name.into();
        self.parameters.retain(|(existing, _)| *existing != name);
        self.parameters.push((name, kind));
        self
    }

    /// Dimension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options in insertion order.
    pub fn options(&self) -> &[(String, Mapped)] {
        &self.options
    }

    /// Option keys in insertion order.
    pub fn option_keys(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|(key, _)| key.as_str())
    }

    /// Looks up an option by key.
    pub fn option(&self, key: &str) -> Option<&Mapped> {
        self.options
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, cohort)| cohort)
    }

    /// Declared parameters.
    pub fn parameters(&self) -> &[(String, ParameterType)] {
        &self.parameters
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Returns true if the dimension has no options.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_engine::CalculationFilter;

    fn calc(name: &str) -> Mapped {
        Mapped::unmapped(CalculationFilter::new(name))
    }

    #[test]
    fn test_option_replacement_keeps_order() {
        let dimension = Dimension::new("age")
            .with_option("<15", calc("children"))
            .with_option("15+", calc("adults"))
            .with_option("<15", calc("minors"));

        assert_eq!(dimension.len(), 2);
        assert_eq!(dimension.option_keys().collect::<Vec<_>>(), vec!["<15", "15+"]);
        assert_eq!(dimension.option("<15"), Some(&calc("minors")));
        assert!(dimension.option("unknown").is_none());
    }

    #[test]
    fn test_parameters() {
        let dimension = Dimension::new("age")
            .with_parameter("effectiveDate", ParameterType::Date)
            .with_parameter("effectiveDate", ParameterType::Text);
        assert_eq!(
            dimension.parameters(),
            &[("effectiveDate".to_string(), ParameterType::Text)]
        );
        assert!(dimension.is_empty());
    }
}
