//! Types for the indicator service.

use cohort_engine::{Cohort, EvaluationStats};

/// Value of one indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorValue {
    /// Indicator name.
    pub name: String,
    /// Subjects counted by the indicator.
    pub cohort: Cohort,
    /// Time taken to evaluate in milliseconds.
    pub evaluation_time_ms: f64,
}

impl IndicatorValue {
    /// Returns the indicator count.
    pub fn count(&self) -> usize {
        self.cohort.count()
    }

    /// Returns true if no subject is counted.
    pub fn is_empty(&self) -> bool {
        self.cohort.is_empty()
    }
}

/// Count of one dimension option within an indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionCell {
    /// Option key.
    pub option: String,
    /// Subjects in both the indicator and the option.
    pub count: usize,
}

/// An indicator broken down by the options of a dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Disaggregation {
    /// Indicator name.
    pub indicator: String,
    /// Dimension name.
    pub dimension: String,
    /// Indicator count before disaggregation.
    pub total: usize,
    /// One cell per option, in option order.
    pub cells: Vec<DimensionCell>,
    /// Subjects of the indicator that fall in no option.
    pub unclassified: usize,
    /// Time taken to evaluate in milliseconds.
    pub evaluation_time_ms: f64,
}

impl Disaggregation {
    /// Returns the count for `option`.
    pub fn get(&self, option: &str) -> Option<usize> {
        self.cells
            .iter()
            .find(|cell| cell.option == option)
            .map(|cell| cell.count)
    }

    /// Sum of all cells. Exceeds `total - unclassified` when options overlap.
    pub fn cells_total(&self) -> usize {
        self.cells.iter().map(|cell| cell.count).sum()
    }
}

/// Values of a batch of indicators evaluated together.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// One value per indicator, in request order.
    pub values: Vec<IndicatorValue>,
    /// Sub-queries computed from the data store.
    pub subqueries_computed: usize,
    /// Sub-query references answered by an earlier computation.
    pub subqueries_reused: usize,
    /// Time taken for the whole batch in milliseconds.
    pub evaluation_time_ms: f64,
}

impl BatchReport {
    /// Returns the value of the indicator called `name`.
    pub fn get(&self, name: &str) -> Option<&IndicatorValue> {
        self.values.iter().find(|value| value.name == name)
    }

    /// Number of indicators in the batch.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the batch was empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Statistics about indicator service usage.
#[derive(Debug, Clone, Default)]
pub struct IndicatorStats {
    /// Number of compositions evaluated.
    pub evaluations: usize,
    /// Number of disaggregations run.
    pub disaggregations: usize,
    /// Number of batches run.
    pub batches: usize,
    /// Sub-queries computed from the data store.
    pub subqueries_computed: usize,
    /// Sub-query references answered by an earlier computation.
    pub subqueries_reused: usize,
    /// Total time spent evaluating in milliseconds.
    pub total_evaluation_time_ms: f64,
}

impl IndicatorStats {
    pub(crate) fn record(&mut self, stats: &EvaluationStats) {
        self.evaluations += 1;
        self.subqueries_computed += stats.computations;
        self.subqueries_reused += stats.cache_hits + stats.waits;
    }

    /// Returns the share of sub-query references answered without a data
    /// store call, as a percentage.
    pub fn reuse_rate(&self) -> f64 {
        let total = self.subqueries_computed + self.subqueries_reused;
        if total == 0 {
            0.0
        } else {
            (self.subqueries_reused as f64 / total as f64) * 100.0
        }
    }

    /// Returns the average evaluation time in milliseconds.
    pub fn avg_evaluation_time_ms(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.total_evaluation_time_ms / self.evaluations as f64
        }
    }
}

impl std::fmt::Display for IndicatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Indicator Service Statistics:")?;
        writeln!(f, "  Evaluations:     {}", self.evaluations)?;
        writeln!(f, "  Disaggregations: {}", self.disaggregations)?;
        writeln!(f, "  Batches:         {}", self.batches)?;
        writeln!(f, "  Computed:        {}", self.subqueries_computed)?;
        writeln!(f, "  Reused:          {}", self.subqueries_reused)?;
        writeln!(f, "  Reuse rate:      {:.1}%", self.reuse_rate())?;
        writeln!(f, "  Total time:      {:.1}ms", self.total_evaluation_time_ms)?;
        writeln!(f, "  Avg time:        {:.2}ms", self.avg_evaluation_time_ms())?;
        Ok(())
    }
}
