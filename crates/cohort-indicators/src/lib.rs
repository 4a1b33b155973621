//! # cohort-indicators
//!
//! Indicators and dimensions on top of `cohort-engine`.
//!
//! An [`Indicator`] counts the subjects of a mapped cohort definition. A
//! [`Dimension`] is a named set of option cohorts (gender, age group, ...)
//! used to break an indicator down. The [`IndicatorService`] evaluates
//! counts, disaggregations and whole batches, sharing sub-query results
//! between the compositions of one call.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cohort_engine::{EncounterFilter, Mapped};
//! use cohort_indicators::{Dimension, Indicator, IndicatorService};
//!
//! let period = "onOrAfter=${startDate},onOrBefore=${endDate}";
//! let anc = Indicator::new(
//!     "Patients who have ANC visits",
//!     Mapped::new(EncounterFilter::new(["ANC"]), period)?,
//! );
//! let gender = Dimension::new("gender")
//!     .with_option("M", Mapped::unmapped(males))
//!     .with_option("F", Mapped::unmapped(females));
//!
//! let service = IndicatorService::new(&store, &dictionary);
//! let by_gender = service.disaggregate(&anc, &gender, &params)?;
//! ```

#![warn(missing_docs)]

pub mod dimension;
pub mod error;
pub mod indicator;
pub mod service;

// Re-export commonly used types
pub use dimension::Dimension;
pub use error::{IndicatorError, IndicatorResult};
pub use indicator::Indicator;
pub use service::{
    BatchReport, DimensionCell, Disaggregation, IndicatorService, IndicatorServiceConfig,
    IndicatorStats, IndicatorValue,
};
