//! Pipeline phases a TEL formula can be evaluated in.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered pipeline stage of a formula. A composite formula lives in the latest phase of
/// its parts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TelPhase {
    /// Formula can be computed anywhere (constants).
    #[default]
    Any,
    DimensionDataSource,
    Dimension,
    MetricPre,
    MetricPost,
    /// Topmost projection of the final query.
    BlendingProjection,
}

impl TelPhase {
    pub fn is_metric(self) -> bool {
        matches!(self, TelPhase::MetricPre | TelPhase::MetricPost)
    }

    pub fn is_dimension(self) -> bool {
        matches!(self, TelPhase::Dimension | TelPhase::DimensionDataSource)
    }

    /// Latest phase of `phases`, or [`TelPhase::Any`] when empty.
    pub fn max_of(phases: impl IntoIterator<Item = TelPhase>) -> TelPhase {
        phases.into_iter().max().unwrap_or(TelPhase::Any)
    }

    pub fn name(self) -> &'static str {
        match self {
            TelPhase::Any => "any",
            TelPhase::DimensionDataSource => "dimension_data_source",
            TelPhase::Dimension => "dimension",
            TelPhase::MetricPre => "metric_pre",
            TelPhase::MetricPost => "metric_post",
            TelPhase::BlendingProjection => "blending_projection",
        }
    }
}

impl fmt::Display for TelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive range of accepted phases for a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelPhaseRange {
    pub min: TelPhase,
    pub max: TelPhase,
}

impl TelPhaseRange {
    pub const ANY: TelPhaseRange = TelPhaseRange {
        min: TelPhase::Any,
        max: TelPhase::BlendingProjection,
    };

    pub const fn at_most(max: TelPhase) -> Self {
        Self {
            min: TelPhase::Any,
            max,
        }
    }

    pub const fn at_least(min: TelPhase) -> Self {
        Self {
            min,
            max: TelPhase::BlendingProjection,
        }
    }

    pub fn contains(&self, phase: TelPhase) -> bool {
        self.min <= phase && phase <= self.max
    }
}

impl Default for TelPhaseRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl fmt::Display for TelPhaseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == TelPhase::Any {
            write!(f, "lower or equal than {}", self.max)
        } else if self.max == TelPhase::BlendingProjection {
            write!(f, "greater or equal than {}", self.min)
        } else {
            write!(f, "between {} and {}", self.min, self.max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(TelPhase::Any < TelPhase::DimensionDataSource);
        assert!(TelPhase::Dimension < TelPhase::MetricPre);
        assert_eq!(
            TelPhase::max_of([TelPhase::Dimension, TelPhase::MetricPost, TelPhase::Any]),
            TelPhase::MetricPost
        );
        assert_eq!(TelPhase::max_of([]), TelPhase::Any);
    }

    #[test]
    fn test_phase_range_display() {
        assert_eq!(
            TelPhaseRange::at_most(TelPhase::Dimension).to_string(),
            "lower or equal than dimension"
        );
        assert_eq!(
            TelPhaseRange::at_least(TelPhase::MetricPre).to_string(),
            "greater or equal than metric_pre"
        );
        let between = TelPhaseRange {
            min: TelPhase::Dimension,
            max: TelPhase::MetricPost,
        };
        assert_eq!(between.to_string(), "between dimension and metric_post");
        assert!(between.contains(TelPhase::MetricPre));
        assert!(!between.contains(TelPhase::Any));
    }
}
