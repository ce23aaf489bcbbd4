//! Enumerations describing models and their joins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sql::JoinType;

/// Cardinality of a join between two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Relationship {
    /// The relationship seen from the other side of the join.
    pub fn reverse(self) -> Self {
        match self {
            Relationship::OneToMany => Relationship::ManyToOne,
            Relationship::ManyToOne => Relationship::OneToMany,
            other => other,
        }
    }

    /// Following the edge can multiply rows of the model it starts from.
    pub fn causes_fanout(self) -> bool {
        matches!(self, Relationship::OneToMany | Relationship::ManyToMany)
    }
}

/// In which direction a join edge may be traversed.
///
/// `outgoing` only from the model declaring the join, `incoming` only from the referenced
/// model, `both` from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinDirection {
    Both,
    Outgoing,
    Incoming,
}

/// SQL join type declared on a model join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelJoinType {
    Left,
    Inner,
    Right,
}

impl ModelJoinType {
    pub fn reverse(self) -> Self {
        match self {
            ModelJoinType::Left => ModelJoinType::Right,
            ModelJoinType::Right => ModelJoinType::Left,
            ModelJoinType::Inner => ModelJoinType::Inner,
        }
    }
}

impl From<ModelJoinType> for JoinType {
    fn from(join_type: ModelJoinType) -> Self {
        match join_type {
            ModelJoinType::Left => JoinType::Left,
            ModelJoinType::Inner => JoinType::Inner,
            ModelJoinType::Right => JoinType::Right,
        }
    }
}

/// Granularity of the time dimension of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeGranularity {
    Hour,
    Day,
}

impl TimeGranularity {
    /// Finer granularities rank lower; models without time data rank last.
    pub fn rank(granularity: Option<TimeGranularity>) -> u8 {
        match granularity {
            Some(TimeGranularity::Hour) => 0,
            Some(TimeGranularity::Day) => 1,
            None => 2,
        }
    }
}

/// Who may query a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVisibility {
    #[default]
    Hidden,
    Available,
    Experimental,
}

impl ModelVisibility {
    /// Whether a request scoped to `self` may see a model with `model` visibility.
    ///
    /// Hidden scopes see nothing; experimental scopes also see available models.
    pub fn can_see(self, model: ModelVisibility) -> bool {
        match self {
            ModelVisibility::Available => model == ModelVisibility::Available,
            ModelVisibility::Experimental => {
                matches!(model, ModelVisibility::Available | ModelVisibility::Experimental)
            }
            ModelVisibility::Hidden => false,
        }
    }
}

impl fmt::Display for ModelVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelVisibility::Hidden => "hidden",
            ModelVisibility::Available => "available",
            ModelVisibility::Experimental => "experimental",
        })
    }
}

/// Whether an attribute holds a single value or an unordered array of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueQuantityType {
    #[default]
    Scalar,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Entity,
    Metric,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversals() {
        assert_eq!(Relationship::ManyToOne.reverse(), Relationship::OneToMany);
        assert_eq!(Relationship::OneToOne.reverse(), Relationship::OneToOne);
        assert_eq!(ModelJoinType::Left.reverse(), ModelJoinType::Right);
        assert_eq!(ModelJoinType::Inner.reverse(), ModelJoinType::Inner);
    }

    #[test]
    fn test_visibility() {
        assert!(ModelVisibility::Available.can_see(ModelVisibility::Available));
        assert!(!ModelVisibility::Available.can_see(ModelVisibility::Experimental));
        assert!(ModelVisibility::Experimental.can_see(ModelVisibility::Available));
        assert!(!ModelVisibility::Hidden.can_see(ModelVisibility::Hidden));
    }

    #[test]
    fn test_granularity_rank() {
        assert!(TimeGranularity::rank(Some(TimeGranularity::Hour)) < TimeGranularity::rank(None));
    }
}
