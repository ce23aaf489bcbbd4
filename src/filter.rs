//! Filter clauses of requests and scopes.
//!
//! A clause is rendered into one boolean [`Expr`] against a map of taxon slug to the SQL
//! that reads it. The same clause serves as a pre-aggregation scope filter (accessors
//! are model attributes) and as a post-aggregation filter (accessors are dataframe
//! columns).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{HuskyError, Result};
use crate::identifier::LIKE_ESCAPE_CHAR;
use crate::model::ValueQuantityType;
use crate::sql::{cast, func, lit_bool, lit_float, lit_int, lit_str, paren, CastType, Expr, ExprExt};

/// How one taxon is read by the query a filter is applied to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonSqlInfo {
    pub accessor: Expr,
    /// Model the taxon is read from, when it comes straight from a model.
    pub model_name: Option<String>,
    pub quantity_type: ValueQuantityType,
}

impl TaxonSqlInfo {
    pub fn new(accessor: Expr) -> Self {
        Self {
            accessor,
            model_name: None,
            quantity_type: ValueQuantityType::Scalar,
        }
    }

    pub fn is_array(&self) -> bool {
        self.quantity_type == ValueQuantityType::Array
    }
}

pub type TaxonSqlInfoMap = BTreeMap<String, TaxonSqlInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleFilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "NOT_LIKE")]
    NotLike,
    #[serde(rename = "ILIKE")]
    ILike,
    #[serde(rename = "NOT_ILIKE")]
    NotILike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayFilterOperator {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT_IN")]
    NotIn,
}

/// Literal a taxon is compared with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl FilterValue {
    fn to_expr(&self) -> Expr {
        match self {
            FilterValue::Bool(b) => lit_bool(*b),
            FilterValue::Int(i) => lit_int(*i),
            FilterValue::Float(f) => lit_float(*f),
            FilterValue::String(s) => lit_str(s),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::String(value.to_string())
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterClause {
    Group(GroupFilterClause),
    TaxonValue(TaxonValueFilterClause),
    TaxonTaxon(TaxonTaxonFilterClause),
    TaxonArray(TaxonArrayFilterClause),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupFilterClause {
    pub logical_operator: LogicalOperator,
    pub clauses: Vec<FilterClause>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonValueFilterClause {
    pub taxon: String,
    pub operator: SimpleFilterOperator,
    /// `None` compares with NULL; only `=` and `!=` accept it.
    #[serde(default)]
    pub value: Option<FilterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonTaxonFilterClause {
    pub taxon: String,
    pub right_taxon: String,
    pub operator: SimpleFilterOperator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonArrayFilterClause {
    pub taxon: String,
    pub operator: ArrayFilterOperator,
    pub value: Vec<FilterValue>,
}

impl FilterClause {
    pub fn value(taxon: &str, operator: SimpleFilterOperator, value: impl Into<FilterValue>) -> Self {
        FilterClause::TaxonValue(TaxonValueFilterClause {
            taxon: taxon.to_string(),
            operator,
            value: Some(value.into()),
        })
    }

    pub fn is_null(taxon: &str) -> Self {
        FilterClause::TaxonValue(TaxonValueFilterClause {
            taxon: taxon.to_string(),
            operator: SimpleFilterOperator::Eq,
            value: None,
        })
    }

    pub fn taxons(taxon: &str, operator: SimpleFilterOperator, right_taxon: &str) -> Self {
        FilterClause::TaxonTaxon(TaxonTaxonFilterClause {
            taxon: taxon.to_string(),
            right_taxon: right_taxon.to_string(),
            operator,
        })
    }

    pub fn in_list(taxon: &str, values: Vec<FilterValue>) -> Self {
        FilterClause::TaxonArray(TaxonArrayFilterClause {
            taxon: taxon.to_string(),
            operator: ArrayFilterOperator::In,
            value: values,
        })
    }

    pub fn and(clauses: Vec<FilterClause>) -> Self {
        FilterClause::Group(GroupFilterClause {
            logical_operator: LogicalOperator::And,
            clauses,
            negate: false,
        })
    }

    pub fn or(clauses: Vec<FilterClause>) -> Self {
        FilterClause::Group(GroupFilterClause {
            logical_operator: LogicalOperator::Or,
            clauses,
            negate: false,
        })
    }

    /// Every taxon slug the clause reads.
    pub fn taxon_slugs(&self) -> BTreeSet<String> {
        let mut slugs = BTreeSet::new();
        self.collect_taxon_slugs(&mut slugs);
        slugs
    }

    fn collect_taxon_slugs(&self, slugs: &mut BTreeSet<String>) {
        match self {
            FilterClause::Group(group) => {
                for clause in &group.clauses {
                    clause.collect_taxon_slugs(slugs);
                }
            }
            FilterClause::TaxonValue(clause) => {
                slugs.insert(clause.taxon.clone());
            }
            FilterClause::TaxonTaxon(clause) => {
                slugs.insert(clause.taxon.clone());
                slugs.insert(clause.right_taxon.clone());
            }
            FilterClause::TaxonArray(clause) => {
                slugs.insert(clause.taxon.clone());
            }
        }
    }

    /// Renders the clause against the given accessors.
    pub fn to_expr(&self, infos: &TaxonSqlInfoMap) -> Result<Expr> {
        match self {
            FilterClause::Group(group) => {
                let mut exprs = group
                    .clauses
                    .iter()
                    .map(|clause| clause.to_expr(infos))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter();
                let first = exprs.next().ok_or_else(|| {
                    HuskyError::invalid_request("Group filter clause must contain at least one clause")
                })?;
                let combined = exprs.fold(first, |acc, expr| match group.logical_operator {
                    LogicalOperator::And => acc.and(expr),
                    LogicalOperator::Or => acc.or(expr),
                });
                let grouped = paren(combined);
                Ok(if group.negate { grouped.not() } else { grouped })
            }
            FilterClause::TaxonValue(clause) => {
                let left = lookup(infos, &clause.taxon)?;
                let right = clause.value.as_ref().map(FilterValue::to_expr);
                simple_operator(left, clause.operator, right)
            }
            FilterClause::TaxonTaxon(clause) => {
                let left = lookup(infos, &clause.taxon)?;
                let right = lookup(infos, &clause.right_taxon)?.accessor.clone();
                simple_operator(left, clause.operator, Some(right))
            }
            FilterClause::TaxonArray(clause) => {
                if clause.value.is_empty() {
                    return Err(HuskyError::invalid_request(format!(
                        "Array filter on taxon \"{}\" must contain at least one value",
                        clause.taxon
                    )));
                }
                let info = lookup(infos, &clause.taxon)?;
                let values: Vec<Expr> = clause.value.iter().map(FilterValue::to_expr).collect();
                let left = info.accessor.clone();
                Ok(match (info.is_array(), clause.operator) {
                    (true, ArrayFilterOperator::In) => {
                        func("arrays_overlap", vec![func("array_construct", values), left])
                    }
                    (true, ArrayFilterOperator::NotIn) => {
                        func("arrays_overlap", vec![func("array_construct", values), left]).not()
                    }
                    (false, ArrayFilterOperator::In) => left.in_list(values),
                    (false, ArrayFilterOperator::NotIn) => left.not_in_list(values),
                })
            }
        }
    }
}

fn lookup<'m>(infos: &'m TaxonSqlInfoMap, taxon: &str) -> Result<&'m TaxonSqlInfo> {
    infos.get(taxon).ok_or_else(|| {
        HuskyError::invalid_request(format!("Taxon \"{taxon}\" used in filter is not available"))
    })
}

fn unknown_operator(operator: SimpleFilterOperator) -> HuskyError {
    HuskyError::invalid_request(format!("Unknown operator {operator:?} for the given value"))
}

fn simple_operator(left: &TaxonSqlInfo, operator: SimpleFilterOperator, right: Option<Expr>) -> Result<Expr> {
    let accessor = left.accessor.clone();
    if operator == SimpleFilterOperator::Eq && left.is_array() {
        if let Some(right) = right {
            return Ok(func("array_contains", vec![func("to_variant", vec![right]), accessor]));
        }
    }
    let Some(right) = right else {
        return match operator {
            SimpleFilterOperator::Eq => Ok(accessor.is_null()),
            SimpleFilterOperator::Neq => Ok(accessor.is_not_null()),
            other => Err(unknown_operator(other)),
        };
    };
    let like = |negated: bool, case_insensitive: bool| Expr::LikeEscape {
        expr: Box::new(cast(accessor.clone(), CastType::Text)),
        pattern: Box::new(right.clone()),
        escape_char: LIKE_ESCAPE_CHAR,
        negated,
        case_insensitive,
    };
    Ok(match operator {
        SimpleFilterOperator::Eq => accessor.eq(right),
        SimpleFilterOperator::Neq => accessor.ne(right),
        SimpleFilterOperator::Lt => accessor.lt(right),
        SimpleFilterOperator::Lte => accessor.lte(right),
        SimpleFilterOperator::Gt => accessor.gt(right),
        SimpleFilterOperator::Gte => accessor.gte(right),
        SimpleFilterOperator::Like => like(false, false),
        SimpleFilterOperator::NotLike => like(true, false),
        SimpleFilterOperator::ILike => like(false, true),
        SimpleFilterOperator::NotILike => like(true, true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{col, Dialect};
    use insta::assert_snapshot;

    fn infos() -> TaxonSqlInfoMap {
        let mut map = TaxonSqlInfoMap::new();
        map.insert("fb|spend".into(), TaxonSqlInfo::new(col("spend")));
        map.insert("fb|clicks".into(), TaxonSqlInfo::new(col("clicks")));
        map.insert("ad_name".into(), TaxonSqlInfo::new(col("ad_name")));
        let mut tags = TaxonSqlInfo::new(col("tags"));
        tags.quantity_type = ValueQuantityType::Array;
        map.insert("fb|tags".into(), tags);
        map
    }

    fn render(clause: &FilterClause) -> String {
        clause.to_expr(&infos()).unwrap().to_sql(Dialect::Snowflake)
    }

    #[test]
    fn test_deserialize_tagged_clauses() {
        let json = r#"{
            "type": "group",
            "logical_operator": "OR",
            "clauses": [
                {"type": "taxon_value", "taxon": "fb|spend", "operator": ">", "value": 10},
                {"type": "taxon_array", "taxon": "ad_name", "operator": "NOT_IN", "value": ["a", "b"]}
            ]
        }"#;
        let clause: FilterClause = serde_json::from_str(json).unwrap();
        assert_eq!(
            clause.taxon_slugs(),
            BTreeSet::from(["fb|spend".to_string(), "ad_name".to_string()])
        );
        assert_snapshot!(render(&clause), @r#"("spend" > 10 OR "ad_name" NOT IN ('a', 'b'))"#);
    }

    #[test]
    fn test_null_comparisons() {
        assert_snapshot!(render(&FilterClause::is_null("ad_name")), @r#""ad_name" IS NULL"#);
        let lt_null = FilterClause::TaxonValue(TaxonValueFilterClause {
            taxon: "fb|spend".into(),
            operator: SimpleFilterOperator::Lt,
            value: None,
        });
        assert!(lt_null.to_expr(&infos()).is_err());
    }

    #[test]
    fn test_like_casts_to_text() {
        let clause = FilterClause::value("ad_name", SimpleFilterOperator::ILike, "%sale%");
        let sql = render(&clause);
        assert!(sql.contains("CAST(\"ad_name\" AS VARCHAR)"), "{sql}");
        assert!(sql.contains("ESCAPE '/'"), "{sql}");
    }

    #[test]
    fn test_taxon_taxon() {
        let clause = FilterClause::taxons("fb|spend", SimpleFilterOperator::Gte, "fb|clicks");
        assert_snapshot!(render(&clause), @r#""spend" >= "clicks""#);
    }

    #[test]
    fn test_array_attributes() {
        let clause = FilterClause::value("fb|tags", SimpleFilterOperator::Eq, "x");
        assert_snapshot!(render(&clause), @r#"ARRAY_CONTAINS(TO_VARIANT('x'), "tags")"#);
        let clause = FilterClause::in_list("fb|tags", vec!["x".into()]);
        assert_snapshot!(render(&clause), @r#"ARRAYS_OVERLAP(ARRAY_CONSTRUCT('x'), "tags")"#);
    }

    #[test]
    fn test_negated_group() {
        let mut group = GroupFilterClause {
            logical_operator: LogicalOperator::And,
            clauses: vec![FilterClause::value("fb|spend", SimpleFilterOperator::Eq, 1)],
            negate: true,
        };
        let sql = render(&FilterClause::Group(group.clone()));
        assert_snapshot!(sql, @r#"NOT ("spend" = 1)"#);
        group.clauses.clear();
        assert!(FilterClause::Group(group).to_expr(&infos()).is_err());
    }

    #[test]
    fn test_unknown_taxon() {
        let clause = FilterClause::value("fb|impressions", SimpleFilterOperator::Eq, 1);
        assert!(clause.to_expr(&infos()).is_err());
    }
}
