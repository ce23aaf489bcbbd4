//! Typed TEL expression tree.
//!
//! The [dialect](super::dialect) visitor builds a [`TelExpr`] from parsed syntax, resolving
//! taxons and functions on the way. Evaluation then walks the tree in four passes:
//!
//! 1. `validate` collects semantic errors,
//! 2. `rewrite` folds constants and desugars conversion functions,
//! 3. `plan` inserts the phase transitions (dimension, aggregation, post-aggregation),
//! 4. `result` generates the SQL fragments and the formulas of every transition.

use std::cell::OnceCell;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use super::context::{Location, TelDialect, TelRootContext, ValidationContext};
use super::functions::FunctionCall;
use super::parser::BinaryOp;
use super::phase::TelPhase;
use super::result::{PreFormula, SqlFormulaTemplate, TelQueryResult, UsedTaxonsContainer};
use super::types::{TelDataType, TelType};
use crate::error::{HuskyError, Result};
use crate::identifier::{comparison_slug, safe_identifier};
use crate::sql::{
    coalesce, col, lit_bool, lit_float, lit_int, lit_null, lit_str, nullif, paren, table_col,
    template, Expr, ExprExt,
};
use crate::taxonomy::{AggregationDefinition, Taxon, TaxonType};

/// Callback applied to every rewritten child.
pub type RewriteFn<'f> = &'f dyn Fn(TelExpr) -> TelExpr;

/// Phase context a node is planned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Top of a tree without a root node.
    None,
    Root,
    Node(TelPhase),
}

impl Parent {
    pub fn phase(self) -> Option<TelPhase> {
        match self {
            Parent::None => None,
            Parent::Root => Some(TelPhase::MetricPost),
            Parent::Node(phase) => Some(phase),
        }
    }
}

/// Value of a constant subexpression.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl LiteralValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LiteralValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            LiteralValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            LiteralValue::Int(i) => Some(*i),
            LiteralValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            LiteralValue::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            LiteralValue::Int(i) => *i != 0,
            LiteralValue::Float(f) => *f != 0.0,
            LiteralValue::String(s) => !s.is_empty(),
            LiteralValue::Bool(b) => *b,
        }
    }

    fn equals(&self, other: &LiteralValue) -> bool {
        match (self, other) {
            (LiteralValue::String(a), LiteralValue::String(b)) => a == b,
            (LiteralValue::String(_), _) | (_, LiteralValue::String(_)) => false,
            _ => self.as_f64() == other.as_f64(),
        }
    }

    fn compare(&self, other: &LiteralValue) -> Option<Ordering> {
        match (self, other) {
            (LiteralValue::String(a), LiteralValue::String(b)) => Some(a.cmp(b)),
            (LiteralValue::String(_), _) | (_, LiteralValue::String(_)) => None,
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Folds an arithmetic operation; integers stay integers except for division.
    fn arithmetic(op: BinaryOp, left: &LiteralValue, right: &LiteralValue) -> Option<Self> {
        if op == BinaryOp::Div {
            let divisor = right.as_f64()?;
            if divisor.trunc() == 0.0 {
                return None;
            }
            return Some(LiteralValue::Float(left.as_f64()? / divisor));
        }
        if let (Some(l), Some(r)) = (left.as_int(), right.as_int()) {
            let folded = match op {
                BinaryOp::Add => l.checked_add(r),
                BinaryOp::Sub => l.checked_sub(r),
                BinaryOp::Mul => l.checked_mul(r),
                _ => None,
            };
            if let Some(value) = folded {
                return Some(LiteralValue::Int(value));
            }
        }
        let (l, r) = (left.as_f64()?, right.as_f64()?);
        match op {
            BinaryOp::Add => Some(LiteralValue::Float(l + r)),
            BinaryOp::Sub => Some(LiteralValue::Float(l - r)),
            BinaryOp::Mul => Some(LiteralValue::Float(l * r)),
            _ => None,
        }
    }

    /// Folds a logical operation. `AND`/`OR` return one of the operands.
    fn logical(op: BinaryOp, left: &LiteralValue, right: &LiteralValue) -> Option<Self> {
        let value = match op {
            BinaryOp::And if left.is_truthy() => right.clone(),
            BinaryOp::And => left.clone(),
            BinaryOp::Or if left.is_truthy() => left.clone(),
            BinaryOp::Or => right.clone(),
            BinaryOp::Eq => LiteralValue::Bool(left.equals(right)),
            BinaryOp::Ne => LiteralValue::Bool(!left.equals(right)),
            _ => {
                let ordering = left.compare(right)?;
                LiteralValue::Bool(match op {
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Gte => ordering.is_ge(),
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Lte => ordering.is_le(),
                    _ => return None,
                })
            }
        };
        Some(value)
    }

    fn into_kind(self) -> TelExprKind {
        match self {
            LiteralValue::Int(i) => TelExprKind::Integer(i),
            LiteralValue::Float(f) => TelExprKind::Float(f),
            LiteralValue::String(s) => TelExprKind::String(s),
            LiteralValue::Bool(b) => TelExprKind::Boolean(b),
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Int(i) => write!(f, "{i}"),
            LiteralValue::Float(v) => write!(f, "{v:?}"),
            LiteralValue::String(s) => f.write_str(s),
            LiteralValue::Bool(true) => f.write_str("True"),
            LiteralValue::Bool(false) => f.write_str("False"),
        }
    }
}

/// Reference to a taxon, possibly expanded into its calculation.
#[derive(Debug, Clone)]
pub struct TaxonNode {
    pub name: String,
    pub namespace: Option<String>,
    pub slug: String,
    pub taxon: Option<Taxon>,
    pub optional: bool,
    pub calculation: Option<Box<TelExpr>>,
    /// Resolved SQL of the referenced attribute, set in the model dialect.
    pub sql: Option<Expr>,
}

impl TaxonNode {
    fn is_metric_taxon(&self) -> bool {
        self.taxon
            .as_ref()
            .is_some_and(|t| t.taxon_type == TaxonType::Metric)
    }

    fn allowed(&self, ctx: &TelRootContext) -> bool {
        self.namespace
            .as_deref()
            .map_or(true, |ns| ctx.is_data_source_allowed(ns))
    }

    fn phase(&self, ctx: &TelRootContext) -> TelPhase {
        if let Some(calc) = &self.calculation {
            calc.phase(ctx)
        } else if self.is_metric_taxon() {
            TelPhase::MetricPre
        } else if self.namespace.is_some() {
            TelPhase::DimensionDataSource
        } else {
            TelPhase::Dimension
        }
    }

    fn return_type(&self, ctx: &TelRootContext) -> TelType {
        if self.sql.is_some() {
            return TelType::variable(TelDataType::Unknown);
        }
        match (&self.calculation, &self.taxon) {
            (Some(calc), _) => calc.return_type(ctx),
            (None, Some(taxon)) => TelType::from_validation_type(taxon.validation_type),
            (None, None) => TelType::variable(TelDataType::NoneOptional),
        }
    }

    fn return_data_sources(&self, ctx: &TelRootContext) -> BTreeSet<Option<String>> {
        let calc_sources = || {
            self.calculation
                .as_ref()
                .map(|c| c.return_data_sources(ctx))
                .unwrap_or_default()
        };
        if let Some(ns) = &self.namespace {
            let mut sources = calc_sources();
            sources.insert(Some(ns.clone()));
            sources
        } else if self.taxon.is_some() && self.calculation.is_none() {
            BTreeSet::from([None])
        } else {
            calc_sources()
        }
    }

    fn template_slugs(&self, ctx: &TelRootContext) -> BTreeSet<String> {
        match &self.calculation {
            Some(calc) => calc.template_slugs(ctx),
            None if self.taxon.is_some() && !self.is_metric_taxon() && self.namespace.is_some() => {
                BTreeSet::from([self.slug.clone()])
            }
            None => BTreeSet::new(),
        }
    }

    fn invalid_value(&self, ctx: &TelRootContext) -> bool {
        if self.sql.is_some() {
            return false;
        }
        let invalid = match &self.calculation {
            Some(calc) => calc.invalid_value(ctx),
            None => self.taxon.is_none(),
        };
        if self.optional {
            !self.allowed(ctx) || invalid
        } else {
            invalid
        }
    }

    fn used_taxons(&self, ctx: &TelRootContext) -> UsedTaxonsContainer {
        if self.sql.is_some() {
            return UsedTaxonsContainer::default();
        }
        let mut used = self
            .calculation
            .as_ref()
            .map(|c| c.used_taxons(ctx))
            .unwrap_or_default();
        if let Some(taxon) = &self.taxon {
            used.update_from(if self.optional {
                UsedTaxonsContainer::optional(taxon)
            } else {
                UsedTaxonsContainer::required(taxon)
            });
        }
        used
    }

    fn validate(&self, ctx: &TelRootContext, v: &mut ValidationContext, location: &Location) {
        if let Some(calc) = &self.calculation {
            calc.validate(ctx, v);
        }
        if self.optional {
            return;
        }
        if !self.allowed(ctx) {
            v.with_error(format!("Missing required taxon \"{}\"", self.slug), location);
        }
        if self.taxon.is_none() {
            v.with_error(format!("Taxon \"{}\" not found", self.slug), location);
        }
    }

    fn aggregation_definition(&self, ctx: &TelRootContext) -> Option<AggregationDefinition> {
        if let Some(calc) = &self.calculation {
            return calc.aggregation_definition(ctx);
        }
        match &self.taxon {
            Some(Taxon {
                aggregation: Some(aggregation),
                ..
            }) => Some(aggregation.clone()),
            None => Some(AggregationDefinition::not_set()),
            Some(_) if self.is_metric_taxon() => Some(AggregationDefinition::not_set()),
            Some(_) => Some(AggregationDefinition::group_by()),
        }
    }

    fn result(&self, ctx: &TelRootContext) -> Result<TelQueryResult> {
        if let Some(sql) = &self.sql {
            return Ok(TelQueryResult::new(sql.clone()));
        }
        if let Some(calc) = &self.calculation {
            return calc.result(ctx);
        }
        let column_name = match &self.taxon {
            Some(taxon) if ctx.is_benchmark && !taxon.is_dimension() => comparison_slug(&self.slug),
            _ => self.slug.clone(),
        };
        let sql = if self.is_metric_taxon() || self.namespace.is_none() {
            col(&safe_identifier(&column_name))
        } else {
            template(&self.slug)
        };
        Ok(TelQueryResult::new(sql))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Dimension,
    Aggregation,
    PostAggregation,
}

impl TransitionKind {
    pub fn phase(self) -> TelPhase {
        match self {
            TransitionKind::Dimension => TelPhase::Dimension,
            TransitionKind::Aggregation => TelPhase::MetricPre,
            TransitionKind::PostAggregation => TelPhase::MetricPost,
        }
    }
}

/// Moves the value into a later phase, materializing it as a labelled column.
#[derive(Debug, Clone)]
pub struct Transition {
    pub kind: TransitionKind,
    pub value: Box<TelExpr>,
    pub aggregation: AggregationDefinition,
    pub label: Option<String>,
    cached_label: OnceCell<String>,
}

impl Transition {
    fn new(
        kind: TransitionKind,
        value: TelExpr,
        aggregation: AggregationDefinition,
        label: Option<String>,
    ) -> Self {
        Self {
            kind,
            value: Box::new(value),
            aggregation,
            label,
            cached_label: OnceCell::new(),
        }
    }

    fn aggregation_definition(&self, ctx: &TelRootContext) -> Option<AggregationDefinition> {
        match self.kind {
            TransitionKind::Dimension => self.value.aggregation_definition(ctx),
            _ => Some(self.aggregation.clone()),
        }
    }

    /// Explicit label, otherwise a generated one that stays stable for this node.
    fn label_or_new(&self, ctx: &TelRootContext) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.cached_label.get_or_init(|| ctx.new_label()).clone(),
        }
    }

    fn known_label(&self, result: &TelQueryResult) -> Option<String> {
        self.label
            .clone()
            .or_else(|| self.cached_label.get().cloned())
            .or_else(|| result.label.clone())
    }

    fn result(&self, ctx: &TelRootContext) -> Result<TelQueryResult> {
        let value = &self.value;
        let value_phase = value.phase(ctx);
        let result = value.result(ctx)?;
        if value_phase == self.kind.phase() {
            return Ok(result);
        }
        let accepted = match self.kind {
            TransitionKind::Dimension => {
                matches!(value_phase, TelPhase::DimensionDataSource | TelPhase::Any)
            }
            TransitionKind::Aggregation => {
                matches!(value_phase, TelPhase::Dimension | TelPhase::Any)
            }
            TransitionKind::PostAggregation => {
                matches!(value_phase, TelPhase::MetricPre | TelPhase::Any)
            }
        };
        if !accepted {
            return Err(HuskyError::internal(format!(
                "Cannot move to {} phase from {value_phase}",
                self.kind.phase()
            )));
        }

        let mut formula = None;
        let mut ds_template = None;
        let (sql, template) = if value.used_taxons(ctx).has_some() {
            let label = self.label_or_new(ctx);
            match self.kind {
                TransitionKind::Dimension => {
                    let sources: Vec<String> =
                        value.return_data_sources(ctx).into_iter().flatten().collect();
                    let data_source = match sources.as_slice() {
                        [single] => single.clone(),
                        _ => {
                            return Err(HuskyError::internal(format!(
                                "Expected exactly one data source for dimension formula {label}"
                            )))
                        }
                    };
                    ds_template = Some(SqlFormulaTemplate::new(
                        result.sql.clone(),
                        &label,
                        &data_source,
                        value.template_slugs(ctx),
                    ));
                }
                TransitionKind::Aggregation => {
                    formula = Some(PreFormula::new(
                        result.sql.clone(),
                        &label,
                        Some(AggregationDefinition::not_set()),
                    ));
                }
                TransitionKind::PostAggregation => {
                    formula = Some(PreFormula::new(
                        result.sql.clone(),
                        &label,
                        Some(self.aggregation.clone()),
                    ));
                }
            }
            let column = col(&safe_identifier(&label));
            (column.clone(), Some(column))
        } else {
            (result.sql.clone(), result.template.clone())
        };
        let label = self.known_label(&result);

        let mut output = if value.invalid_value(ctx) {
            TelQueryResult::new(sql)
        } else {
            let mut output = result.clone();
            output.sql = sql;
            output.template = template;
            output
        };
        output.label = label;
        match self.kind {
            TransitionKind::Dimension => {
                if let Some(t) = ds_template {
                    output.data_source_formula_templates.insert(0, t);
                }
            }
            TransitionKind::Aggregation => {
                if let Some(f) = formula {
                    output.dimension_formulas.insert(0, f);
                }
            }
            TransitionKind::PostAggregation => {
                if let Some(f) = formula {
                    output.aggregations.insert(0, f);
                }
            }
        }
        Ok(output)
    }

    /// An aggregation of a per-data-source value first moves it to the dimension phase.
    fn plan(&self, ctx: &TelRootContext, location: &Location) -> TelExpr {
        if self.kind == TransitionKind::Aggregation
            && self.value.phase(ctx) == TelPhase::DimensionDataSource
        {
            return (*self.value)
                .clone()
                .to_dimension()
                .to_aggregation(None, self.label.clone());
        }
        TelExpr::new(TelExprKind::Transition(self.clone()), location.clone())
    }
}

#[derive(Debug, Clone)]
pub enum TelExprKind {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    /// Physical column of the model (model dialect only).
    Column(String),
    Paren(Box<TelExpr>),
    Taxon(TaxonNode),
    Binary {
        op: BinaryOp,
        left: Box<TelExpr>,
        right: Box<TelExpr>,
    },
    Not(Box<TelExpr>),
    IsNull {
        operand: Box<TelExpr>,
        negated: bool,
    },
    Function(FunctionCall),
    Transition(Transition),
    Root(Box<TelExpr>),
}

/// A node of the typed expression tree.
#[derive(Debug, Clone)]
pub struct TelExpr {
    pub kind: TelExprKind,
    pub location: Location,
}

fn numeric_sql(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    match op {
        BinaryOp::Mul => left.mul(right),
        BinaryOp::Div => left.div(nullif(right, lit_int(0))),
        BinaryOp::Add => coalesce(vec![left, lit_int(0)]).add(coalesce(vec![right, lit_int(0)])),
        _ => coalesce(vec![left, lit_int(0)]).sub(coalesce(vec![right, lit_int(0)])),
    }
}

fn logical_sql(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: op.sql_operator(),
        right: Box::new(right),
    }
}

impl TelExpr {
    pub fn new(kind: TelExprKind, location: Location) -> Self {
        Self { kind, location }
    }

    /// New node at the location of `self`.
    pub fn copy_with(&self, kind: TelExprKind) -> Self {
        Self::new(kind, self.location.clone())
    }

    pub fn to_dimension(self) -> TelExpr {
        let location = self.location.clone();
        let transition = Transition::new(
            TransitionKind::Dimension,
            self,
            AggregationDefinition::not_set(),
            None,
        );
        TelExpr::new(TelExprKind::Transition(transition), location)
    }

    /// Wraps in an aggregation transition; `None` means `not_set`.
    pub fn to_aggregation(
        self,
        aggregation: Option<AggregationDefinition>,
        label: Option<String>,
    ) -> TelExpr {
        let location = self.location.clone();
        let transition = Transition::new(
            TransitionKind::Aggregation,
            self,
            aggregation.unwrap_or_else(AggregationDefinition::not_set),
            label,
        );
        TelExpr::new(TelExprKind::Transition(transition), location)
    }

    /// Wraps in a post-aggregation transition; `None` means `sum`.
    pub fn to_post_aggregation(
        self,
        aggregation: Option<AggregationDefinition>,
        label: Option<String>,
    ) -> TelExpr {
        let location = self.location.clone();
        let transition = Transition::new(
            TransitionKind::PostAggregation,
            self,
            aggregation.unwrap_or_else(AggregationDefinition::sum),
            label,
        );
        TelExpr::new(TelExprKind::Transition(transition), location)
    }

    pub fn children(&self) -> Vec<&TelExpr> {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => vec![],
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. }
            | TelExprKind::Root(value) => vec![&**value],
            TelExprKind::Taxon(taxon) => taxon.calculation.iter().map(|c| &**c).collect(),
            TelExprKind::Binary { left, right, .. } => vec![&**left, &**right],
            TelExprKind::Function(call) => call.args.iter().collect(),
            TelExprKind::Transition(t) => vec![&*t.value],
        }
    }

    pub fn phase(&self, ctx: &TelRootContext) -> TelPhase {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => TelPhase::Any,
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. } => value.phase(ctx),
            TelExprKind::Taxon(taxon) => taxon.phase(ctx),
            TelExprKind::Binary { op, left, right } if op.is_numeric() => {
                if self.is_post_aggregation(ctx, *op, left, right) {
                    TelPhase::MetricPost
                } else {
                    TelPhase::MetricPre
                }
            }
            TelExprKind::Binary { left, right, .. } => {
                let post = [left, right].iter().any(|side| {
                    !side.invalid_value(ctx) && side.phase(ctx) == TelPhase::MetricPost
                });
                if post {
                    TelPhase::MetricPost
                } else {
                    TelPhase::max_of([left.phase(ctx), right.phase(ctx)])
                }
            }
            TelExprKind::Function(call) => call.phase(ctx),
            TelExprKind::Transition(t) => t.kind.phase(),
            TelExprKind::Root(_) => TelPhase::MetricPost,
        }
    }

    fn is_post_aggregation(
        &self,
        ctx: &TelRootContext,
        op: BinaryOp,
        left: &TelExpr,
        right: &TelExpr,
    ) -> bool {
        let (left_invalid, right_invalid) = (left.invalid_value(ctx), right.invalid_value(ctx));
        let has_post = (!left_invalid && left.phase(ctx) == TelPhase::MetricPost)
            || (!right_invalid && right.phase(ctx) == TelPhase::MetricPost);
        if has_post {
            return true;
        }
        if op.is_strict() {
            (left.return_type(ctx).is_constant && right.return_type(ctx).is_constant)
                || (left.used_taxons(ctx).has_some() && right.used_taxons(ctx).has_some())
        } else {
            (!left_invalid && !left.used_taxons(ctx).has_some())
                || (!right_invalid && !right.used_taxons(ctx).has_some())
        }
    }

    pub fn return_type(&self, ctx: &TelRootContext) -> TelType {
        match &self.kind {
            TelExprKind::Integer(_) => TelType::constant(TelDataType::Integer),
            TelExprKind::Float(_) => TelType::constant(TelDataType::Numeric),
            TelExprKind::String(_) => TelType::constant(TelDataType::String),
            TelExprKind::Boolean(_) => TelType::constant(TelDataType::Boolean),
            TelExprKind::Column(_) => TelType::variable(TelDataType::Unknown),
            TelExprKind::Paren(value) | TelExprKind::Not(value) | TelExprKind::Root(value) => {
                value.return_type(ctx)
            }
            TelExprKind::IsNull { operand, .. } => {
                operand.return_type(ctx).with_data_type(TelDataType::Boolean)
            }
            TelExprKind::Taxon(taxon) => taxon.return_type(ctx),
            TelExprKind::Binary { op, left, right } => {
                let types: Vec<TelType> = [left, right]
                    .iter()
                    .filter(|side| !side.invalid_value(ctx))
                    .map(|side| side.return_type(ctx))
                    .collect();
                if op.is_numeric() {
                    if types.is_empty() {
                        TelType::variable(TelDataType::Any)
                    } else {
                        TelType::common_type(&types)
                    }
                } else {
                    TelType::common_type(&types).with_data_type(TelDataType::Boolean)
                }
            }
            TelExprKind::Function(call) => call.return_type(ctx),
            TelExprKind::Transition(t) => t.value.return_type(ctx),
        }
    }

    pub fn invalid_value(&self, ctx: &TelRootContext) -> bool {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => false,
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. }
            | TelExprKind::Root(value) => value.invalid_value(ctx),
            TelExprKind::Taxon(taxon) => taxon.invalid_value(ctx),
            TelExprKind::Binary { op, left, right } => match op {
                BinaryOp::Add => left.invalid_value(ctx) && right.invalid_value(ctx),
                BinaryOp::Sub => left.invalid_value(ctx),
                _ => left.invalid_value(ctx) || right.invalid_value(ctx),
            },
            TelExprKind::Function(call) => call.invalid_value(ctx),
            TelExprKind::Transition(t) => t.value.invalid_value(ctx),
        }
    }

    pub fn used_taxons(&self, ctx: &TelRootContext) -> UsedTaxonsContainer {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => UsedTaxonsContainer::default(),
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. }
            | TelExprKind::Root(value) => value.used_taxons(ctx),
            TelExprKind::Taxon(taxon) => taxon.used_taxons(ctx),
            TelExprKind::Binary { left, right, .. } => {
                match (left.invalid_value(ctx), right.invalid_value(ctx)) {
                    (true, true) => UsedTaxonsContainer::default(),
                    (true, false) => right.used_taxons(ctx),
                    (false, true) => left.used_taxons(ctx),
                    (false, false) => {
                        UsedTaxonsContainer::merge(left.used_taxons(ctx), right.used_taxons(ctx))
                    }
                }
            }
            TelExprKind::Function(call) => call.used_taxons(ctx),
            TelExprKind::Transition(t) => t.value.used_taxons(ctx),
        }
    }

    /// Namespaces the value comes from; `None` stands for data-source agnostic taxons.
    pub fn return_data_sources(&self, ctx: &TelRootContext) -> BTreeSet<Option<String>> {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => BTreeSet::new(),
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. }
            | TelExprKind::Root(value) => value.return_data_sources(ctx),
            TelExprKind::Taxon(taxon) => taxon.return_data_sources(ctx),
            TelExprKind::Binary { left, right, .. } => {
                let mut sources = left.return_data_sources(ctx);
                sources.extend(right.return_data_sources(ctx));
                sources
            }
            TelExprKind::Function(call) => call.return_data_sources(ctx),
            TelExprKind::Transition(t) => t.value.return_data_sources(ctx),
        }
    }

    /// Slugs rendered as `${slug}` placeholders in the SQL.
    pub fn template_slugs(&self, ctx: &TelRootContext) -> BTreeSet<String> {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => BTreeSet::new(),
            TelExprKind::Paren(value)
            | TelExprKind::Not(value)
            | TelExprKind::IsNull { operand: value, .. }
            | TelExprKind::Root(value) => value.template_slugs(ctx),
            TelExprKind::Taxon(taxon) => taxon.template_slugs(ctx),
            TelExprKind::Binary { left, right, .. } => {
                let mut slugs = left.template_slugs(ctx);
                slugs.extend(right.template_slugs(ctx));
                slugs
            }
            TelExprKind::Function(call) => call.template_slugs(ctx),
            TelExprKind::Transition(t) => t.value.template_slugs(ctx),
        }
    }

    /// Aggregation the value should be aggregated with; `None` when it cannot be deduced.
    pub fn aggregation_definition(&self, ctx: &TelRootContext) -> Option<AggregationDefinition> {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => Some(AggregationDefinition::not_set()),
            TelExprKind::Paren(value) | TelExprKind::Root(value) => {
                value.aggregation_definition(ctx)
            }
            TelExprKind::Not(_) | TelExprKind::IsNull { .. } => {
                Some(AggregationDefinition::group_by())
            }
            TelExprKind::Taxon(taxon) => taxon.aggregation_definition(ctx),
            TelExprKind::Binary { op, left, right } if op.is_numeric() => {
                let (l, r) = (left.aggregation_definition(ctx), right.aggregation_definition(ctx));
                AggregationDefinition::common_defined_definition(
                    [l.as_ref(), r.as_ref()],
                    false,
                    TaxonType::Dimension,
                )
            }
            TelExprKind::Binary { .. } => Some(AggregationDefinition::group_by()),
            TelExprKind::Function(call) => call.aggregation_definition(ctx),
            TelExprKind::Transition(t) => t.aggregation_definition(ctx),
        }
    }

    pub fn literal_value(&self, ctx: &TelRootContext) -> Option<LiteralValue> {
        match &self.kind {
            TelExprKind::Integer(i) => Some(LiteralValue::Int(*i)),
            TelExprKind::Float(f) => Some(LiteralValue::Float(*f)),
            TelExprKind::String(s) => Some(LiteralValue::String(s.clone())),
            TelExprKind::Boolean(b) => Some(LiteralValue::Bool(*b)),
            TelExprKind::Column(_) | TelExprKind::IsNull { .. } | TelExprKind::Function(_) => None,
            TelExprKind::Paren(value) | TelExprKind::Root(value) => value.literal_value(ctx),
            TelExprKind::Not(value) => value
                .literal_value(ctx)
                .map(|v| LiteralValue::Bool(!v.is_truthy())),
            TelExprKind::Taxon(taxon) => taxon
                .calculation
                .as_ref()
                .and_then(|c| c.literal_value(ctx)),
            TelExprKind::Binary { op, left, right } => {
                let (l, r) = (left.literal_value(ctx)?, right.literal_value(ctx)?);
                if op.is_numeric() {
                    LiteralValue::arithmetic(*op, &l, &r)
                } else {
                    LiteralValue::logical(*op, &l, &r)
                }
            }
            TelExprKind::Transition(t) => t.value.literal_value(ctx),
        }
    }

    pub fn validate(&self, ctx: &TelRootContext, v: &mut ValidationContext) {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => {}
            TelExprKind::Paren(value) | TelExprKind::IsNull { operand: value, .. } => {
                value.validate(ctx, v)
            }
            TelExprKind::Transition(t) => t.value.validate(ctx, v),
            TelExprKind::Not(value) => {
                value.validate(ctx, v);
                if !value.return_type(ctx).is_boolean() {
                    v.with_error(
                        "Operand in not expression must be of type: boolean",
                        &self.location,
                    );
                }
            }
            TelExprKind::Taxon(taxon) => taxon.validate(ctx, v, &self.location),
            TelExprKind::Binary { op, left, right } => {
                left.validate(ctx, v);
                right.validate(ctx, v);
                if op.is_numeric() {
                    if v.has_errors() {
                        return;
                    }
                    for (position, side) in [(1, left), (2, right)] {
                        if !side.invalid_value(ctx) && !side.return_type(ctx).is_number() {
                            v.with_error(
                                format!(
                                    "Operand {position} in {} expression must be of type: number",
                                    op.description()
                                ),
                                &side.location,
                            );
                        }
                    }
                } else if !TelType::are_compatible(&[left.return_type(ctx), right.return_type(ctx)])
                {
                    v.with_error(
                        "Operands in logical expression must have compatible data types",
                        &self.location,
                    );
                }
            }
            TelExprKind::Function(call) => call.validate(ctx, v, &self.location),
            TelExprKind::Root(value) => self.validate_root(ctx, v, value),
        }
    }

    fn validate_root(&self, ctx: &TelRootContext, v: &mut ValidationContext, value: &TelExpr) {
        value.validate(ctx, v);
        if v.has_errors() {
            return;
        }
        let phase = value.phase(ctx);
        if ctx.subrequest_only && phase > TelPhase::Dimension {
            v.with_error(
                "Taxon used for subrequest cannot use complex calculation logic after merge() function.",
                &self.location,
            );
        } else if phase.is_metric() && ctx.taxon_type != TaxonType::Metric {
            v.with_error(
                format!(
                    "Taxon is of type {}, but calculation is for type {}",
                    ctx.taxon_type,
                    TaxonType::Metric
                ),
                &self.location,
            );
        }
        if value.aggregation_definition(ctx).is_none() {
            v.with_error(
                "It was not possible to deduce aggregation type",
                &self.location,
            );
        }
    }

    pub fn result(&self, ctx: &TelRootContext) -> Result<TelQueryResult> {
        let result = match &self.kind {
            TelExprKind::Integer(i) => TelQueryResult::new(lit_int(*i)),
            TelExprKind::Float(f) => TelQueryResult::new(lit_float(*f)),
            TelExprKind::String(s) => TelQueryResult::new(lit_str(s)),
            TelExprKind::Boolean(b) => TelQueryResult::new(lit_bool(*b)),
            TelExprKind::Column(name) => TelQueryResult::new(match &ctx.dialect {
                TelDialect::Model(model) => {
                    table_col(&safe_identifier(model.unique_object_name), name)
                }
                TelDialect::Taxon => col(name),
            }),
            TelExprKind::Paren(value) => {
                let result = value.result(ctx)?;
                let (sql, template) = result.map_both(paren);
                result.update(sql, Some(template))
            }
            TelExprKind::Not(value) => {
                let result = value.result(ctx)?;
                let (sql, template) = result.map_both(|e| e.not());
                result.update(sql, Some(template))
            }
            TelExprKind::IsNull { operand, negated } => {
                let result = operand.result(ctx)?;
                let negated = *negated;
                let (sql, template) = result.map_both(|e| {
                    if negated {
                        e.is_not_null()
                    } else {
                        e.is_null()
                    }
                });
                result.update(sql, Some(template))
            }
            TelExprKind::Taxon(taxon) => taxon.result(ctx)?,
            TelExprKind::Binary { op, left, right } => {
                let (l, r) = (left.result(ctx)?, right.result(ctx)?);
                if op.is_numeric() {
                    let sql = numeric_sql(*op, l.sql.clone(), r.sql.clone());
                    let template =
                        numeric_sql(*op, l.template_or_sql().clone(), r.template_or_sql().clone());
                    TelQueryResult::merge(
                        sql,
                        Some(template),
                        [
                            (!left.invalid_value(ctx)).then_some(&l),
                            (!right.invalid_value(ctx)).then_some(&r),
                        ],
                    )
                } else {
                    let sql = logical_sql(*op, l.sql.clone(), r.sql.clone());
                    let template =
                        logical_sql(*op, l.template_or_sql().clone(), r.template_or_sql().clone());
                    TelQueryResult::merge(sql, Some(template), [Some(&l), Some(&r)])
                }
            }
            TelExprKind::Function(call) => call.result(ctx)?,
            TelExprKind::Transition(t) => t.result(ctx)?,
            TelExprKind::Root(value) => {
                if value.invalid_value(ctx) {
                    TelQueryResult::new(lit_null())
                } else {
                    value.result(ctx)?
                }
            }
        };
        Ok(result)
    }

    pub fn rewrite(&self, ctx: &TelRootContext, cb: RewriteFn<'_>) -> TelExpr {
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_)
            | TelExprKind::Transition(_) => self.clone(),
            TelExprKind::Paren(value) => {
                self.copy_with(TelExprKind::Paren(Box::new(cb(value.rewrite(ctx, cb)))))
            }
            TelExprKind::Not(value) => {
                self.copy_with(TelExprKind::Not(Box::new(cb(value.rewrite(ctx, cb)))))
            }
            TelExprKind::IsNull { operand, negated } => self.copy_with(TelExprKind::IsNull {
                operand: Box::new(cb(operand.rewrite(ctx, cb))),
                negated: *negated,
            }),
            TelExprKind::Root(value) => {
                self.copy_with(TelExprKind::Root(Box::new(cb(value.rewrite(ctx, cb)))))
            }
            TelExprKind::Taxon(taxon) => match &taxon.calculation {
                Some(calc) => {
                    let mut rewritten = taxon.clone();
                    rewritten.calculation = Some(Box::new(cb(calc.rewrite(ctx, cb))));
                    self.copy_with(TelExprKind::Taxon(rewritten))
                }
                None => self.clone(),
            },
            TelExprKind::Binary { op, left, right } => {
                let (left_invalid, right_invalid) =
                    (left.invalid_value(ctx), right.invalid_value(ctx));
                match op {
                    BinaryOp::Add if left_invalid => return right.rewrite(ctx, cb),
                    BinaryOp::Add if right_invalid => return left.rewrite(ctx, cb),
                    BinaryOp::Sub if right_invalid && !left_invalid => {
                        return left.rewrite(ctx, cb)
                    }
                    _ => {}
                }
                if let Some(value) = self.literal_value(ctx) {
                    return self.copy_with(value.into_kind());
                }
                self.copy_with(TelExprKind::Binary {
                    op: *op,
                    left: Box::new(cb(left.rewrite(ctx, cb))),
                    right: Box::new(cb(right.rewrite(ctx, cb))),
                })
            }
            TelExprKind::Function(call) => call.rewrite(ctx, cb, &self.location),
        }
    }

    /// Inserts the phase transitions needed to evaluate the tree.
    pub fn plan(&self, ctx: &TelRootContext, parent: Parent) -> TelExpr {
        let here = Parent::Node(self.phase(ctx));
        match &self.kind {
            TelExprKind::Integer(_)
            | TelExprKind::Float(_)
            | TelExprKind::String(_)
            | TelExprKind::Boolean(_)
            | TelExprKind::Column(_) => self.clone(),
            TelExprKind::Paren(value) => {
                self.copy_with(TelExprKind::Paren(Box::new(value.plan(ctx, here))))
            }
            TelExprKind::Not(value) => {
                self.copy_with(TelExprKind::Not(Box::new(value.plan(ctx, here))))
            }
            TelExprKind::IsNull { operand, negated } => self.copy_with(TelExprKind::IsNull {
                operand: Box::new(operand.plan(ctx, here)),
                negated: *negated,
            }),
            TelExprKind::Taxon(taxon) => match &taxon.calculation {
                Some(calc) if !calc.invalid_value(ctx) => {
                    let mut planned = taxon.clone();
                    planned.calculation = Some(Box::new(calc.plan(ctx, here)));
                    self.copy_with(TelExprKind::Taxon(planned))
                }
                _ => self.clone(),
            },
            TelExprKind::Binary { op, left, right } if op.is_numeric() => {
                let post = self.is_post_aggregation(ctx, *op, left, right);
                let plan_side = |side: &TelExpr| {
                    let planned = side.plan(ctx, here);
                    if post && side.phase(ctx) != TelPhase::MetricPost {
                        planned.to_post_aggregation(side.aggregation_definition(ctx), None)
                    } else {
                        planned
                    }
                };
                self.copy_with(TelExprKind::Binary {
                    op: *op,
                    left: Box::new(plan_side(left)),
                    right: Box::new(plan_side(right)),
                })
            }
            TelExprKind::Binary { op, left, right } => {
                let parent_phase = parent.phase();
                let plan_side = |side: &TelExpr| {
                    let mut planned = None;
                    if parent_phase.is_some_and(TelPhase::is_metric) && side.phase(ctx).is_dimension()
                    {
                        planned = Some(
                            side.plan(ctx, here)
                                .to_aggregation(side.aggregation_definition(ctx), None)
                                .plan(ctx, here),
                        );
                    }
                    let current = planned.as_ref().unwrap_or(side);
                    if parent_phase == Some(TelPhase::MetricPost)
                        && current.phase(ctx) == TelPhase::MetricPre
                    {
                        let aggregation = current.aggregation_definition(ctx);
                        let inner = planned.unwrap_or_else(|| side.plan(ctx, here));
                        return inner.to_post_aggregation(aggregation, None);
                    }
                    planned.unwrap_or_else(|| side.plan(ctx, here))
                };
                self.copy_with(TelExprKind::Binary {
                    op: *op,
                    left: Box::new(plan_side(left)),
                    right: Box::new(plan_side(right)),
                })
            }
            TelExprKind::Function(call) => call.plan(ctx, parent, &self.location),
            TelExprKind::Transition(t) => t.plan(ctx, &self.location),
            TelExprKind::Root(value) => self.plan_root(ctx, value),
        }
    }

    fn plan_root(&self, ctx: &TelRootContext, value: &TelExpr) -> TelExpr {
        if value.invalid_value(ctx) {
            return self.clone();
        }
        let planned = value.plan(ctx, Parent::Root);
        let phase = planned.phase(ctx);
        let slug = Some(ctx.taxon_slug.clone());
        let root = |inner: TelExpr| self.copy_with(TelExprKind::Root(Box::new(inner)));

        if ctx.subrequest_only {
            if phase == TelPhase::DimensionDataSource {
                return root(planned.to_dimension());
            }
            return root(planned);
        }
        match phase {
            TelPhase::DimensionDataSource => {
                let aggregation = planned.aggregation_definition(ctx);
                root(
                    planned
                        .to_dimension()
                        .to_aggregation(None, slug.clone())
                        .to_post_aggregation(aggregation, slug),
                )
            }
            TelPhase::Dimension => {
                let aggregation = planned.aggregation_definition(ctx);
                let aggregated = planned
                    .to_aggregation(None, slug.clone())
                    .plan(ctx, Parent::Root);
                root(aggregated.to_post_aggregation(aggregation, slug))
            }
            TelPhase::Any => {
                let aggregated = planned.to_aggregation(None, None).plan(ctx, Parent::Root);
                root(aggregated.to_post_aggregation(Some(AggregationDefinition::not_set()), None))
            }
            TelPhase::MetricPre => {
                let aggregation = planned.aggregation_definition(ctx);
                root(planned.to_post_aggregation(aggregation, slug))
            }
            _ => root(planned),
        }
    }

    /// Whether any node of the tree references a taxon.
    pub fn contains_taxon(&self) -> bool {
        matches!(self.kind, TelExprKind::Taxon(_))
            || self.children().into_iter().any(TelExpr::contains_taxon)
    }

    /// Whether the expression is a ratio-like metric whose comparison value can be computed.
    pub fn can_become_comparison_metric(&self) -> bool {
        match &self.kind {
            TelExprKind::Binary { op, left, right } if op.is_strict() => {
                left.can_become_comparison_metric() || right.contains_taxon()
            }
            _ => self
                .children()
                .into_iter()
                .any(TelExpr::can_become_comparison_metric),
        }
    }

    /// The literal value if the node is a plain literal.
    pub fn as_literal(&self) -> Option<LiteralValue> {
        match &self.kind {
            TelExprKind::Integer(i) => Some(LiteralValue::Int(*i)),
            TelExprKind::Float(f) => Some(LiteralValue::Float(*f)),
            TelExprKind::String(s) => Some(LiteralValue::String(s.clone())),
            TelExprKind::Boolean(b) => Some(LiteralValue::Bool(*b)),
            _ => None,
        }
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "!=",
        BinaryOp::Gt => ">",
        BinaryOp::Gte => ">=",
        BinaryOp::Lt => "<",
        BinaryOp::Lte => "<=",
    }
}

impl fmt::Display for TelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TelExprKind::Integer(i) => write!(f, "{i}"),
            TelExprKind::Float(v) => write!(f, "{v:?}"),
            TelExprKind::String(s) => write!(f, "'{s}'"),
            TelExprKind::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            TelExprKind::Column(name) => write!(f, "\"{name}\""),
            TelExprKind::Paren(value) => write!(f, "({value})"),
            TelExprKind::Taxon(taxon) if taxon.optional => write!(f, "?{}", taxon.slug),
            TelExprKind::Taxon(taxon) => f.write_str(&taxon.slug),
            TelExprKind::Binary { op, left, right } => {
                write!(f, "{left} {} {right}", op_symbol(*op))
            }
            TelExprKind::Not(value) => write!(f, "NOT {value}"),
            TelExprKind::IsNull { operand, negated } => {
                write!(f, "{operand} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            TelExprKind::Function(call) => {
                write!(f, "{}(", call.function.name())?;
                for (idx, arg) in call.args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            TelExprKind::Transition(t) => write!(f, "{} >>> {}", t.value, t.kind.phase()),
            TelExprKind::Root(value) => write!(f, "Root({value})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        let folded = LiteralValue::arithmetic(
            BinaryOp::Mul,
            &LiteralValue::Int(6),
            &LiteralValue::Int(7),
        );
        assert_eq!(folded, Some(LiteralValue::Int(42)));
    }

    #[test]
    fn test_division_folds_to_float_unless_divisor_truncates_to_zero() {
        assert_eq!(
            LiteralValue::arithmetic(BinaryOp::Div, &LiteralValue::Int(1), &LiteralValue::Int(4)),
            Some(LiteralValue::Float(0.25))
        );
        assert_eq!(
            LiteralValue::arithmetic(
                BinaryOp::Div,
                &LiteralValue::Int(1),
                &LiteralValue::Float(0.5)
            ),
            None
        );
    }

    #[test]
    fn test_logical_folding_returns_operands() {
        assert_eq!(
            LiteralValue::logical(BinaryOp::And, &LiteralValue::Int(1), &LiteralValue::Int(2)),
            Some(LiteralValue::Int(2))
        );
        assert_eq!(
            LiteralValue::logical(
                BinaryOp::Or,
                &LiteralValue::Bool(false),
                &LiteralValue::String("x".into())
            ),
            Some(LiteralValue::String("x".into()))
        );
        assert_eq!(
            LiteralValue::logical(BinaryOp::Eq, &LiteralValue::Int(1), &LiteralValue::Float(1.0)),
            Some(LiteralValue::Bool(true))
        );
        assert_eq!(
            LiteralValue::logical(
                BinaryOp::Lt,
                &LiteralValue::String("a".into()),
                &LiteralValue::Int(1)
            ),
            None
        );
    }

    #[test]
    fn test_parent_phase() {
        assert_eq!(Parent::Root.phase(), Some(TelPhase::MetricPost));
        assert_eq!(Parent::None.phase(), None);
        assert_eq!(
            Parent::Node(TelPhase::Dimension).phase(),
            Some(TelPhase::Dimension)
        );
    }
}
