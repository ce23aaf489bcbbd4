//! TEL function library.
//!
//! Every function declares its accepted arguments, phase, return type and validity through
//! small spec enums; the behaviour that does not fit a spec (conditions, windowed metrics,
//! override mappings) is implemented per function below.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::context::{Location, TelDialectType, TelRootContext, ValidationContext};
use super::expr::{LiteralValue, Parent, RewriteFn, TelExpr, TelExprKind};
use super::parser::BinaryOp;
use super::phase::{TelPhase, TelPhaseRange};
use super::result::{
    override_identifier, OverrideMappingTelInfo, TelQueryResult, UsedTaxonsContainer,
    DIMENSION_SLUGS_TEMPLATE, OVERRIDE_CHANGED_COLUMN, OVERRIDE_NULL_VALUE,
};
use super::types::{TelDataType, TelType};
use crate::error::Result;
use crate::identifier::{escape_like_pattern, LIKE_ESCAPE_CHAR};
use crate::sql::{
    case_when, cast, coalesce, dialect_func, func, lit_bool, lit_int, lit_null, lit_str, sum,
    table_col, template, CastType, DialectFunction, Expr, ExprExt, WindowExt, WindowOrderBy,
};
use crate::taxonomy::{AggregationDefinition, TaxonType};

static TIMEZONE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[/_+\-][A-Za-z0-9]+)*$").unwrap());

const DATE_TRUNC_UNITS: [&str; 4] = ["HOUR", "DAY", "WEEK", "MONTH"];

/// Value shown when an override mapping has no entry for the original value.
const OVERRIDE_UNKNOWN_VALUE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelFunction {
    Coalesce,
    Iff,
    Ifs,
    Concat,
    Merge,
    ConvertTimezone,
    Upper,
    Lower,
    Trim,
    Parse,
    Contains,
    DateTrunc,
    DateHour,
    Date,
    DateWeek,
    DateMonth,
    HourOfDay,
    DayOfWeek,
    WeekOfYear,
    MonthOfYear,
    Year,
    ToBool,
    ToDate,
    ToText,
    ToNumber,
    DateDiff,
    Override,
    Cumulative,
    Overall,
    Now,
}

impl TelFunction {
    pub const ALL: [TelFunction; 30] = [
        TelFunction::Coalesce,
        TelFunction::Iff,
        TelFunction::Ifs,
        TelFunction::Concat,
        TelFunction::Merge,
        TelFunction::ConvertTimezone,
        TelFunction::Upper,
        TelFunction::Lower,
        TelFunction::Trim,
        TelFunction::Parse,
        TelFunction::Contains,
        TelFunction::DateTrunc,
        TelFunction::DateHour,
        TelFunction::Date,
        TelFunction::DateWeek,
        TelFunction::DateMonth,
        TelFunction::HourOfDay,
        TelFunction::DayOfWeek,
        TelFunction::WeekOfYear,
        TelFunction::MonthOfYear,
        TelFunction::Year,
        TelFunction::ToBool,
        TelFunction::ToDate,
        TelFunction::ToText,
        TelFunction::ToNumber,
        TelFunction::DateDiff,
        TelFunction::Override,
        TelFunction::Cumulative,
        TelFunction::Overall,
        TelFunction::Now,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            TelFunction::Coalesce => "coalesce",
            TelFunction::Iff => "iff",
            TelFunction::Ifs => "ifs",
            TelFunction::Concat => "concat",
            TelFunction::Merge => "merge",
            TelFunction::ConvertTimezone => "convert_timezone",
            TelFunction::Upper => "upper",
            TelFunction::Lower => "lower",
            TelFunction::Trim => "trim",
            TelFunction::Parse => "parse",
            TelFunction::Contains => "contains",
            TelFunction::DateTrunc => "date_trunc",
            TelFunction::DateHour => "date_hour",
            TelFunction::Date => "date",
            TelFunction::DateWeek => "date_week",
            TelFunction::DateMonth => "date_month",
            TelFunction::HourOfDay => "hour_of_day",
            TelFunction::DayOfWeek => "day_of_week",
            TelFunction::WeekOfYear => "week_of_year",
            TelFunction::MonthOfYear => "month_of_year",
            TelFunction::Year => "year",
            TelFunction::ToBool => "to_bool",
            TelFunction::ToDate => "to_date",
            TelFunction::ToText => "to_text",
            TelFunction::ToNumber => "to_number",
            TelFunction::DateDiff => "date_diff",
            TelFunction::Override => "override",
            TelFunction::Cumulative => "cumulative",
            TelFunction::Overall => "overall",
            TelFunction::Now => "now",
        }
    }

    fn supported_dialects(self) -> &'static [TelDialectType] {
        match self {
            TelFunction::Merge
            | TelFunction::Override
            | TelFunction::Cumulative
            | TelFunction::Overall => &[TelDialectType::Taxon],
            TelFunction::DateTrunc => &[TelDialectType::Model],
            _ => &[TelDialectType::Taxon, TelDialectType::Model],
        }
    }

    /// Invalid arguments are removed when the call is built.
    fn drops_invalid_args(self) -> bool {
        matches!(self, TelFunction::Coalesce | TelFunction::Merge)
    }

    fn is_condition(self) -> bool {
        matches!(self, TelFunction::Iff | TelFunction::Ifs)
    }

    /// Arguments accepted by the function, for a call with `arg_count` arguments.
    pub fn expected_args(self, arg_count: usize) -> Vec<AcceptedArg> {
        use TypeCheck as T;
        let dimension = TelPhaseRange::at_most(TelPhase::Dimension);
        match self {
            TelFunction::Coalesce => vec![AcceptedArg::compatible("expression")],
            TelFunction::Iff => vec![
                AcceptedArg::typed("condition", T::Boolean),
                AcceptedArg::any("positive_outcome"),
                AcceptedArg::any("negative_outcome").optional(),
            ],
            TelFunction::Ifs => {
                let conditions = condition_count(arg_count);
                let mut args = Vec::with_capacity(conditions * 2 + 1);
                for idx in 1..=conditions {
                    args.push(AcceptedArg::typed(&format!("condition_{idx}"), T::Boolean));
                    args.push(AcceptedArg::any(&format!("positive_outcome_{idx}")));
                }
                args.push(AcceptedArg::any("negative_outcome").optional());
                args
            }
            TelFunction::Concat => vec![AcceptedArg::var_args("expression", T::Any).optional()],
            TelFunction::Merge => vec![AcceptedArg::compatible("expression").optional()],
            TelFunction::ConvertTimezone => vec![
                AcceptedArg::typed("expression", T::Datetime).phases(dimension),
                AcceptedArg::typed("timezone_from", T::String).constant(),
                AcceptedArg::typed("timezone_to", T::String)
                    .constant()
                    .optional(),
            ],
            TelFunction::Upper | TelFunction::Lower | TelFunction::Trim => {
                vec![AcceptedArg::typed("taxon", T::String).phases(dimension)]
            }
            TelFunction::Parse => vec![
                AcceptedArg::typed("expression", T::String).phases(dimension),
                AcceptedArg::typed("delimiter", T::String).constant(),
                AcceptedArg::typed("position", T::Integer).constant(),
            ],
            TelFunction::Contains => vec![
                AcceptedArg::typed("expression", T::String).phases(dimension),
                AcceptedArg::var_args("searched_constant", T::String).constant(),
            ],
            TelFunction::DateTrunc => vec![
                AcceptedArg::typed("expression", T::Datetime).phases(dimension),
                AcceptedArg::typed("unit", T::String).phases(dimension),
            ],
            TelFunction::DateHour
            | TelFunction::Date
            | TelFunction::DateWeek
            | TelFunction::DateMonth
            | TelFunction::HourOfDay
            | TelFunction::DayOfWeek
            | TelFunction::WeekOfYear
            | TelFunction::MonthOfYear
            | TelFunction::Year => {
                vec![AcceptedArg::typed("taxon", T::Datetime).phases(dimension)]
            }
            TelFunction::ToText => vec![AcceptedArg::any("expression")],
            TelFunction::ToBool => {
                vec![AcceptedArg::typed("expression", T::NumberOrStringOrBoolean)]
            }
            TelFunction::ToNumber => vec![
                AcceptedArg::typed("expression", T::NumberOrStringOrBoolean),
                AcceptedArg::typed("precision", T::Integer)
                    .optional()
                    .constant(),
            ],
            TelFunction::ToDate => vec![
                AcceptedArg::typed("expression", T::NumberOrStringOrDate),
                AcceptedArg::typed("format", T::String).optional().constant(),
            ],
            TelFunction::DateDiff => vec![
                AcceptedArg::typed("time_unit", T::String).constant(),
                AcceptedArg::typed("start_time", T::Datetime).phases(dimension),
                AcceptedArg::typed("end_time", T::Datetime).phases(dimension),
            ],
            TelFunction::Override => vec![
                AcceptedArg::typed("original_dimension", T::String).phases(dimension),
                AcceptedArg::typed("override_mapping_slug", T::String).constant(),
                AcceptedArg::typed("include_missing_values", T::Boolean)
                    .constant()
                    .optional(),
            ],
            TelFunction::Cumulative => vec![
                AcceptedArg::typed("metric", T::Number),
                AcceptedArg::typed("time_dimension", T::Datetime).phases(dimension),
            ],
            TelFunction::Overall => vec![AcceptedArg::typed("metric", T::Number)],
            TelFunction::Now => vec![],
        }
    }

    fn phase_spec(self) -> Option<PhaseSpec> {
        use ArgumentExtractor::{First, Slice};
        let spec = match self {
            TelFunction::Coalesce | TelFunction::Cumulative | TelFunction::Overall => {
                PhaseSpec::Fixed(TelPhase::MetricPost)
            }
            TelFunction::Merge | TelFunction::Override => PhaseSpec::Fixed(TelPhase::Dimension),
            TelFunction::Now => PhaseSpec::Fixed(TelPhase::Any),
            TelFunction::ConvertTimezone
            | TelFunction::Upper
            | TelFunction::Lower
            | TelFunction::Trim
            | TelFunction::Parse
            | TelFunction::Contains
            | TelFunction::DateTrunc
            | TelFunction::DateHour
            | TelFunction::Date
            | TelFunction::DateWeek
            | TelFunction::DateMonth
            | TelFunction::HourOfDay
            | TelFunction::DayOfWeek
            | TelFunction::WeekOfYear
            | TelFunction::MonthOfYear
            | TelFunction::Year => PhaseSpec::Maximum(TelPhase::DimensionDataSource, First),
            TelFunction::DateDiff => PhaseSpec::Maximum(TelPhase::DimensionDataSource, Slice(1)),
            TelFunction::ToNumber => PhaseSpec::Maximum(TelPhase::MetricPre, First),
            TelFunction::ToText | TelFunction::ToBool | TelFunction::ToDate => {
                PhaseSpec::Minimum(TelPhase::Dimension, First)
            }
            TelFunction::Iff | TelFunction::Ifs | TelFunction::Concat => return None,
        };
        Some(spec)
    }

    fn return_type_spec(self) -> Option<ReturnTypeSpec> {
        use ArgumentExtractor::{First, Slice};
        let copy = |data_type: Option<TelDataType>, extractor| ReturnTypeSpec::Copy {
            data_type,
            is_constant: Some(false),
            extractor,
        };
        let spec = match self {
            TelFunction::Concat => copy(Some(TelDataType::String), Slice(0)),
            TelFunction::Parse => copy(Some(TelDataType::Any), Slice(0)),
            TelFunction::ConvertTimezone | TelFunction::Cumulative | TelFunction::Overall => {
                copy(None, First)
            }
            TelFunction::DateDiff => copy(None, Slice(1)),
            TelFunction::Contains | TelFunction::ToBool => copy(Some(TelDataType::Boolean), First),
            TelFunction::ToText => copy(Some(TelDataType::String), First),
            TelFunction::DateTrunc
            | TelFunction::DateHour
            | TelFunction::Date
            | TelFunction::DateWeek
            | TelFunction::DateMonth
            | TelFunction::ToDate => copy(Some(TelDataType::Datetime), First),
            TelFunction::HourOfDay
            | TelFunction::DayOfWeek
            | TelFunction::WeekOfYear
            | TelFunction::MonthOfYear
            | TelFunction::Year => copy(Some(TelDataType::Integer), First),
            TelFunction::Override => {
                ReturnTypeSpec::Fixed(TelType::variable(TelDataType::String))
            }
            TelFunction::Now => ReturnTypeSpec::Fixed(TelType::variable(TelDataType::Datetime)),
            _ => return None,
        };
        Some(spec)
    }

    fn invalid_value_spec(self) -> Option<InvalidValueSpec> {
        match self {
            TelFunction::Coalesce | TelFunction::Merge => Some(InvalidValueSpec::NoArgs),
            TelFunction::Contains => Some(InvalidValueSpec::Some(ArgumentExtractor::First)),
            _ => None,
        }
    }
}

impl fmt::Display for TelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type predicate of an accepted argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCheck {
    Any,
    String,
    Number,
    Integer,
    Date,
    Datetime,
    Boolean,
    NumberOrStringOrBoolean,
    NumberOrStringOrDate,
}

impl TypeCheck {
    pub fn check(self, tel_type: &TelType) -> bool {
        match self {
            TypeCheck::Any => true,
            TypeCheck::String => tel_type.is_string(),
            TypeCheck::Number => tel_type.is_number(),
            TypeCheck::Integer => tel_type.is_integer(),
            TypeCheck::Date | TypeCheck::Datetime => tel_type.is_datetime(),
            TypeCheck::Boolean => tel_type.is_boolean(),
            TypeCheck::NumberOrStringOrBoolean => {
                tel_type.is_number() || tel_type.is_string() || tel_type.is_boolean()
            }
            TypeCheck::NumberOrStringOrDate => {
                tel_type.is_number() || tel_type.is_string() || tel_type.is_datetime()
            }
        }
    }
}

impl fmt::Display for TypeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TypeCheck::Any => "any",
            TypeCheck::String => "string",
            TypeCheck::Number => "number",
            TypeCheck::Integer => "integer",
            TypeCheck::Date => "date",
            TypeCheck::Datetime => "datetime",
            TypeCheck::Boolean => "boolean",
            TypeCheck::NumberOrStringOrBoolean => "number or string or boolean",
            TypeCheck::NumberOrStringOrDate => "number or string or datetime",
        })
    }
}

/// Selects the arguments a spec looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentExtractor {
    First,
    /// Arguments from the given index on.
    Slice(usize),
}

impl ArgumentExtractor {
    pub fn extract(self, args: &[TelExpr]) -> &[TelExpr] {
        match self {
            ArgumentExtractor::First => &args[..args.len().min(1)],
            ArgumentExtractor::Slice(start) => args.get(start..).unwrap_or(&[]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSpec {
    Fixed(TelPhase),
    /// Latest of the given phase and the phases of the extracted arguments.
    Maximum(TelPhase, ArgumentExtractor),
    /// Earliest of the given phase and the phases of the extracted arguments.
    Minimum(TelPhase, ArgumentExtractor),
}

impl PhaseSpec {
    fn get(self, args: &[TelExpr], ctx: &TelRootContext) -> TelPhase {
        match self {
            PhaseSpec::Fixed(phase) => phase,
            PhaseSpec::Maximum(min, extractor) => extractor
                .extract(args)
                .iter()
                .map(|arg| arg.phase(ctx))
                .fold(min, TelPhase::max),
            PhaseSpec::Minimum(max, extractor) => extractor
                .extract(args)
                .iter()
                .map(|arg| arg.phase(ctx))
                .fold(max, TelPhase::min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnTypeSpec {
    Fixed(TelType),
    /// Common type of the extracted arguments with the data type and/or constness replaced.
    Copy {
        data_type: Option<TelDataType>,
        is_constant: Option<bool>,
        extractor: ArgumentExtractor,
    },
}

impl ReturnTypeSpec {
    fn get(self, args: &[TelExpr], ctx: &TelRootContext) -> TelType {
        match self {
            ReturnTypeSpec::Fixed(tel_type) => tel_type,
            ReturnTypeSpec::Copy {
                data_type,
                is_constant,
                extractor,
            } => {
                let types: Vec<TelType> = extractor
                    .extract(args)
                    .iter()
                    .map(|arg| arg.return_type(ctx))
                    .collect();
                TelType::common_type(&types).with(data_type, is_constant)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidValueSpec {
    /// Invalid only when every extracted argument is invalid.
    Some(ArgumentExtractor),
    /// Invalid when no argument is left.
    NoArgs,
}

impl InvalidValueSpec {
    fn get(self, args: &[TelExpr], ctx: &TelRootContext) -> bool {
        match self {
            InvalidValueSpec::Some(extractor) => extractor
                .extract(args)
                .iter()
                .all(|arg| arg.invalid_value(ctx)),
            InvalidValueSpec::NoArgs => args.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedArgKind {
    Type(TypeCheck),
    AnyType,
    VarArgs(TypeCheck),
    /// Any number of arguments of mutually compatible types.
    CompatibleVarArgs,
}

/// One formal argument of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedArg {
    pub name: String,
    pub kind: AcceptedArgKind,
    pub optional: bool,
    pub must_be_constant: bool,
    pub phase_range: TelPhaseRange,
}

impl AcceptedArg {
    fn new(name: &str, kind: AcceptedArgKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            optional: false,
            must_be_constant: false,
            phase_range: TelPhaseRange::ANY,
        }
    }

    pub fn typed(name: &str, check: TypeCheck) -> Self {
        Self::new(name, AcceptedArgKind::Type(check))
    }

    pub fn any(name: &str) -> Self {
        Self::new(name, AcceptedArgKind::AnyType)
    }

    pub fn var_args(name: &str, check: TypeCheck) -> Self {
        Self::new(name, AcceptedArgKind::VarArgs(check))
    }

    pub fn compatible(name: &str) -> Self {
        Self::new(name, AcceptedArgKind::CompatibleVarArgs)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn constant(mut self) -> Self {
        self.must_be_constant = true;
        self
    }

    pub fn phases(mut self, phase_range: TelPhaseRange) -> Self {
        self.phase_range = phase_range;
        self
    }

    fn extract<'a>(&self, position: usize, args: &'a [TelExpr]) -> &'a [TelExpr] {
        match self.kind {
            AcceptedArgKind::Type(_) | AcceptedArgKind::AnyType => {
                args.get(position..position + 1).unwrap_or(&[])
            }
            AcceptedArgKind::VarArgs(_) | AcceptedArgKind::CompatibleVarArgs => {
                args.get(position..).unwrap_or(&[])
            }
        }
    }

    fn validate(
        &self,
        position: usize,
        fn_name: &str,
        exprs: &[TelExpr],
        location: &Location,
        ctx: &TelRootContext,
        v: &mut ValidationContext,
    ) {
        match self.kind {
            AcceptedArgKind::Type(check) => {
                self.validate_single(position, fn_name, exprs.first(), check, ctx, v)
            }
            AcceptedArgKind::AnyType => match exprs.first() {
                None if self.optional => {}
                None => {
                    v.with_error(
                        format!("Missing required argument in position {position} of function {fn_name}"),
                        location,
                    );
                }
                Some(expr) => self.validate_phase(position, fn_name, expr, ctx, v),
            },
            AcceptedArgKind::VarArgs(check) => {
                if exprs.is_empty() {
                    if !self.optional {
                        v.with_error(format!("{fn_name} requires at least 1 argument"), location);
                    }
                    return;
                }
                for (idx, expr) in exprs.iter().enumerate() {
                    self.validate_single(position + idx, fn_name, Some(expr), check, ctx, v);
                }
            }
            AcceptedArgKind::CompatibleVarArgs => {
                if exprs.is_empty() {
                    if !self.optional {
                        v.with_error(format!("{fn_name} requires at least 1 argument"), location);
                    }
                    return;
                }
                let types: Vec<TelType> = exprs.iter().map(|e| e.return_type(ctx)).collect();
                if !TelType::are_compatible(&types) {
                    v.with_error(
                        format!("Arguments in function {fn_name} must have compatible data types"),
                        location,
                    );
                    for expr in exprs {
                        self.validate_phase(position, fn_name, expr, ctx, v);
                    }
                }
            }
        }
    }

    fn validate_single(
        &self,
        position: usize,
        fn_name: &str,
        expr: Option<&TelExpr>,
        check: TypeCheck,
        ctx: &TelRootContext,
        v: &mut ValidationContext,
    ) {
        let Some(expr) = expr else {
            return;
        };
        let return_type = expr.return_type(ctx);
        if self.must_be_constant && !return_type.is_constant {
            v.with_error(
                format!(
                    "Argument {} in function {fn_name} must be a constant of type: {check}",
                    position + 1
                ),
                &expr.location,
            );
        } else if !check.check(&return_type) {
            v.with_error(
                format!(
                    "Argument {} in function {fn_name} must be of type: {check}",
                    position + 1
                ),
                &expr.location,
            );
        }
        self.validate_phase(position, fn_name, expr, ctx, v);
    }

    fn validate_phase(
        &self,
        position: usize,
        fn_name: &str,
        expr: &TelExpr,
        ctx: &TelRootContext,
        v: &mut ValidationContext,
    ) {
        if !self.phase_range.contains(expr.phase(ctx)) {
            v.with_error(
                format!(
                    "Argument {} in function {fn_name} must have a phase {}",
                    position + 1,
                    self.phase_range
                ),
                &expr.location,
            );
        }
    }
}

/// Checks arity, then every formal argument against the actual ones.
pub fn validate_expected_args(
    name: &str,
    expected: &[AcceptedArg],
    args: &[TelExpr],
    location: &Location,
    ctx: &TelRootContext,
    v: &mut ValidationContext,
) {
    let required: Vec<&str> = expected
        .iter()
        .filter(|a| !a.optional)
        .map(|a| a.name.as_str())
        .collect();
    let optional: Vec<&str> = expected
        .iter()
        .filter(|a| a.optional)
        .map(|a| a.name.as_str())
        .collect();

    if args.len() < required.len() {
        let mut error = format!("{name} requires {}", required.len());
        if !optional.is_empty() {
            error.push_str(&format!(" or {}", expected.len()));
        }
        error.push_str(&format!(" arguments: {}", required.join(", ")));
        if !optional.is_empty() {
            error.push_str(&format!("(optionally also, {})", optional.join(", ")));
        }
        match args.len() {
            0 => error.push_str(", but none were given"),
            1 => error.push_str(", but only one was given"),
            n => error.push_str(&format!(", but {n} were given")),
        }
        v.with_error(error, location);
        return;
    }

    let mut extracted = 0;
    for (position, accepted) in expected.iter().enumerate() {
        let exprs = accepted.extract(position, args);
        extracted += exprs.len();
        if exprs.is_empty() && !accepted.optional {
            v.with_error(
                format!("Missing required argument {position} in function {name}"),
                location,
            );
            continue;
        }
        accepted.validate(position, name, exprs, location, ctx, v);
    }
    if extracted != args.len() {
        v.with_error(
            format!(
                "Function {name} was provided with an incorrect number of arguments {}, instead of expected {extracted}",
                args.len()
            ),
            location,
        );
    }
}

/// Number of conditions of an `iff`/`ifs` call with `arg_count` arguments.
fn condition_count(arg_count: usize) -> usize {
    if has_negative_outcome(arg_count) {
        (arg_count - 1) / 2
    } else {
        arg_count.div_ceil(2)
    }
}

fn has_negative_outcome(arg_count: usize) -> bool {
    arg_count > 2 && arg_count % 2 == 1
}

/// A function applied to arguments.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub function: TelFunction,
    pub args: Vec<TelExpr>,
    /// `merge()` over a request limited to one data source is a no-op.
    pub single_data_source: bool,
}

impl FunctionCall {
    pub fn new(function: TelFunction, args: Vec<TelExpr>, ctx: &TelRootContext) -> Self {
        let args = if function.drops_invalid_args() {
            args.into_iter().filter(|a| !a.invalid_value(ctx)).collect()
        } else {
            args
        };
        let single_data_source = function == TelFunction::Merge
            && ctx
                .allowed_data_sources
                .as_ref()
                .is_some_and(|ds| ds.len() == 1);
        Self {
            function,
            args,
            single_data_source,
        }
    }

    fn with_args(&self, args: Vec<TelExpr>) -> Self {
        Self {
            function: self.function,
            args,
            single_data_source: self.single_data_source,
        }
    }

    fn into_expr(self, location: &Location) -> TelExpr {
        TelExpr::new(TelExprKind::Function(self), location.clone())
    }

    fn plain(function: TelFunction, args: Vec<TelExpr>) -> Self {
        Self {
            function,
            args,
            single_data_source: false,
        }
    }

    // Condition parts: `iff(c1, p1, c2, p2, ..., negative)`.

    fn negative(&self) -> Option<&TelExpr> {
        if has_negative_outcome(self.args.len()) {
            self.args.last()
        } else {
            None
        }
    }

    fn pair_args(&self) -> &[TelExpr] {
        if self.negative().is_some() {
            &self.args[..self.args.len() - 1]
        } else {
            &self.args
        }
    }

    fn conditions(&self) -> impl Iterator<Item = &TelExpr> {
        self.pair_args().iter().step_by(2)
    }

    fn positives(&self) -> impl Iterator<Item = &TelExpr> {
        self.pair_args().iter().skip(1).step_by(2)
    }

    pub fn phase(&self, ctx: &TelRootContext) -> TelPhase {
        match self.function.phase_spec() {
            Some(spec) => spec.get(&self.args, ctx),
            None => TelPhase::max_of(self.args.iter().map(|a| a.phase(ctx))),
        }
    }

    pub fn return_type(&self, ctx: &TelRootContext) -> TelType {
        if self.function.is_condition() {
            let types: Vec<TelType> = self
                .positives()
                .chain(self.negative())
                .map(|a| a.return_type(ctx))
                .collect();
            return TelType::common_type(&types).with(None, Some(false));
        }
        if self.function == TelFunction::ToNumber {
            let data_type = if self.args.len() > 1 {
                TelDataType::Numeric
            } else {
                TelDataType::Integer
            };
            return self
                .args
                .first()
                .map(|a| a.return_type(ctx))
                .unwrap_or(TelType::variable(TelDataType::Unknown))
                .with_data_type(data_type);
        }
        match self.function.return_type_spec() {
            Some(spec) => spec.get(&self.args, ctx),
            None => {
                let types: Vec<TelType> = self.args.iter().map(|a| a.return_type(ctx)).collect();
                TelType::common_type(&types).with(None, Some(false))
            }
        }
    }

    pub fn invalid_value(&self, ctx: &TelRootContext) -> bool {
        if self.function.is_condition() {
            if self.negative().is_some_and(|n| !n.invalid_value(ctx)) {
                return false;
            }
            return !self
                .conditions()
                .zip(self.positives())
                .any(|(c, p)| !c.invalid_value(ctx) && !p.invalid_value(ctx));
        }
        match self.function.invalid_value_spec() {
            Some(spec) => spec.get(&self.args, ctx),
            None => self.args.iter().any(|a| a.invalid_value(ctx)),
        }
    }

    pub fn used_taxons(&self, ctx: &TelRootContext) -> UsedTaxonsContainer {
        let mut used = UsedTaxonsContainer::default();
        for arg in &self.args {
            used.update_from(arg.used_taxons(ctx));
        }
        used
    }

    pub fn return_data_sources(&self, ctx: &TelRootContext) -> BTreeSet<Option<String>> {
        if self.function == TelFunction::Merge {
            return BTreeSet::from([None]);
        }
        self.args
            .iter()
            .flat_map(|a| a.return_data_sources(ctx))
            .collect()
    }

    pub fn template_slugs(&self, ctx: &TelRootContext) -> BTreeSet<String> {
        self.args
            .iter()
            .flat_map(|a| a.template_slugs(ctx))
            .collect()
    }

    pub fn aggregation_definition(&self, ctx: &TelRootContext) -> Option<AggregationDefinition> {
        let common = |args: Vec<&TelExpr>, use_fallback: bool, taxon_type: TaxonType| {
            let definitions: Vec<Option<AggregationDefinition>> =
                args.iter().map(|a| a.aggregation_definition(ctx)).collect();
            AggregationDefinition::common_defined_definition(
                definitions.iter().map(Option::as_ref),
                use_fallback,
                taxon_type,
            )
        };
        match self.function {
            TelFunction::Iff => common(self.args.iter().skip(1).collect(), true, ctx.taxon_type),
            TelFunction::Ifs => common(
                self.args.iter().skip(1).step_by(2).collect(),
                true,
                ctx.taxon_type,
            ),
            TelFunction::Parse | TelFunction::ToText | TelFunction::ToBool | TelFunction::ToDate => {
                Some(AggregationDefinition::group_by())
            }
            TelFunction::ToNumber => Some(AggregationDefinition::sum()),
            TelFunction::Cumulative | TelFunction::Overall => self
                .args
                .first()
                .and_then(|metric| metric.aggregation_definition(ctx)),
            _ => common(self.args.iter().collect(), false, TaxonType::Dimension),
        }
    }

    pub fn validate(&self, ctx: &TelRootContext, v: &mut ValidationContext, location: &Location) {
        let name = self.function.name();
        match self.function {
            TelFunction::Concat => {
                if self.return_data_sources(ctx).len() > 1 {
                    v.with_error(
                        "concat accepts only taxons from same data source or after merge() is applied",
                        location,
                    );
                }
            }
            TelFunction::Merge => self.validate_merge_data_sources(ctx, v, location),
            TelFunction::ConvertTimezone => {
                for (idx, timezone) in self.args.iter().skip(1).enumerate() {
                    let valid = timezone
                        .literal_value(ctx)
                        .as_ref()
                        .and_then(LiteralValue::as_str)
                        .is_some_and(|tz| TIMEZONE_NAME.is_match(tz));
                    if !valid {
                        v.with_error(
                            format!(
                                "Argument {} in function convert_timezone is not a valid timezone name",
                                idx + 2
                            ),
                            &timezone.location,
                        );
                    }
                }
            }
            TelFunction::DateTrunc => {
                let unit = self.args.get(1).and_then(|u| u.literal_value(ctx));
                let supported = unit
                    .as_ref()
                    .and_then(LiteralValue::as_str)
                    .is_some_and(|u| DATE_TRUNC_UNITS.contains(&u));
                if !supported {
                    let unit = unit.map_or_else(|| "None".to_string(), |u| u.to_string());
                    v.with_error(
                        format!(
                            "Function {name} does not support time unit \"{unit}\". Supported values are: {}",
                            DATE_TRUNC_UNITS.join(", ")
                        ),
                        location,
                    );
                }
            }
            TelFunction::ToDate => {
                if let Some(expression) = self.args.first() {
                    let is_number = expression.return_type(ctx).is_number();
                    match self.args.get(1) {
                        None if !is_number => {
                            v.with_error(
                                format!("Argument 2 in function {name} is required, if the first argument is not a number"),
                                &expression.location,
                            );
                            return;
                        }
                        Some(format) if is_number => {
                            v.with_error(
                                format!("Argument 2 in function {name} is allowed only if the first argument is not a number"),
                                &format.location,
                            );
                            return;
                        }
                        _ => {}
                    }
                }
            }
            TelFunction::Override => {
                if let Some(include) = self.args.get(2) {
                    if !matches!(include.kind, TelExprKind::Boolean(_)) {
                        v.with_error(
                            format!("Argument 3 in function {name} must be a boolean constant"),
                            &include.location,
                        );
                    }
                }
            }
            _ => {}
        }

        let expected = self.function.expected_args(self.args.len());
        validate_expected_args(name, &expected, &self.args, location, ctx, v);

        if self.function.is_condition() {
            self.validate_condition(ctx, v, location);
        }

        let dialect = ctx.dialect_type();
        if !self.function.supported_dialects().contains(&dialect) {
            v.with_error(
                format!("Dialect {dialect} is not supported by function {name}"),
                location,
            );
            return;
        }
        for arg in &self.args {
            arg.validate(ctx, v);
        }

        if self.function == TelFunction::DateDiff && !v.has_errors() {
            let sources: BTreeSet<String> = self
                .return_data_sources(ctx)
                .into_iter()
                .flatten()
                .collect();
            if sources.len() > 1 {
                v.with_error(
                    "date_diff accepts only taxons from the same data source or after merge() is applied",
                    location,
                );
            }
        }
    }

    fn validate_merge_data_sources(
        &self,
        ctx: &TelRootContext,
        v: &mut ValidationContext,
        location: &Location,
    ) {
        let mut counts: Vec<(Option<String>, usize)> = vec![];
        for source in self.args.iter().flat_map(|a| a.return_data_sources(ctx)) {
            match counts.iter_mut().find(|(ds, _)| *ds == source) {
                Some((_, count)) => *count += 1,
                None => counts.push((source, 1)),
            }
        }
        let duplicates: Vec<&str> = counts
            .iter()
            .filter(|(_, count)| *count > 1)
            .map(|(ds, _)| ds.as_deref().unwrap_or("global"))
            .collect();
        if !duplicates.is_empty() {
            v.with_error(
                format!(
                    "merge() accepts only one taxon per distinct data source, but more taxons were provided for following data sources: {}",
                    duplicates.join(", ")
                ),
                location,
            );
        }
    }

    fn validate_condition(&self, ctx: &TelRootContext, v: &mut ValidationContext, location: &Location) {
        let name = self.function.name();
        let condition_phases: Vec<TelPhase> = self
            .conditions()
            .filter(|a| !a.invalid_value(ctx))
            .map(|a| a.phase(ctx))
            .collect();
        let outcome_phases: Vec<TelPhase> = self
            .positives()
            .chain(self.negative())
            .filter(|a| !a.invalid_value(ctx))
            .map(|a| a.phase(ctx))
            .collect();

        if outcome_phases.iter().any(|p| p.is_dimension())
            && outcome_phases.iter().any(|p| p.is_metric())
        {
            v.with_error(
                format!("{name} cannot combine dimension and metric outcomes"),
                location,
            );
        }
        if let Some(max_outcome) = outcome_phases.iter().max().copied() {
            if condition_phases.iter().any(|p| p.is_metric()) && max_outcome.is_dimension() {
                v.with_error(
                    format!("Condition arguments in function {name} must be dimension taxons when the outcome is dimension"),
                    location,
                );
            }
            if condition_phases.iter().any(|p| p.is_dimension())
                && max_outcome == TelPhase::MetricPost
            {
                v.with_error(
                    format!("Condition arguments in function {name} must be metric taxons when the outcome is post-aggregation metric"),
                    location,
                );
            }
        }
        if self.return_type(ctx).data_type == TelDataType::Unknown {
            v.with_error(
                format!("Outcome arguments in function {name} must have compatible data types"),
                location,
            );
        }
    }

    pub fn result(&self, ctx: &TelRootContext) -> Result<TelQueryResult> {
        let results = self
            .args
            .iter()
            .map(|a| a.result(ctx))
            .collect::<Result<Vec<_>>>()?;
        let sqls = || results.iter().map(|r| r.sql.clone()).collect::<Vec<_>>();
        let templates = || {
            results
                .iter()
                .map(|r| r.template_or_sql().clone())
                .collect::<Vec<_>>()
        };
        let merged = |sql: Expr, template: Expr| {
            TelQueryResult::merge(sql, Some(template), results.iter().map(Some))
        };
        let first = || self.first_result(&results);

        let result = match self.function {
            TelFunction::Iff | TelFunction::Ifs => self.condition_result(ctx, &results),
            TelFunction::Coalesce => merged(coalesce(sqls()), coalesce(templates())),
            TelFunction::Concat => merged(func("concat", sqls()), func("concat", templates())),
            TelFunction::Merge => match results.as_slice() {
                [single] => merged(single.sql.clone(), single.template_or_sql().clone()),
                _ => merged(coalesce(sqls()), coalesce(templates())),
            },
            TelFunction::ConvertTimezone => {
                let sql = dialect_func(DialectFunction::ConvertTimezone, sqls());
                let template = dialect_func(DialectFunction::ConvertTimezone, templates());
                first()?.update(sql, Some(template))
            }
            TelFunction::Upper | TelFunction::Lower | TelFunction::Trim => {
                let name = self.function.name();
                let dt = first()?;
                let (sql, template) = dt.map_both(|e| func(name, vec![e]));
                dt.update(sql, Some(template))
            }
            TelFunction::Parse => merged(
                dialect_func(DialectFunction::SplitPart, sqls()),
                dialect_func(DialectFunction::SplitPart, templates()),
            ),
            TelFunction::Contains => {
                let constants: Vec<String> = self
                    .args
                    .iter()
                    .skip(1)
                    .filter_map(|a| a.literal_value(ctx))
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                let expression = first()?;
                let (sql, template) = expression.map_both(|e| contains_sql(e, &constants));
                expression.update(sql, Some(template))
            }
            TelFunction::DateTrunc => {
                let unit = self
                    .args
                    .get(1)
                    .and_then(|u| u.literal_value(ctx))
                    .map(|u| u.to_string())
                    .unwrap_or_default();
                let expression = first()?;
                let (sql, template) = expression
                    .map_both(|e| dialect_func(DialectFunction::DateTrunc, vec![lit_str(&unit), e]));
                expression.update(sql, Some(template))
            }
            TelFunction::DateHour
            | TelFunction::Date
            | TelFunction::DateWeek
            | TelFunction::DateMonth => {
                let unit = match self.function {
                    TelFunction::DateHour => "HOUR",
                    TelFunction::Date => "DAY",
                    TelFunction::DateWeek => "WEEK",
                    _ => "MONTH",
                };
                let expression = first()?;
                let (sql, template) = expression
                    .map_both(|e| dialect_func(DialectFunction::DateTrunc, vec![lit_str(unit), e]));
                expression.update(sql, Some(template))
            }
            TelFunction::HourOfDay
            | TelFunction::DayOfWeek
            | TelFunction::WeekOfYear
            | TelFunction::MonthOfYear
            | TelFunction::Year => {
                let field = match self.function {
                    TelFunction::HourOfDay => "HOUR",
                    TelFunction::DayOfWeek => "DOW",
                    TelFunction::WeekOfYear => "WEEK",
                    TelFunction::MonthOfYear => "MONTH",
                    _ => "YEAR",
                };
                let expression = first()?;
                let (sql, template) = expression.map_both(|e| Expr::Extract {
                    field: field.to_string(),
                    expr: Box::new(e),
                });
                expression.update(sql, Some(template))
            }
            TelFunction::ToText => {
                let expression = first()?;
                let (sql, template) = expression.map_both(|e| cast(e, CastType::Text));
                expression.update(sql, Some(template))
            }
            TelFunction::ToBool => {
                let expression = first()?;
                if self.args[0].return_type(ctx).is_boolean() {
                    expression
                } else {
                    let (sql, template) = expression.map_both(|e| cast(e, CastType::Boolean));
                    expression.update(sql, Some(template))
                }
            }
            TelFunction::ToNumber => {
                let precision = self
                    .args
                    .get(1)
                    .and_then(|p| p.literal_value(ctx))
                    .and_then(|p| p.as_int())
                    .filter(|p| *p != 0);
                let ty = match precision {
                    Some(scale) => CastType::Decimal {
                        precision: 16,
                        scale: u32::try_from(scale).unwrap_or(0),
                    },
                    None => CastType::Numeric { precision: 16 },
                };
                let expression = first()?;
                let (sql, template) = expression.map_both(|e| cast(e, ty.clone()));
                expression.update(sql, Some(template))
            }
            TelFunction::ToDate => {
                let expression = first()?;
                let format = results.get(1);
                let build = |e: Expr, format: Option<Expr>| {
                    let mut args = vec![e];
                    args.extend(format);
                    dialect_func(DialectFunction::ToDate, args)
                };
                let sql = build(expression.sql.clone(), format.map(|f| f.sql.clone()));
                let template = build(
                    expression.template_or_sql().clone(),
                    format.map(|f| f.template_or_sql().clone()),
                );
                expression.update(sql, Some(template))
            }
            TelFunction::DateDiff => self.date_diff_result(ctx, &results),
            TelFunction::Override => self.override_result(ctx, first()?),
            TelFunction::Cumulative => self.cumulative_result(ctx, &results),
            TelFunction::Overall => {
                let metric = first()?;
                let sql = sum(metric.sql.clone()).over().build();
                let template = sum(metric.template_or_sql().clone()).over().build();
                TelQueryResult::merge(sql, Some(template), [Some(&metric)])
            }
            TelFunction::Now => {
                TelQueryResult::new(func("now", vec![])).with_template(func("now", vec![]))
            }
        };
        Ok(result)
    }

    fn first_result(&self, results: &[TelQueryResult]) -> Result<TelQueryResult> {
        results.first().cloned().ok_or_else(|| {
            crate::error::HuskyError::internal(format!(
                "Function {} evaluated without arguments",
                self.function
            ))
        })
    }

    fn condition_result(&self, ctx: &TelRootContext, results: &[TelQueryResult]) -> TelQueryResult {
        let phase = self.phase(ctx);
        let missing_outcome = || {
            if phase.is_metric() {
                lit_int(0)
            } else {
                lit_null()
            }
        };
        let has_negative = self.negative().is_some();
        let pair_count = if has_negative {
            results.len() - 1
        } else {
            results.len()
        };
        let valid: Vec<bool> = self.args.iter().map(|a| !a.invalid_value(ctx)).collect();

        let mut sql_pairs = vec![];
        let mut template_pairs = vec![];
        for idx in (0..pair_count.saturating_sub(1)).step_by(2) {
            let (cond, pos) = (&results[idx], &results[idx + 1]);
            let (cond_valid, pos_valid) = (valid[idx], valid[idx + 1]);
            sql_pairs.push((
                if cond_valid { cond.sql.clone() } else { lit_bool(false) },
                if pos_valid { pos.sql.clone() } else { missing_outcome() },
            ));
            template_pairs.push((
                if cond_valid {
                    cond.template_or_sql().clone()
                } else {
                    lit_bool(false)
                },
                if pos_valid {
                    pos.template_or_sql().clone()
                } else {
                    missing_outcome()
                },
            ));
        }
        let negative = has_negative
            .then(|| results.len() - 1)
            .filter(|idx| valid[*idx])
            .map(|idx| &results[idx]);
        let (else_sql, else_template) = match negative {
            Some(n) => (n.sql.clone(), n.template_or_sql().clone()),
            None => (missing_outcome(), missing_outcome()),
        };

        TelQueryResult::merge(
            case_when(sql_pairs, Some(else_sql)),
            Some(case_when(template_pairs, Some(else_template))),
            results
                .iter()
                .zip(&valid)
                .map(|(r, valid)| valid.then_some(r)),
        )
    }

    fn date_diff_result(&self, ctx: &TelRootContext, results: &[TelQueryResult]) -> TelQueryResult {
        let unit = self
            .args
            .first()
            .and_then(|u| u.literal_value(ctx))
            .map(|u| u.to_string())
            .unwrap_or_default();
        let (start, end) = match results {
            [_, start, end, ..] => (start, end),
            _ => return TelQueryResult::new(lit_null()),
        };
        let build = |s: Expr, e: Expr| dialect_func(DialectFunction::TimestampDiff, vec![lit_str(&unit), s, e]);
        TelQueryResult::merge(
            build(start.sql.clone(), end.sql.clone()),
            Some(build(start.template_or_sql().clone(), end.template_or_sql().clone())),
            [Some(start), Some(end)],
        )
    }

    fn override_result(&self, ctx: &TelRootContext, original: TelQueryResult) -> TelQueryResult {
        let include_missing_values = self
            .args
            .get(2)
            .and_then(TelExpr::as_literal)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let mapping_slug = self
            .args
            .get(1)
            .and_then(|s| s.literal_value(ctx))
            .map(|s| s.to_string())
            .unwrap_or_default();
        let column = original.sql.to_string();
        let identifier = override_identifier(&column, &mapping_slug, include_missing_values);
        let override_sql = table_col(&identifier, OVERRIDE_CHANGED_COLUMN);
        let column_sql = if include_missing_values {
            coalesce(vec![override_sql.clone(), lit_str(OVERRIDE_UNKNOWN_VALUE)])
        } else {
            override_sql.clone()
        };
        let sql = case_when(
            vec![(override_sql.eq(lit_str(OVERRIDE_NULL_VALUE)), lit_null())],
            Some(column_sql),
        );
        let info = OverrideMappingTelInfo {
            column,
            original: original.sql.clone(),
            override_mapping_slug: mapping_slug,
            include_missing_values,
        };
        let mut result = original.update(sql.clone(), Some(sql));
        result.override_mappings = BTreeSet::from([info]);
        result
    }

    fn cumulative_result(&self, ctx: &TelRootContext, results: &[TelQueryResult]) -> TelQueryResult {
        let (metric, time) = match results {
            [metric, time, ..] => (metric, time),
            _ => return TelQueryResult::new(lit_null()),
        };
        let order_by = vec![WindowOrderBy::new(time.sql.clone())];
        let no_partition = sum(metric.sql.clone())
            .over()
            .order_by(order_by.clone())
            .rows_to_current()
            .build();
        let partitioned = sum(metric.sql.clone())
            .over()
            .partition_by(vec![template(DIMENSION_SLUGS_TEMPLATE)])
            .order_by(order_by)
            .rows_to_current()
            .build();

        let mut result =
            TelQueryResult::merge(no_partition, Some(partitioned), [Some(metric), Some(time)]);
        let time_column = match &time.sql {
            Expr::Column { column, .. } => column.clone(),
            other => other.to_string(),
        };
        result.exclude_slugs.insert(time_column);
        result
            .exclude_slugs
            .extend(self.args[1].used_taxons(ctx).all_taxons().into_keys());
        result
    }

    pub fn rewrite(&self, ctx: &TelRootContext, cb: RewriteFn<'_>, location: &Location) -> TelExpr {
        let default = || {
            self.with_args(
                self.args
                    .iter()
                    .map(|a| cb(a.rewrite(ctx, cb)))
                    .collect(),
            )
            .into_expr(location)
        };
        let Some(first) = self.args.first() else {
            return default();
        };
        match self.function {
            TelFunction::Coalesce if self.args.len() == 1 => first.rewrite(ctx, cb),
            TelFunction::Merge if self.single_data_source => first.rewrite(ctx, cb),
            TelFunction::ToText if first.return_type(ctx).is_string() => first.rewrite(ctx, cb),
            TelFunction::ToDate if first.return_type(ctx).is_datetime() => first.rewrite(ctx, cb),
            TelFunction::ToBool => {
                let arg_type = first.return_type(ctx);
                if arg_type.is_boolean() {
                    return first.rewrite(ctx, cb);
                }
                if arg_type.data_type == TelDataType::Unknown {
                    return default();
                }
                let tested = if arg_type.is_number() {
                    equals(first.clone(), TelExprKind::Integer(0))
                } else {
                    let lowered =
                        FunctionCall::plain(TelFunction::Lower, vec![first.clone()]).into_expr(&first.location);
                    equals(lowered, TelExprKind::String("false".into()))
                };
                let case = FunctionCall::plain(
                    TelFunction::Iff,
                    vec![
                        tested,
                        first.copy_with(TelExprKind::Boolean(false)),
                        first.copy_with(TelExprKind::Boolean(true)),
                    ],
                )
                .into_expr(location);
                self.with_args(vec![cb(case.rewrite(ctx, cb))])
                    .into_expr(location)
            }
            TelFunction::ToNumber => {
                let precision = self.args.get(1);
                let arg_type = first.return_type(ctx);
                if arg_type.is_number() && precision.is_none() {
                    return first.rewrite(ctx, cb);
                }
                let inner = if arg_type.is_boolean() {
                    FunctionCall::plain(
                        TelFunction::Iff,
                        vec![
                            equals(first.clone(), TelExprKind::Boolean(true)),
                            first.copy_with(TelExprKind::Integer(1)),
                            first.copy_with(TelExprKind::Integer(0)),
                        ],
                    )
                    .into_expr(location)
                } else {
                    first.clone()
                };
                let mut args = vec![cb(inner.rewrite(ctx, cb))];
                args.extend(precision.map(|p| cb(p.rewrite(ctx, cb))));
                self.with_args(args).into_expr(location)
            }
            TelFunction::Cumulative => match self.args.get(1) {
                Some(time) if first.has_non_constant_division(ctx) => {
                    let time = time.rewrite(ctx, cb);
                    let transform = |e: TelExpr| cumulative_transform(e, ctx, cb, &time);
                    cumulative_transform(first.rewrite(ctx, &transform), ctx, cb, &time)
                }
                _ => default(),
            },
            _ => default(),
        }
    }

    pub fn plan(&self, ctx: &TelRootContext, parent: Parent, location: &Location) -> TelExpr {
        let here = Parent::Node(self.phase(ctx));
        let plan_all = || self.args.iter().map(|a| a.plan(ctx, here)).collect::<Vec<_>>();
        let args = match self.function {
            TelFunction::Iff | TelFunction::Ifs => {
                let phase = self.phase(ctx);
                self.args
                    .iter()
                    .map(|arg| {
                        let aggregation = arg.aggregation_definition(ctx);
                        let moved = match phase {
                            TelPhase::Dimension => arg.plan(ctx, here).to_dimension(),
                            TelPhase::MetricPre => {
                                arg.plan(ctx, here).to_aggregation(aggregation, None)
                            }
                            TelPhase::MetricPost => {
                                arg.plan(ctx, here).to_post_aggregation(aggregation, None)
                            }
                            _ => arg.clone(),
                        };
                        moved.plan(ctx, here)
                    })
                    .collect()
            }
            TelFunction::Coalesce => {
                let aggregation = self.aggregation_definition(ctx);
                self.args
                    .iter()
                    .map(|arg| {
                        let planned = arg.plan(ctx, here);
                        if arg.phase(ctx) == TelPhase::MetricPre {
                            planned.to_post_aggregation(aggregation.clone(), None)
                        } else {
                            planned
                        }
                    })
                    .collect()
            }
            TelFunction::Merge => self
                .args
                .iter()
                .map(|arg| arg.plan(ctx, here).to_dimension())
                .collect(),
            TelFunction::Contains => match parent {
                Parent::Node(phase) if phase.is_metric() => {
                    let mut args = plan_all();
                    if let Some(expression) = self.args.first() {
                        args[0] = expression
                            .plan(ctx, here)
                            .to_aggregation(None, None)
                            .plan(ctx, here);
                    }
                    args
                }
                _ => plan_all(),
            },
            TelFunction::DateDiff if self.phase(ctx) == TelPhase::Dimension => self
                .args
                .iter()
                .enumerate()
                .map(|(idx, arg)| {
                    let planned = arg.plan(ctx, here);
                    if idx == 0 {
                        planned
                    } else {
                        planned.to_dimension()
                    }
                })
                .collect(),
            TelFunction::Override => self
                .args
                .iter()
                .enumerate()
                .map(|(idx, arg)| {
                    if idx == 0 {
                        arg.plan(ctx, here).to_dimension()
                    } else {
                        arg.clone()
                    }
                })
                .collect(),
            TelFunction::Cumulative | TelFunction::Overall => {
                let aggregation = self.aggregation_definition(ctx);
                self.args
                    .iter()
                    .enumerate()
                    .map(|(idx, arg)| {
                        if idx == 0 {
                            arg.plan(ctx, here)
                                .to_post_aggregation(aggregation.clone(), None)
                        } else {
                            arg.plan(ctx, here)
                                .to_aggregation(None, None)
                                .plan(ctx, here)
                                .to_post_aggregation(Some(AggregationDefinition::group_by()), None)
                        }
                    })
                    .collect()
            }
            _ => plan_all(),
        };
        self.with_args(args).into_expr(location)
    }
}

/// `left = right` at the location of `left`.
fn equals(left: TelExpr, right: TelExprKind) -> TelExpr {
    let right = left.copy_with(right);
    left.copy_with(TelExprKind::Binary {
        op: BinaryOp::Eq,
        left: Box::new(left.clone()),
        right: Box::new(right),
    })
}

fn contains_sql(expr: Expr, constants: &[String]) -> Expr {
    constants
        .iter()
        .map(|c| {
            expr.clone().like_escape(
                lit_str(&format!("%{}%", escape_like_pattern(c))),
                LIKE_ESCAPE_CHAR,
            )
        })
        .reduce(|acc, clause| acc.or(clause))
        .unwrap_or_else(|| lit_bool(false))
}

/// Applies `cb`, then splits a ratio of two non-constant sides into a ratio of cumulative
/// sums: `cumulative(a / b)` becomes `cumulative(a) / cumulative(b)`.
fn cumulative_transform(
    expr: TelExpr,
    ctx: &TelRootContext,
    cb: RewriteFn<'_>,
    time: &TelExpr,
) -> TelExpr {
    let expr = cb(expr);
    if let TelExprKind::Binary {
        op: BinaryOp::Div,
        left,
        right,
    } = &expr.kind
    {
        if !left.return_type(ctx).is_constant && !right.return_type(ctx).is_constant {
            let nested = |e: TelExpr| cumulative_transform(e, ctx, cb, time);
            let wrap = |side: &TelExpr| {
                let rewritten = side.rewrite(ctx, &nested);
                let location = rewritten.location.clone();
                FunctionCall::plain(TelFunction::Cumulative, vec![rewritten, time.clone()])
                    .into_expr(&location)
            };
            return expr.copy_with(TelExprKind::Binary {
                op: BinaryOp::Div,
                left: Box::new(wrap(left)),
                right: Box::new(wrap(right)),
            });
        }
    }
    expr
}

impl TelExpr {
    /// Whether the tree contains a division where neither side is a constant.
    fn has_non_constant_division(&self, ctx: &TelRootContext) -> bool {
        let here = match &self.kind {
            TelExprKind::Binary {
                op: BinaryOp::Div,
                left,
                right,
            } => !left.return_type(ctx).is_constant && !right.return_type(ctx).is_constant,
            _ => false,
        };
        here || self
            .children()
            .into_iter()
            .any(|c| c.has_non_constant_division(ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::taxonomy::TaxonMap;
    use crate::tel::context::TelDialect;

    fn location() -> Location {
        Location::new(1, 1, Arc::from("fn()"))
    }

    #[test]
    fn test_function_names_round_trip() {
        for function in TelFunction::ALL {
            assert_eq!(TelFunction::from_name(function.name()), Some(function));
        }
        assert_eq!(TelFunction::from_name("sum"), None);
    }

    #[test]
    fn test_ifs_expects_pairs_and_optional_negative() {
        let names: Vec<String> = TelFunction::Ifs
            .expected_args(5)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(
            names,
            [
                "condition_1",
                "positive_outcome_1",
                "condition_2",
                "positive_outcome_2",
                "negative_outcome"
            ]
        );
    }

    #[test]
    fn test_arity_error_lists_required_and_optional_args() {
        let taxons = TaxonMap::new();
        let ctx = TelRootContext::new(TelDialect::Taxon, &taxons);
        let mut v = ValidationContext::new();
        validate_expected_args(
            "iff",
            &TelFunction::Iff.expected_args(0),
            &[],
            &location(),
            &ctx,
            &mut v,
        );
        assert_eq!(v.errors().len(), 1);
        assert!(v.errors()[0].starts_with(
            "iff requires 2 or 3 arguments: condition, positive_outcome(optionally also, negative_outcome), but none were given"
        ));
    }

    #[test]
    fn test_extractors() {
        let one = TelExpr::new(TelExprKind::Integer(1), location());
        let args = vec![one.clone(), one.clone(), one];
        assert_eq!(ArgumentExtractor::First.extract(&args).len(), 1);
        assert_eq!(ArgumentExtractor::Slice(1).extract(&args).len(), 2);
        assert!(ArgumentExtractor::Slice(5).extract(&args).is_empty());
        assert!(ArgumentExtractor::First.extract(&[]).is_empty());
    }

    #[test]
    fn test_condition_parts() {
        assert_eq!(condition_count(2), 1);
        assert_eq!(condition_count(3), 1);
        assert_eq!(condition_count(4), 2);
        assert_eq!(condition_count(5), 2);
        assert!(!has_negative_outcome(2));
        assert!(has_negative_outcome(3));
    }

    #[test]
    fn test_type_check_names() {
        assert_eq!(
            TypeCheck::NumberOrStringOrDate.to_string(),
            "number or string or datetime"
        );
        assert!(TypeCheck::Number.check(&TelType::variable(TelDataType::Integer)));
        assert!(!TypeCheck::Number.check(&TelType::variable(TelDataType::String)));
    }
}
