//! TEL, the expression language of taxon calculations and model attributes.
//!
//! - [`lexer`] / [`parser`] - surface syntax (chumsky)
//! - [`expr`] - typed expression tree: validation, rewriting, phase planning, SQL
//! - [`functions`] - the function library
//! - [`types`] / [`phase`] - data types and evaluation phases
//! - [`result`] - formulas produced by evaluation
//! - [`context`] - per-evaluation context and error collection
//! - [`dialect`] - taxon and model dialects, the entry points
//!
//! # Example
//!
//! ```ignore
//! use husky::tel::{render_taxon, TelDialect, TelRootContext};
//!
//! let ctx = TelRootContext::new(TelDialect::Taxon, &taxon_map).with_taxon_slug("cpm");
//! let result = render_taxon("fb|spend / fb|impressions * 1000", &ctx)?;
//! for formula in &result.pre_formulas {
//!     println!("{} = {}", formula.label, formula.formula);
//! }
//! ```

pub mod context;
pub mod dialect;
pub mod expr;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod phase;
pub mod result;
pub mod types;

pub use context::{
    Location, ModelDialect, ModelSqlAccessor, TelDialect, TelDialectType, TelRootContext,
    ValidationContext, MAX_TAXON_REFERENCE_DEPTH,
};
pub use dialect::{render_model, render_taxon, tel_metadata, used_taxon_slugs_shallow, visit};
pub use expr::{TelExpr, TelExprKind};
pub use functions::TelFunction;
pub use parser::{parse, parse_syntax};
pub use phase::{TelPhase, TelPhaseRange};
pub use result::{
    ExprResult, OverrideMappingTelInfo, PostFormula, PreFormula, SqlFormulaTemplate,
    TelQueryResult, UsedTaxonSlugsContainer, UsedTaxonsContainer, OVERRIDE_CHANGED_COLUMN,
    OVERRIDE_NULL_VALUE, OVERRIDE_ORIGINAL_COLUMN,
};
pub use types::{TelDataType, TelType};
