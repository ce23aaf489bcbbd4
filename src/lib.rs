//! # husky
//!
//! A semantic-layer query compiler: requests over taxons compile to multi-dialect SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 BlendingDataRequest                      │
//! │   (taxons, subrequests per data source, comparison,      │
//! │    grouping sets, filters, ordering)                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [taxonomy + tel]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Resolved taxons, TEL formulas planned per phase        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [model + graph]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Per data source: join tree over models, source query   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [blending]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Blend → dimension phase → comparison → metric phase    │
//! │   → projection                                           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compile]
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SQL Query                             │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod blending;
pub mod compile;
pub mod config;
pub mod error;
pub mod filter;
pub mod graph;
pub mod identifier;
pub mod model;
pub mod sql;
pub mod taxonomy;
pub mod tel;

pub use compile::{compile, Catalog, CompileOptions, CompileOutput};
pub use error::{HuskyError, Result};
pub use sql::Dialect;
