//! husky CLI - compile blending requests to SQL
//!
//! Usage:
//!   husky compile --request <request.json> --fixtures <fixtures.json> [--dialect <dialect>]
//!   husky check "<tel expression>" [--fixtures <fixtures.json>]
//!   husky taxons --fixtures <fixtures.json>
//!
//! Examples:
//!   husky compile --request spend_by_day.json --fixtures catalog.json --dialect bigquery
//!   husky check "fb|spend / fb|impressions * 1000" --fixtures catalog.json
//!   husky taxons --fixtures catalog.json

use ariadne::{Color, Label, Report, ReportKind, Source};
use clap::{Parser, Subcommand, ValueEnum};
use husky::blending::BlendingDataRequest;
use husky::compile::{compile, Catalog, CompileOptions};
use husky::config::Settings;
use husky::error::{HuskyError, Result};
use husky::sql::Dialect;
use husky::taxonomy::{TaxonMap, TaxonResolver};
use husky::tel::{parse_syntax, render_taxon, TelDialect, TelRootContext};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "husky")]
#[command(about = "husky - compiles taxon requests over a semantic layer to multi-dialect SQL")]
#[command(version)]
struct Cli {
    /// Log at debug level unless HUSKY_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a blending request to SQL
    Compile {
        /// Path to the request JSON
        #[arg(short, long)]
        request: PathBuf,

        /// Path to the catalog JSON (taxons, models, override mappings)
        #[arg(short, long)]
        fixtures: PathBuf,

        /// SQL dialect to generate (defaults to the configured one)
        #[arg(short, long)]
        dialect: Option<DialectArg>,
    },

    /// Validate a TEL expression
    Check {
        /// The expression
        expression: String,

        /// Catalog to resolve taxon references against; syntax only without it
        #[arg(short, long)]
        fixtures: Option<PathBuf>,
    },

    /// List taxons of a catalog with their resolved metadata
    Taxons {
        /// Path to the catalog JSON
        #[arg(short, long)]
        fixtures: PathBuf,
    },
}

#[derive(Clone, ValueEnum)]
enum DialectArg {
    Snowflake,
    Bigquery,
    Postgres,
    Mysql,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Snowflake => Dialect::Snowflake,
            DialectArg::Bigquery => Dialect::BigQuery,
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Mysql => Dialect::MySql,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Compile {
            request,
            fixtures,
            dialect,
        } => cmd_compile(&settings, &request, &fixtures, dialect),
        Commands::Check {
            expression,
            fixtures,
        } => return cmd_check(&expression, fixtures.as_deref()),
        Commands::Taxons { fixtures } => cmd_taxons(&settings, &fixtures),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so SQL on stdout stays pipeable.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("HUSKY_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_compile(
    settings: &Settings,
    request: &Path,
    fixtures: &Path,
    dialect: Option<DialectArg>,
) -> Result<()> {
    let catalog = Catalog::from_path(fixtures)?;
    let request: BlendingDataRequest = serde_json::from_str(&fs::read_to_string(request)?)?;

    let mut options = CompileOptions::from(&settings.compiler);
    if let Some(dialect) = dialect {
        options = options.with_dialect(dialect.into());
    }

    let compiled = compile(&catalog, &request, &options)?;
    println!("{}", compiled.sql);
    Ok(())
}

fn cmd_check(expression: &str, fixtures: Option<&Path>) -> ExitCode {
    if let Err(errors) = parse_syntax(expression) {
        for error in errors {
            let report = Report::build(ReportKind::Error, ("expression", error.span.clone()))
                .with_message(error.message())
                .with_label(
                    Label::new(("expression", error.span.clone()))
                        .with_message("here")
                        .with_color(Color::Red),
                )
                .finish();
            if let Err(e) = report.eprint(("expression", Source::from(expression))) {
                eprintln!("Error: {}", e);
            }
        }
        return ExitCode::FAILURE;
    }

    let Some(fixtures) = fixtures else {
        println!("OK: syntax is valid");
        return ExitCode::SUCCESS;
    };
    match check_against_catalog(expression, fixtures) {
        Ok(phase) => {
            println!("OK: valid, evaluated in phase {}", phase);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn check_against_catalog(expression: &str, fixtures: &Path) -> Result<String> {
    let catalog = Catalog::from_path(fixtures)?;
    let taxon_map: TaxonMap = catalog
        .taxonomy
        .taxons()
        .map(|taxon| (taxon.slug.clone(), taxon.clone()))
        .collect();
    let ctx = TelRootContext::new(TelDialect::Taxon, &taxon_map).with_taxon_slug("check");
    let result = render_taxon(expression, &ctx)?;
    Ok(result.phase.to_string())
}

fn cmd_taxons(settings: &Settings, fixtures: &Path) -> Result<()> {
    let catalog = Catalog::from_path(fixtures)?;
    let mut taxon_map: TaxonMap = catalog
        .taxonomy
        .taxons()
        .map(|taxon| (taxon.slug.clone(), taxon.clone()))
        .collect();
    TaxonResolver::new(&catalog.taxonomy).complete_tel_metadata(
        &mut taxon_map,
        settings.compiler.use_fallback_aggregations,
    )?;

    let taxons: Vec<_> = taxon_map.into_values().collect();
    let json = if settings.output.pretty {
        serde_json::to_string_pretty(&taxons)
    } else {
        serde_json::to_string(&taxons)
    }
    .map_err(HuskyError::from)?;
    println!("{}", json);
    Ok(())
}
