//! Attributes every model gets for free.
//!
//! Scope attributes (`company_id`, `project_id`, `data_source`) are constants, so scope
//! filters work on any model. Time attributes are derived from the model's date column.

use tracing::{trace, warn};

use super::definition::{Model, ModelAttribute};
use super::types::TimeGranularity;
use crate::identifier::prefix_with_data_source;

pub const COMPANY_ID: &str = "company_id";
pub const PROJECT_ID: &str = "project_id";
pub const DATA_SOURCE: &str = "data_source";

/// Attributes derived from the time column, as `(taxon name, TEL function)`.
const DERIVED_TIME_ATTRIBUTES: [(&str, &str); 4] = [
    ("month", "date_month"),
    ("week", "date_week"),
    ("month_of_year", "month_of_year"),
    ("week_of_year", "week_of_year"),
];

/// Adds scope and time attributes the model does not define itself.
pub fn augment_model(model: &mut Model) {
    if model.data_sources.len() == 1 {
        let data_source = model.data_source().to_string();
        add_constant(model, DATA_SOURCE, &data_source);
    }
    let company_id = model.company_id.clone();
    add_constant(model, COMPANY_ID, &company_id);
    if let Some(project_id) = model.project_id.clone() {
        add_constant(model, PROJECT_ID, &project_id);
    }

    let data_source = model.data_source().to_string();
    let time_column = match model.time_granularity() {
        Some(TimeGranularity::Hour) => {
            let date_hour = prefix_with_data_source(&data_source, "date_hour");
            add_missing(
                model,
                &prefix_with_data_source(&data_source, "date"),
                format!("to_date({date_hour}, 'YYYY-MM-DD')"),
            );
            add_missing(
                model,
                &prefix_with_data_source(&data_source, "hour_of_day"),
                format!("hour_of_day({date_hour})"),
            );
            date_hour
        }
        Some(TimeGranularity::Day) => prefix_with_data_source(&data_source, "date"),
        None => return,
    };
    for (name, function) in DERIVED_TIME_ATTRIBUTES {
        add_missing(
            model,
            &prefix_with_data_source(&data_source, name),
            format!("{function}({time_column})"),
        );
    }
}

fn add_constant(model: &mut Model, taxon: &str, value: &str) {
    // TEL string literals cannot contain quotes.
    if value.contains('\'') {
        warn!(model = %model.name, taxon, value, "cannot expose value as a constant attribute");
        return;
    }
    add_missing(model, taxon, format!("'{value}'"));
}

fn add_missing(model: &mut Model, taxon: &str, tel: String) {
    if model.has_taxon(taxon) {
        return;
    }
    trace!(model = %model.name, taxon, tel = %tel, "augmenting model attribute");
    model.add_attribute(ModelAttribute::new(taxon, &tel));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Dialect;

    fn render(model: &Model, taxon: &str) -> String {
        model
            .taxon_sql_accessor(taxon, false)
            .unwrap()
            .to_sql(Dialect::Snowflake)
    }

    #[test]
    fn test_scope_constants() {
        let mut model = Model::new("fb_ads", "fb", "acme", &["t"]).with_project("p1");
        augment_model(&mut model);
        assert_eq!(render(&model, COMPANY_ID), "'acme'");
        assert_eq!(render(&model, PROJECT_ID), "'p1'");
        assert_eq!(render(&model, DATA_SOURCE), "'fb'");
    }

    #[test]
    fn test_daily_model_time_attributes() {
        let mut model = Model::new("fb_ads", "fb", "acme", &["t"])
            .with_attribute(ModelAttribute::column("fb|date", "DAY"));
        augment_model(&mut model);
        for taxon in ["fb|month", "fb|week", "fb|month_of_year", "fb|week_of_year"] {
            assert!(model.has_taxon(taxon), "{taxon}");
        }
        assert!(!model.has_taxon("fb|hour_of_day"));
        assert!(render(&model, "fb|month").contains("\"fb_ads\".\"DAY\""));
    }

    #[test]
    fn test_hourly_model_time_attributes() {
        let mut model = Model::new("fb_ads_hourly", "fb", "acme", &["t"])
            .with_attribute(ModelAttribute::column("fb|date_hour", "HOUR"));
        augment_model(&mut model);
        assert!(model.has_taxon("fb|date"));
        assert!(model.has_taxon("fb|hour_of_day"));
        assert!(model.has_taxon("fb|week_of_year"));
        assert_eq!(model.time_granularity(), Some(TimeGranularity::Hour));
    }

    #[test]
    fn test_existing_attributes_are_kept() {
        let mut model = Model::new("fb_ads", "fb", "acme", &["t"])
            .with_attribute(ModelAttribute::column("company_id", "COMPANY"));
        augment_model(&mut model);
        assert_eq!(render(&model, COMPANY_ID), "\"fb_ads\".\"COMPANY\"");
        assert!(!model.has_taxon(PROJECT_ID));
    }
}
