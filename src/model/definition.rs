//! Models: physical tables exposing taxons through attribute transformations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::{
    JoinDirection, ModelJoinType, ModelType, ModelVisibility, Relationship, TimeGranularity,
    ValueQuantityType,
};
use crate::error::{HuskyError, Result};
use crate::identifier::{
    data_source_from_slug, prefix_with_data_source, safe_identifier, strip_data_source,
};
use crate::sql::{cast, CastType, Expr, TableRef};
use crate::taxonomy::TaxonMap;
use crate::tel::{
    render_model, ModelDialect, ModelSqlAccessor, TelDialect, TelRootContext,
    MAX_TAXON_REFERENCE_DEPTH,
};

/// Taxon exposed by a model, computed from the model's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAttribute {
    pub taxon: String,
    #[serde(default)]
    pub identifier: bool,
    /// TEL in the model dialect: `"col"` is a column of the model's table.
    pub tel_transformation: String,
    #[serde(default)]
    pub quantity_type: ValueQuantityType,
}

impl ModelAttribute {
    pub fn new(taxon: &str, tel_transformation: &str) -> Self {
        Self {
            taxon: taxon.to_string(),
            identifier: false,
            tel_transformation: tel_transformation.to_string(),
            quantity_type: ValueQuantityType::Scalar,
        }
    }

    /// Attribute reading column `column` as is.
    pub fn column(taxon: &str, column: &str) -> Self {
        Self::new(taxon, &format!("\"{column}\""))
    }

    pub fn as_identifier(mut self) -> Self {
        self.identifier = true;
        self
    }

    pub fn as_array(mut self) -> Self {
        self.quantity_type = ValueQuantityType::Array;
        self
    }
}

/// Join declared on a model, pointing to another model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelJoin {
    pub join_type: ModelJoinType,
    pub relationship: Relationship,
    /// Inferred from `relationship` when missing.
    #[serde(default)]
    pub direction: Option<JoinDirection>,
    pub to_model: String,
    /// Taxons both models are joined on.
    #[serde(default)]
    pub taxons: Vec<String>,
}

impl ModelJoin {
    pub fn new(to_model: &str, relationship: Relationship, join_type: ModelJoinType, taxons: &[&str]) -> Self {
        Self {
            join_type,
            relationship,
            direction: None,
            to_model: to_model.to_string(),
            taxons: taxons.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_direction(mut self, direction: JoinDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Explicit direction, otherwise the one implied by the relationship.
    ///
    /// Many-to-many joins without a direction can be traversed both ways.
    pub fn effective_direction(&self) -> JoinDirection {
        if let Some(direction) = self.direction {
            return direction;
        }
        match self.relationship {
            Relationship::OneToOne | Relationship::ManyToMany => JoinDirection::Both,
            Relationship::ManyToOne => JoinDirection::Outgoing,
            Relationship::OneToMany => JoinDirection::Incoming,
        }
    }
}

/// A physical table (or view) of one virtual data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Keyed by attribute name; lookups go by taxon.
    #[serde(default)]
    pub attributes: BTreeMap<String, ModelAttribute>,
    #[serde(default)]
    pub joins: Vec<ModelJoin>,
    /// Virtual data source of the model; exactly one.
    #[serde(default)]
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub visibility: ModelVisibility,
    pub company_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// `database.schema.table`, each part quoted separately.
    #[serde(default)]
    pub fully_qualified_name_parts: Vec<String>,
    /// Connection the table lives in; defaults to the virtual data source.
    #[serde(default)]
    pub physical_data_source: Option<String>,
}

impl Model {
    /// New available model reading `fully_qualified_name`.
    pub fn new(name: &str, data_source: &str, company_id: &str, fully_qualified_name: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            attributes: BTreeMap::new(),
            joins: vec![],
            data_sources: vec![data_source.to_string()],
            model_type: None,
            visibility: ModelVisibility::Available,
            company_id: company_id.to_string(),
            project_id: None,
            fully_qualified_name_parts: fully_qualified_name.iter().map(|p| p.to_string()).collect(),
            physical_data_source: None,
        }
    }

    pub fn with_attribute(mut self, attribute: ModelAttribute) -> Self {
        self.add_attribute(attribute);
        self
    }

    pub fn with_join(mut self, join: ModelJoin) -> Self {
        self.joins.push(join);
        self
    }

    pub fn with_visibility(mut self, visibility: ModelVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_physical_data_source(mut self, physical_data_source: &str) -> Self {
        self.physical_data_source = Some(physical_data_source.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.chars().count() < 3 {
            return Err(HuskyError::invalid_request(format!(
                "Model name \"{}\" must have at least 3 characters",
                self.name
            )));
        }
        if self.data_sources.len() != 1 {
            return Err(HuskyError::invalid_request(format!(
                "Model \"{}\" must have exactly one data source",
                self.name
            )));
        }
        Ok(())
    }

    pub fn data_source(&self) -> &str {
        self.data_sources.first().map(String::as_str).unwrap_or_default()
    }

    pub fn physical_data_source(&self) -> &str {
        self.physical_data_source
            .as_deref()
            .unwrap_or_else(|| self.data_source())
    }

    pub fn attribute(&self, taxon: &str) -> Option<&ModelAttribute> {
        self.attributes.values().find(|a| a.taxon == taxon)
    }

    pub fn has_taxon(&self, taxon: &str) -> bool {
        self.attribute(taxon).is_some()
    }

    pub fn taxons(&self) -> BTreeSet<String> {
        self.attributes.values().map(|a| a.taxon.clone()).collect()
    }

    /// Adds an attribute keyed by its taxon, replacing an attribute of the same taxon.
    pub fn add_attribute(&mut self, attribute: ModelAttribute) {
        self.attributes.retain(|_, a| a.taxon != attribute.taxon);
        self.attributes.insert(attribute.taxon.clone(), attribute);
    }

    pub fn identifier_attributes(&self) -> impl Iterator<Item = &ModelAttribute> {
        self.attributes.values().filter(|a| a.identifier)
    }

    pub fn number_of_identifiers(&self) -> usize {
        self.identifier_attributes().count()
    }

    /// Hourly when the model has `{ds}|date_hour`, daily when it has `{ds}|date`.
    pub fn time_granularity(&self) -> Option<TimeGranularity> {
        let data_source = self.data_source();
        if self.has_taxon(&prefix_with_data_source(data_source, "date_hour")) {
            Some(TimeGranularity::Hour)
        } else if self.has_taxon(&prefix_with_data_source(data_source, "date")) {
            Some(TimeGranularity::Day)
        } else {
            None
        }
    }

    /// Alias the model's table gets in generated SQL.
    pub fn table_alias(&self) -> String {
        safe_identifier(&self.name)
    }

    pub fn table_ref(&self) -> TableRef {
        let parts = if self.fully_qualified_name_parts.is_empty() {
            vec![self.name.clone()]
        } else {
            self.fully_qualified_name_parts.clone()
        };
        TableRef::qualified(&parts).with_alias(&self.table_alias())
    }

    /// SQL of the attribute exposing `taxon`, optionally casting arrays to text.
    pub fn taxon_sql_accessor(&self, taxon: &str, cast_array: bool) -> Result<Expr> {
        let sql = self.attribute_sql(taxon, 0)?;
        match self.attribute(taxon) {
            Some(attribute) if cast_array && attribute.quantity_type == ValueQuantityType::Array => {
                Ok(cast(sql, CastType::Text))
            }
            _ => Ok(sql),
        }
    }

    fn attribute_sql(&self, taxon: &str, depth: usize) -> Result<Expr> {
        if depth >= MAX_TAXON_REFERENCE_DEPTH {
            return Err(HuskyError::Tel(format!(
                "Reached maximum depth of taxon references ({MAX_TAXON_REFERENCE_DEPTH})."
            )));
        }
        let attribute = self.attribute(taxon).ok_or_else(|| {
            HuskyError::invalid_request(format!(
                "Attribute with taxon {taxon} not found in model {}",
                self.name
            ))
        })?;
        let taxons = TaxonMap::new();
        let dialect = TelDialect::Model(ModelDialect {
            unique_object_name: &self.name,
            virtual_data_source: self.data_source(),
            accessor: self,
            depth,
        });
        let ctx = TelRootContext::new(dialect, &taxons);
        Ok(render_model(&attribute.tel_transformation, &ctx)?.sql())
    }
}

impl ModelSqlAccessor for Model {
    /// References to global taxons come in namespaced with the model's data source.
    fn taxon_sql(&self, slug: &str, depth: usize) -> Result<Expr> {
        if !self.has_taxon(slug) && data_source_from_slug(slug) == Some(self.data_source()) {
            let global = strip_data_source(slug);
            if self.has_taxon(global) {
                return self.attribute_sql(global, depth);
            }
        }
        self.attribute_sql(slug, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Dialect;

    fn ads() -> Model {
        Model::new("fb_ads", "fb", "acme", &["db", "ads", "stats"])
            .with_attribute(ModelAttribute::column("fb|ad_id", "AD_ID").as_identifier())
            .with_attribute(ModelAttribute::column("fb|spend", "SPEND"))
            .with_attribute(ModelAttribute::new("fb|spend_cents", "fb|spend * 100"))
            .with_attribute(ModelAttribute::column("fb|tags", "TAGS").as_array())
            .with_attribute(ModelAttribute::column("fb|date", "DAY"))
    }

    #[test]
    fn test_column_accessor_is_qualified_by_alias() {
        let sql = ads().taxon_sql_accessor("fb|spend", false).unwrap();
        assert_eq!(sql.to_sql(Dialect::Snowflake), "\"fb_ads\".\"SPEND\"");
    }

    #[test]
    fn test_attribute_referencing_other_attribute() {
        let sql = ads().taxon_sql_accessor("fb|spend_cents", false).unwrap();
        assert_eq!(sql.to_sql(Dialect::Snowflake), "\"fb_ads\".\"SPEND\" * 100");
    }

    #[test]
    fn test_array_cast() {
        let model = ads();
        let sql = model.taxon_sql_accessor("fb|tags", true).unwrap();
        assert_eq!(sql.to_sql(Dialect::Snowflake), "CAST(\"fb_ads\".\"TAGS\" AS VARCHAR)");
        let sql = model.taxon_sql_accessor("fb|tags", false).unwrap();
        assert_eq!(sql.to_sql(Dialect::Snowflake), "\"fb_ads\".\"TAGS\"");
    }

    #[test]
    fn test_self_reference_hits_depth_limit() {
        let model = Model::new("loop_model", "fb", "acme", &["t"])
            .with_attribute(ModelAttribute::new("fb|a", "fb|a + 1"));
        let err = model.taxon_sql_accessor("fb|a", false).unwrap_err();
        assert!(err.to_string().contains("maximum depth"), "{err}");
    }

    #[test]
    fn test_reference_to_global_taxon() {
        let model = ads()
            .with_attribute(ModelAttribute::column("campaign_id", "CAMPAIGN"))
            .with_attribute(ModelAttribute::new("fb|campaign_key", "concat(campaign_id, '-')"));
        let sql = model.taxon_sql_accessor("fb|campaign_key", false).unwrap();
        assert!(sql.to_sql(Dialect::Snowflake).contains("\"fb_ads\".\"CAMPAIGN\""));
    }

    #[test]
    fn test_missing_attribute() {
        let err = ads().taxon_sql_accessor("fb|clicks", false).unwrap_err();
        assert!(err.to_string().contains("fb|clicks"), "{err}");
    }

    #[test]
    fn test_time_granularity_and_identifiers() {
        let model = ads();
        assert_eq!(model.time_granularity(), Some(TimeGranularity::Day));
        assert_eq!(model.number_of_identifiers(), 1);

        let hourly = model.with_attribute(ModelAttribute::column("fb|date_hour", "HOUR"));
        assert_eq!(hourly.time_granularity(), Some(TimeGranularity::Hour));
    }

    #[test]
    fn test_join_direction_inference() {
        let join = |rel| ModelJoin::new("b", rel, ModelJoinType::Left, &["fb|ad_id"]);
        assert_eq!(join(Relationship::OneToOne).effective_direction(), JoinDirection::Both);
        assert_eq!(join(Relationship::ManyToOne).effective_direction(), JoinDirection::Outgoing);
        assert_eq!(join(Relationship::OneToMany).effective_direction(), JoinDirection::Incoming);
        assert_eq!(
            join(Relationship::OneToMany)
                .with_direction(JoinDirection::Outgoing)
                .effective_direction(),
            JoinDirection::Outgoing
        );
    }

    #[test]
    fn test_validation() {
        assert!(ads().validate().is_ok());
        let mut model = ads();
        model.data_sources.clear();
        assert!(model.validate().is_err());
        assert!(Model::new("ab", "fb", "acme", &[]).validate().is_err());
    }
}
