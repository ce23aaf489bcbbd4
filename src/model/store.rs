//! Scoped access to models.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::augment::augment_model;
use super::definition::Model;
use super::types::ModelVisibility;
use crate::error::{HuskyError, Result};
use crate::filter::FilterClause;

fn default_visibility() -> ModelVisibility {
    ModelVisibility::Available
}

/// Who is asking, and which models they may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub company_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_visibility")]
    pub model_visibility: ModelVisibility,
    /// Applied to model rows before any aggregation.
    #[serde(default)]
    pub preaggregation_filters: Option<FilterClause>,
}

impl Scope {
    pub fn new(company_id: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            project_id: None,
            model_visibility: ModelVisibility::Available,
            preaggregation_filters: None,
        }
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_visibility(mut self, visibility: ModelVisibility) -> Self {
        self.model_visibility = visibility;
        self
    }

    pub fn with_preaggregation_filters(mut self, filters: FilterClause) -> Self {
        self.preaggregation_filters = Some(filters);
        self
    }

    /// Company-wide models are visible in every project of the company.
    pub fn can_use(&self, model: &Model) -> bool {
        self.model_visibility.can_see(model.visibility)
            && model.company_id == self.company_id
            && match (&model.project_id, &self.project_id) {
                (None, _) => true,
                (Some(model_project), Some(project)) => model_project == project,
                (Some(_), None) => false,
            }
    }
}

/// Source of models for a request.
pub trait ModelLoader {
    /// Models of `scope` serving all of `data_sources`, or the single model named
    /// `model_name`. With `physical_data_sources`, only models stored in one of them.
    ///
    /// Fails with [`HuskyError::ModelNotFound`] when nothing matches.
    fn load_models(
        &self,
        data_sources: &BTreeSet<String>,
        scope: &Scope,
        model_name: Option<&str>,
        physical_data_sources: Option<&BTreeSet<String>>,
    ) -> Result<Vec<Model>>;
}

/// In-memory models, augmented once when the store is built.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    models: Vec<Model>,
}

impl ModelStore {
    pub fn new(models: Vec<Model>) -> Result<Self> {
        let models = models
            .into_iter()
            .map(|mut model| {
                model.validate()?;
                augment_model(&mut model);
                Ok(model)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { models })
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }
}

impl ModelLoader for ModelStore {
    fn load_models(
        &self,
        data_sources: &BTreeSet<String>,
        scope: &Scope,
        model_name: Option<&str>,
        physical_data_sources: Option<&BTreeSet<String>>,
    ) -> Result<Vec<Model>> {
        let models: Vec<Model> = self
            .models
            .iter()
            .filter(|model| scope.can_use(model))
            .filter(|model| match model_name {
                Some(name) => model.name == name,
                None => data_sources.iter().all(|ds| model.data_sources.contains(ds)),
            })
            .filter(|model| {
                physical_data_sources
                    .is_none_or(|allowed| allowed.contains(model.physical_data_source()))
            })
            .cloned()
            .collect();
        debug!(
            company = %scope.company_id,
            ?data_sources,
            count = models.len(),
            "loaded models"
        );
        if models.is_empty() {
            return Err(HuskyError::ModelNotFound {
                data_sources: data_sources.clone(),
            });
        }
        Ok(models)
    }
}
