//! Override mappings: company-defined value substitution tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{HuskyError, Result};

/// Maximum number of value pairs in one mapping.
pub const MAX_MAPPING_VALUES: usize = 1000;

/// Direct mapping of original values to changed ones. Either side may be NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOverrideMapping")]
pub struct OverrideMapping {
    pub slug: String,
    pub name: String,
    pub definition: Vec<(Option<String>, Option<String>)>,
    pub company_id: String,
}

#[derive(Deserialize)]
struct RawOverrideMapping {
    slug: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    definition: Vec<(Option<String>, Option<String>)>,
    #[serde(default)]
    company_id: String,
}

impl TryFrom<RawOverrideMapping> for OverrideMapping {
    type Error = HuskyError;

    fn try_from(raw: RawOverrideMapping) -> Result<Self> {
        let mapping = OverrideMapping {
            name: raw.name.unwrap_or_else(|| raw.slug.clone()),
            slug: raw.slug,
            definition: raw.definition,
            company_id: raw.company_id,
        };
        mapping.validate()?;
        Ok(mapping)
    }
}

impl OverrideMapping {
    pub fn new(slug: &str, company_id: &str, definition: &[(Option<&str>, Option<&str>)]) -> Self {
        Self {
            slug: slug.to_string(),
            name: slug.to_string(),
            definition: definition
                .iter()
                .map(|(o, c)| (o.map(str::to_string), c.map(str::to_string)))
                .collect(),
            company_id: company_id.to_string(),
        }
    }

    /// At most [`MAX_MAPPING_VALUES`] pairs, every original value used once.
    pub fn validate(&self) -> Result<()> {
        if self.definition.len() > MAX_MAPPING_VALUES {
            return Err(self.invalid(format!(
                "There is {} mappings, but only {MAX_MAPPING_VALUES} mappings are supported.",
                self.definition.len()
            )));
        }
        let mut occurrences: BTreeMap<Option<&str>, usize> = BTreeMap::new();
        for (original, _) in &self.definition {
            *occurrences.entry(original.as_deref()).or_default() += 1;
        }
        let duplicates: Vec<&str> = occurrences
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(original, _)| original.unwrap_or("null"))
            .collect();
        if !duplicates.is_empty() {
            return Err(self.invalid(format!(
                "Following original values are used more than once - {}",
                duplicates.join(", ")
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> HuskyError {
        HuskyError::InvalidOverrideMapping {
            slug: self.slug.clone(),
            reason,
        }
    }
}

/// Source of override mappings.
pub trait OverrideMappingLoader {
    /// Loads the mappings of the company with the given slugs.
    ///
    /// Fails with `OverrideMappingNotFound` when any slug has no mapping.
    fn load_override_mappings(
        &self,
        slugs: &BTreeSet<String>,
        company_id: &str,
    ) -> Result<Vec<OverrideMapping>>;
}

/// In-memory override mappings of any number of companies.
#[derive(Debug, Clone, Default)]
pub struct OverrideMappingStore {
    mappings: Vec<OverrideMapping>,
}

impl OverrideMappingStore {
    pub fn new(mappings: Vec<OverrideMapping>) -> Result<Self> {
        for mapping in &mappings {
            mapping.validate()?;
        }
        Ok(Self { mappings })
    }

    pub fn mappings(&self) -> &[OverrideMapping] {
        &self.mappings
    }
}

impl OverrideMappingLoader for OverrideMappingStore {
    fn load_override_mappings(
        &self,
        slugs: &BTreeSet<String>,
        company_id: &str,
    ) -> Result<Vec<OverrideMapping>> {
        let found: Vec<OverrideMapping> = self
            .mappings
            .iter()
            .filter(|m| m.company_id == company_id && slugs.contains(&m.slug))
            .cloned()
            .collect();
        let missing: BTreeSet<String> = slugs
            .iter()
            .filter(|slug| !found.iter().any(|m| &m.slug == *slug))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(HuskyError::OverrideMappingNotFound { slugs: missing });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_originals_are_rejected() {
        let mapping = OverrideMapping::new(
            "gender",
            "50",
            &[(Some("m"), Some("male")), (Some("m"), Some("man")), (None, Some("unknown"))],
        );
        let err = mapping.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid override mapping \"gender\": Following original values are used more than once - m"
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"slug": "gender", "definition": [[null, "x"], [null, "y"]]}"#;
        let err = serde_json::from_str::<OverrideMapping>(json).unwrap_err();
        assert!(err.to_string().contains("null"), "{err}");

        let json = r#"{"slug": "gender", "company_id": "50", "definition": [["m", "male"], [null, null]]}"#;
        let mapping: OverrideMapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.name, "gender");
        assert_eq!(mapping.definition[1], (None, None));
    }

    #[test]
    fn test_store_reports_missing_slugs() {
        let store = OverrideMappingStore::new(vec![
            OverrideMapping::new("gender", "50", &[(Some("m"), Some("male"))]),
            OverrideMapping::new("country", "51", &[]),
        ])
        .unwrap();
        let slugs = BTreeSet::from(["gender".to_string(), "country".to_string()]);
        match store.load_override_mappings(&slugs, "50") {
            Err(HuskyError::OverrideMappingNotFound { slugs }) => {
                assert_eq!(slugs, BTreeSet::from(["country".to_string()]))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let gender = BTreeSet::from(["gender".to_string()]);
        assert_eq!(store.load_override_mappings(&gender, "50").unwrap().len(), 1);
    }
}
