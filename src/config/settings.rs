//! TOML-based configuration for husky.
//!
//! Supports a config file (husky.toml) with environment variable expansion in string values.
//!
//! Example configuration:
//! ```toml
//! [compiler]
//! dialect = "snowflake"
//! use_fallback_aggregations = true
//! max_override_mappings = 10
//! model_visibility = "available"
//!
//! [output]
//! pretty = false
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::blending::DEFAULT_MAX_OVERRIDE_MAPPINGS;
use crate::model::ModelVisibility;
use crate::sql::Dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub compiler: CompilerSettings,
    pub output: OutputSettings,
}

/// Defaults the compiler runs with.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Output dialect when none is given on the command line.
    pub dialect: Dialect,

    /// Replace `not_set` aggregations of requested taxons with the taxon type's fallback.
    pub use_fallback_aggregations: bool,

    /// Requests using more distinct override mappings fail.
    pub max_override_mappings: usize,

    /// Visibility of scopes the compiler builds itself.
    pub model_visibility: ModelVisibility,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::Snowflake,
            use_fallback_aggregations: true,
            max_override_mappings: DEFAULT_MAX_OVERRIDE_MAPPINGS,
            model_visibility: ModelVisibility::Available,
        }
    }
}

/// CLI output formatting.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Pretty-print JSON output.
    pub pretty: bool,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings, expanding `${VAR}` in every string value first.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let table: toml::Table = toml::from_str(content)?;
        let mut value = toml::Value::Table(table);
        expand_value(&mut value)?;
        let settings: Settings = value.try_into()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `HUSKY_CONFIG`
    /// 2. `./husky.toml`
    /// 3. `~/.config/husky/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("HUSKY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("husky.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("husky").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.compiler.max_override_mappings == 0 {
            return Err(SettingsError::InvalidConfig(
                "compiler.max_override_mappings must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_value(value: &mut toml::Value) -> Result<(), SettingsError> {
    match value {
        toml::Value::String(s) => *s = expand_env_vars(s)?,
        toml::Value::Array(items) => {
            for item in items {
                expand_value(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                expand_value(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        let var_name: String = if chars.peek() == Some(&'{') {
            chars.next();
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // lone $
                result.push('$');
                continue;
            }
            name
        };
        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_braces() {
        env::set_var("HUSKY_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${HUSKY_TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("prefix_${HUSKY_TEST_VAR}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        env::remove_var("HUSKY_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        env::set_var("HUSKY_TEST_VAR2", "world");
        assert_eq!(expand_env_vars("$HUSKY_TEST_VAR2").unwrap(), "world");
        assert_eq!(expand_env_vars("$HUSKY_TEST_VAR2!").unwrap(), "world!");
        assert_eq!(expand_env_vars("costs $ 5").unwrap(), "costs $ 5");
        env::remove_var("HUSKY_TEST_VAR2");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("${NONEXISTENT_VAR_12345}");
        assert!(matches!(result, Err(SettingsError::MissingEnvVar(_))));
    }

    #[test]
    fn test_parse_toml() {
        env::set_var("HUSKY_TEST_DIALECT", "bigquery");
        let settings = Settings::from_toml(
            r#"
[compiler]
dialect = "${HUSKY_TEST_DIALECT}"
use_fallback_aggregations = false
max_override_mappings = 3
model_visibility = "experimental"

[output]
pretty = true
"#,
        )
        .unwrap();
        env::remove_var("HUSKY_TEST_DIALECT");

        assert_eq!(settings.compiler.dialect, Dialect::BigQuery);
        assert!(!settings.compiler.use_fallback_aggregations);
        assert_eq!(settings.compiler.max_override_mappings, 3);
        assert_eq!(settings.compiler.model_visibility, ModelVisibility::Experimental);
        assert!(settings.output.pretty);
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.compiler.dialect, Dialect::Snowflake);
        assert!(settings.compiler.use_fallback_aggregations);
        assert_eq!(settings.compiler.max_override_mappings, 10);
        assert!(!settings.output.pretty);
    }

    #[test]
    fn test_invalid_settings() {
        let err = Settings::from_toml("[compiler]\nmax_override_mappings = 0").unwrap_err();
        assert!(matches!(err, SettingsError::InvalidConfig(_)));

        let err = Settings::from_toml("[compiler]\ndialect = \"oracle\"").unwrap_err();
        assert!(matches!(err, SettingsError::ParseError(_)));

        let err = Settings::from_file("/nonexistent/husky.toml").unwrap_err();
        assert!(matches!(err, SettingsError::FileNotFound(_)));
    }
}
