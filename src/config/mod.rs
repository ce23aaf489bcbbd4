//! Configuration module for husky.
//!
//! Compiler defaults and CLI output options, read from `husky.toml`.

mod settings;

pub use settings::{expand_env_vars, CompilerSettings, OutputSettings, Settings, SettingsError};
