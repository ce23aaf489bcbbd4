//! TEL data types and type compatibility.

use std::fmt;

use crate::taxonomy::ValidationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelDataType {
    Unknown,
    /// Type of an optional taxon that is out of scope; compatible with everything.
    NoneOptional,
    /// Compatible with any other type.
    Any,
    String,
    Integer,
    Numeric,
    Datetime,
    Boolean,
}

impl TelDataType {
    pub fn name(self) -> &'static str {
        match self {
            TelDataType::Unknown => "unknown",
            TelDataType::NoneOptional => "none_optional",
            TelDataType::Any => "any",
            TelDataType::String => "string",
            TelDataType::Integer => "integer",
            TelDataType::Numeric => "numeric",
            TelDataType::Datetime => "datetime",
            TelDataType::Boolean => "boolean",
        }
    }
}

impl From<ValidationType> for TelDataType {
    fn from(validation_type: ValidationType) -> Self {
        match validation_type {
            ValidationType::Text
            | ValidationType::Enum
            | ValidationType::Url
            | ValidationType::Variant => TelDataType::String,
            ValidationType::Integer => TelDataType::Integer,
            ValidationType::Numeric
            | ValidationType::Percent
            | ValidationType::Money
            | ValidationType::Duration => TelDataType::Numeric,
            ValidationType::Datetime => TelDataType::Datetime,
            ValidationType::Boolean => TelDataType::Boolean,
        }
    }
}

/// Data type plus whether the value is a constant literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TelType {
    pub data_type: TelDataType,
    pub is_constant: bool,
}

impl TelType {
    pub const fn new(data_type: TelDataType, is_constant: bool) -> Self {
        Self {
            data_type,
            is_constant,
        }
    }

    pub const fn constant(data_type: TelDataType) -> Self {
        Self::new(data_type, true)
    }

    pub const fn variable(data_type: TelDataType) -> Self {
        Self::new(data_type, false)
    }

    pub fn from_validation_type(validation_type: ValidationType) -> Self {
        Self::variable(validation_type.into())
    }

    fn is_one_of(&self, accepted: &[TelDataType]) -> bool {
        matches!(self.data_type, TelDataType::Any | TelDataType::NoneOptional)
            || accepted.contains(&self.data_type)
    }

    pub fn is_string(&self) -> bool {
        self.is_one_of(&[TelDataType::String])
    }

    pub fn is_number(&self) -> bool {
        self.is_one_of(&[TelDataType::Integer, TelDataType::Numeric])
    }

    pub fn is_integer(&self) -> bool {
        self.is_one_of(&[TelDataType::Integer])
    }

    pub fn is_datetime(&self) -> bool {
        self.is_one_of(&[TelDataType::Datetime])
    }

    pub fn is_boolean(&self) -> bool {
        self.is_one_of(&[TelDataType::Boolean])
    }

    /// Copy with the data type and/or constant flag replaced.
    pub fn with(&self, data_type: Option<TelDataType>, is_constant: Option<bool>) -> Self {
        Self {
            data_type: data_type.unwrap_or(self.data_type),
            is_constant: is_constant.unwrap_or(self.is_constant),
        }
    }

    pub fn with_data_type(&self, data_type: TelDataType) -> Self {
        self.with(Some(data_type), None)
    }

    /// Common type of several types; [`TelDataType::Unknown`] when they do not mix.
    pub fn common_type(types: &[TelType]) -> TelType {
        if types.is_empty() {
            return TelType::variable(TelDataType::Unknown);
        }
        let only_constants = types.iter().all(|t| t.is_constant);
        let known: Vec<&TelType> = types
            .iter()
            .filter(|t| !matches!(t.data_type, TelDataType::Any | TelDataType::NoneOptional))
            .collect();

        let data_type = if known.is_empty() {
            TelDataType::Any
        } else if known.iter().all(|t| t.data_type == known[0].data_type) {
            known[0].data_type
        } else if known.iter().all(|t| t.is_number()) {
            TelDataType::Numeric
        } else {
            TelDataType::Unknown
        };
        TelType::new(data_type, only_constants)
    }

    pub fn are_compatible(types: &[TelType]) -> bool {
        Self::common_type(types).data_type != TelDataType::Unknown
    }
}

impl fmt::Display for TelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.data_type.name())
    }
}
