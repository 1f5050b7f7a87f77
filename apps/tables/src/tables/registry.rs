//! Closed mapping from logical field types to physical column specs.
//!
//! Adding a logical type means adding a [`FieldType`] variant and one entry
//! to [`REGISTRY`]; the definition builder, migrator and row accessor all
//! resolve through here.

use crate::tables::types::FieldType;

/// Upper bound on stored text, in characters.
pub const STRING_MAX_CHARS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalType {
    VarChar { max_chars: u32 },
    Integer,
    Boolean,
}

impl PhysicalType {
    pub fn sql(self) -> String {
        match self {
            Self::VarChar { max_chars } => format!("VARCHAR({max_chars})"),
            Self::Integer => "INTEGER".to_string(),
            Self::Boolean => "BOOLEAN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalColumnSpec {
    pub physical_type: PhysicalType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown field type: {0}")]
pub struct UnknownFieldType(pub String);

struct RegistryEntry {
    field_type: FieldType,
    spec: PhysicalColumnSpec,
}

// Columns are nullable so that adding one never needs a default for rows
// that already exist. Required-ness is enforced on write by the row accessor.
const REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        field_type: FieldType::String,
        spec: PhysicalColumnSpec {
            physical_type: PhysicalType::VarChar {
                max_chars: STRING_MAX_CHARS,
            },
            nullable: true,
        },
    },
    RegistryEntry {
        field_type: FieldType::Number,
        spec: PhysicalColumnSpec {
            physical_type: PhysicalType::Integer,
            nullable: true,
        },
    },
    RegistryEntry {
        field_type: FieldType::Boolean,
        spec: PhysicalColumnSpec {
            physical_type: PhysicalType::Boolean,
            nullable: true,
        },
    },
];

/// Resolves a logical type name as it appears in a schema payload.
pub fn resolve(type_name: &str) -> Result<PhysicalColumnSpec, UnknownFieldType> {
    parse_field_type(type_name).and_then(column_spec)
}

pub fn parse_field_type(type_name: &str) -> Result<FieldType, UnknownFieldType> {
    REGISTRY
        .iter()
        .find(|entry| entry.field_type.as_str() == type_name)
        .map(|entry| entry.field_type)
        .ok_or_else(|| UnknownFieldType(type_name.to_string()))
}

pub fn column_spec(field_type: FieldType) -> Result<PhysicalColumnSpec, UnknownFieldType> {
    REGISTRY
        .iter()
        .find(|entry| entry.field_type == field_type)
        .map(|entry| entry.spec)
        .ok_or_else(|| UnknownFieldType(field_type.as_str().to_string()))
}

pub fn field_type_names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|entry| entry.field_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::{PhysicalType, STRING_MAX_CHARS, field_type_names, parse_field_type, resolve};
    use crate::tables::types::FieldType;

    #[test]
    fn registry_covers_exactly_the_closed_type_set() {
        let names = field_type_names().collect::<Vec<_>>();
        assert_eq!(names, vec!["string", "number", "boolean"]);
    }

    #[test]
    fn resolve_maps_each_logical_type() {
        let string = resolve("string").expect("string resolves");
        assert_eq!(
            string.physical_type,
            PhysicalType::VarChar {
                max_chars: STRING_MAX_CHARS
            }
        );
        assert_eq!(
            resolve("number").expect("number resolves").physical_type,
            PhysicalType::Integer
        );
        assert_eq!(
            resolve("boolean").expect("boolean resolves").physical_type,
            PhysicalType::Boolean
        );
        assert!(string.nullable);
    }

    #[test]
    fn resolve_rejects_unknown_and_case_variants() {
        assert_eq!(
            resolve("invalid").expect_err("unknown type").0,
            "invalid".to_string()
        );
        assert!(parse_field_type("String").is_err());
        assert_eq!(parse_field_type("number"), Ok(FieldType::Number));
    }

    #[test]
    fn physical_types_render_sql() {
        assert_eq!(PhysicalType::VarChar { max_chars: 100 }.sql(), "VARCHAR(100)");
        assert_eq!(PhysicalType::Integer.sql(), "INTEGER");
        assert_eq!(PhysicalType::Boolean.sql(), "BOOLEAN");
    }
}
