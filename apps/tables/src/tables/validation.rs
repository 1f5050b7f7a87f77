use std::collections::HashSet;

use crate::tables::registry;
use crate::tables::types::{
    FieldErrors, FieldSpec, NAME_MAX_CHARS, NAME_MIN_CHARS, TITLE_MAX_CHARS, TITLE_MIN_CHARS,
    TableSchema, TableSchemaRequest, push_field_error,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaValidationError {
    #[error("Maximum of {max_fields} fields allowed.")]
    TooManyFields { max_fields: usize },
    #[error("schema payload failed validation")]
    Invalid(FieldErrors),
}

/// Checks a define/replace payload against the schema rules. Nothing here
/// touches a store; a rejected payload never reaches the migrator.
pub fn validate_schema_request(
    request: &TableSchemaRequest,
    max_fields: usize,
) -> Result<TableSchema, SchemaValidationError> {
    if let Some(fields) = request.fields.as_ref() {
        if fields.len() > max_fields {
            return Err(SchemaValidationError::TooManyFields { max_fields });
        }
    }

    let mut errors = FieldErrors::new();

    let name = match request.name.as_deref() {
        Some(name) => {
            check_length(&mut errors, "name", name, NAME_MIN_CHARS, NAME_MAX_CHARS);
            Some(name.to_string())
        }
        None => {
            push_field_error(&mut errors, "name", "This field is required.");
            None
        }
    };

    let mut fields = Vec::new();
    match request.fields.as_ref() {
        None => push_field_error(&mut errors, "fields", "This field is required."),
        Some(inputs) if inputs.is_empty() => {
            push_field_error(&mut errors, "fields", "At least one field is required.");
        }
        Some(inputs) => {
            let mut seen_titles = HashSet::new();
            for (index, input) in inputs.iter().enumerate() {
                let type_key = format!("fields.{index}.type");
                let title_key = format!("fields.{index}.title");

                let field_type = match input.field_type.as_deref() {
                    Some(raw) => match registry::parse_field_type(raw) {
                        Ok(field_type) => Some(field_type),
                        Err(_) => {
                            push_field_error(
                                &mut errors,
                                type_key,
                                format!("\"{raw}\" is not a valid choice."),
                            );
                            None
                        }
                    },
                    None => {
                        push_field_error(&mut errors, type_key, "This field is required.");
                        None
                    }
                };

                let title = match input.title.as_deref() {
                    Some(title) => {
                        let before = errors.len();
                        check_length(
                            &mut errors,
                            &title_key,
                            title,
                            TITLE_MIN_CHARS,
                            TITLE_MAX_CHARS,
                        );
                        if title.chars().any(char::is_control) {
                            push_field_error(
                                &mut errors,
                                &title_key,
                                "Control characters are not allowed.",
                            );
                        }
                        if !seen_titles.insert(title.to_string()) {
                            push_field_error(
                                &mut errors,
                                &title_key,
                                format!("Duplicate field title \"{title}\"."),
                            );
                        }
                        (errors.len() == before).then(|| title.to_string())
                    }
                    None => {
                        push_field_error(&mut errors, title_key, "This field is required.");
                        None
                    }
                };

                if let (Some(field_type), Some(title)) = (field_type, title) {
                    fields.push(FieldSpec { field_type, title });
                }
            }
        }
    }

    match name {
        Some(name) if errors.is_empty() => Ok(TableSchema { name, fields }),
        _ => Err(SchemaValidationError::Invalid(errors)),
    }
}

fn check_length(errors: &mut FieldErrors, key: &str, value: &str, min: usize, max: usize) {
    let length = value.chars().count();
    if length < min {
        push_field_error(
            errors,
            key,
            format!("Ensure this field has at least {min} characters."),
        );
    } else if length > max {
        push_field_error(
            errors,
            key,
            format!("Ensure this field has no more than {max} characters."),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{SchemaValidationError, validate_schema_request};
    use crate::tables::types::{FieldSpec, FieldSpecInput, FieldType, TableSchemaRequest};

    fn valid_request() -> TableSchemaRequest {
        TableSchemaRequest::new(
            "good_name",
            vec![
                FieldSpecInput::new("string", "good_name"),
                FieldSpecInput::new("number", "age"),
                FieldSpecInput::new("boolean", "is_active"),
            ],
        )
    }

    fn field_errors(error: SchemaValidationError) -> crate::tables::types::FieldErrors {
        match error {
            SchemaValidationError::Invalid(errors) => errors,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_valid_schema_and_keeps_field_order() {
        let schema = validate_schema_request(&valid_request(), 10).expect("valid schema");
        assert_eq!(schema.name, "good_name");
        assert_eq!(
            schema.fields,
            vec![
                FieldSpec::new(FieldType::String, "good_name"),
                FieldSpec::new(FieldType::Number, "age"),
                FieldSpec::new(FieldType::Boolean, "is_active"),
            ]
        );
    }

    #[test]
    fn rejects_unknown_field_type() {
        let request =
            TableSchemaRequest::new("good_name", vec![FieldSpecInput::new("invalid", "title")]);
        let errors = field_errors(validate_schema_request(&request, 10).expect_err("invalid"));
        assert_eq!(
            errors.get("fields.0.type"),
            Some(&vec!["\"invalid\" is not a valid choice.".to_string()])
        );
    }

    #[test]
    fn enforces_title_bounds() {
        let long_title = "field_name_too_long".repeat(100);
        let request = TableSchemaRequest::new(
            "good_name",
            vec![
                FieldSpecInput::new("string", "n1"),
                FieldSpecInput::new("string", &long_title),
            ],
        );
        let errors = field_errors(validate_schema_request(&request, 10).expect_err("invalid"));
        assert_eq!(
            errors.get("fields.0.title"),
            Some(&vec!["Ensure this field has at least 3 characters.".to_string()])
        );
        assert_eq!(
            errors.get("fields.1.title"),
            Some(&vec![
                "Ensure this field has no more than 100 characters.".to_string()
            ])
        );
    }

    #[test]
    fn reports_missing_keys() {
        let request = TableSchemaRequest {
            name: None,
            fields: Some(vec![FieldSpecInput {
                field_type: Some("string".to_string()),
                title: None,
            }]),
        };
        let errors = field_errors(validate_schema_request(&request, 10).expect_err("invalid"));
        assert_eq!(
            errors.get("name"),
            Some(&vec!["This field is required.".to_string()])
        );
        assert_eq!(
            errors.get("fields.0.title"),
            Some(&vec!["This field is required.".to_string()])
        );
    }

    #[test]
    fn rejects_duplicate_titles_and_empty_lists() {
        let duplicate = TableSchemaRequest::new(
            "good_name",
            vec![
                FieldSpecInput::new("string", "age"),
                FieldSpecInput::new("number", "age"),
            ],
        );
        let errors = field_errors(validate_schema_request(&duplicate, 10).expect_err("dup"));
        assert!(errors.contains_key("fields.1.title"));
        assert!(!errors.contains_key("fields.0.title"));

        let empty = TableSchemaRequest::new("good_name", Vec::new());
        let errors = field_errors(validate_schema_request(&empty, 10).expect_err("empty"));
        assert!(errors.contains_key("fields"));
    }

    #[test]
    fn rejects_more_fields_than_allowed() {
        let fields = (0..11)
            .map(|index| FieldSpecInput::new("string", &format!("field_{index}")))
            .collect();
        let request = TableSchemaRequest::new("good_name", fields);
        let error = validate_schema_request(&request, 10).expect_err("too many");
        assert_eq!(error, SchemaValidationError::TooManyFields { max_fields: 10 });
        assert_eq!(error.to_string(), "Maximum of 10 fields allowed.");
    }

    #[test]
    fn name_length_counts_characters() {
        let request =
            TableSchemaRequest::new(&"é".repeat(100), vec![FieldSpecInput::new("string", "nm_")]);
        assert!(validate_schema_request(&request, 10).is_ok());
    }
}
