use jsonschema::validator_for;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SchemaValidationError {
    #[error("Schema parse error: {0}")]
    SchemaParse(#[from] serde_json::Error),
    #[error("Schema compile error: {0}")]
    SchemaCompile(String),
    #[error("Instance validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
}

impl SchemaValidationError {
    /// Human-readable messages, one per problem found.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::ValidationFailed(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Validate a JSON instance against a JSON Schema (draft detected from
/// `$schema`, 2020-12 otherwise). Collects every violation.
pub fn validate_value(schema: &Value, instance: &Value) -> Result<(), SchemaValidationError> {
    let validator =
        validator_for(schema).map_err(|e| SchemaValidationError::SchemaCompile(e.to_string()))?;

    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SchemaValidationError::ValidationFailed(errors))
    }
}

/// String form of [`validate_value`], for schemas held as text.
pub fn validate_json(schema_str: &str, instance_str: &str) -> Result<(), SchemaValidationError> {
    let schema_json: Value = serde_json::from_str(schema_str)?;
    let instance_json: Value = serde_json::from_str(instance_str)?;
    validate_value(&schema_json, &instance_json)
}
