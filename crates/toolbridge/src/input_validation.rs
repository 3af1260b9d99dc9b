//! Tool argument validation against the tool's `inputSchema`.
//!
//! Checks arguments before a call is forwarded to the worker, so a missing
//! required argument comes back as a precise "invalid params" error instead
//! of a worker-side failure.

use serde_json::Value;

/// A single validation error for one argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Argument name, or the JSON pointer for nested values. Empty for the root.
    pub field: String,
    pub msg: String,
}

impl ValidationError {
    fn missing(field: &str) -> Self {
        Self {
            field: field.to_string(),
            msg: format!("missing required argument '{field}'"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("input schema must be a JSON object")]
    NotAnObject,
    #[error("invalid input schema: {0}")]
    Compile(String),
}

/// Compiled validator for one tool's `inputSchema`.
pub struct InputValidator {
    validator: jsonschema::Validator,
    /// Required argument names, in schema order.
    required: Vec<String>,
}

impl std::fmt::Debug for InputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputValidator")
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl InputValidator {
    /// Compile a validator from a tool's `inputSchema`.
    pub fn from_input_schema(schema: &Value) -> Result<Self, SchemaError> {
        if !schema.is_object() {
            return Err(SchemaError::NotAnObject);
        }

        let required: Vec<String> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let validator = jsonschema::validator_for(schema)
            .map_err(|e| SchemaError::Compile(e.to_string()))?;

        Ok(Self {
            validator,
            required,
        })
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Validate call arguments.
    ///
    /// Missing required arguments are reported first, one entry each, followed
    /// by any other schema violations.
    pub fn validate(&self, arguments: &Value) -> Result<(), Vec<ValidationError>> {
        if self.validator.is_valid(arguments) {
            return Ok(());
        }

        let mut errors: Vec<ValidationError> = match arguments.as_object() {
            Some(obj) => self
                .required
                .iter()
                .filter(|field| !obj.contains_key(field.as_str()))
                .map(|field| ValidationError::missing(field))
                .collect(),
            None => Vec::new(),
        };

        for error in self.validator.iter_errors(arguments) {
            let msg = error.to_string();

            // Already reported above, one per field.
            if msg.contains("is a required property") {
                continue;
            }

            let path = error.instance_path().to_string();
            errors.push(ValidationError {
                field: path.trim_start_matches('/').to_string(),
                msg,
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Render validation errors as the detail of an "invalid params" message.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.msg.starts_with("missing required argument") || e.field.is_empty() {
                e.msg.clone()
            } else {
                format!("'{}': {}", e.field, e.msg)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
