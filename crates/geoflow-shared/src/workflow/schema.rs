//! # Parameter Schemas
//!
//! A small schema-walking validator for submission payloads: field names,
//! kinds, required flags, defaults, numeric bounds, and enumerations.
//! Validation applies defaults and returns the normalized payload that
//! deterministic job ids are derived from.

use serde_json::{Map, Value};

use crate::errors::SubmissionError;

/// Accepted value kinds for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One declared parameter
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<Vec<Value>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            allowed: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Object)
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn bounded(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    #[must_use]
    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn check(&self, value: &Value) -> Result<(), SubmissionError> {
        if !self.kind.matches(value) {
            return Err(SubmissionError::invalid_parameters(
                &self.name,
                format!("expected {}", self.kind.as_str()),
            ));
        }
        if let (Some(bound), Some(n)) = (self.min, value.as_f64()) {
            if n < bound {
                return Err(SubmissionError::invalid_parameters(
                    &self.name,
                    format!("must be >= {bound}"),
                ));
            }
        }
        if let (Some(bound), Some(n)) = (self.max, value.as_f64()) {
            if n > bound {
                return Err(SubmissionError::invalid_parameters(
                    &self.name,
                    format!("must be <= {bound}"),
                ));
            }
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(SubmissionError::invalid_parameters(
                    &self.name,
                    "value is not one of the allowed options",
                ));
            }
        }
        Ok(())
    }
}

/// Declarative description of a workflow's accepted parameters
#[derive(Debug, Clone, Default)]
pub struct ParameterSchema {
    fields: Vec<FieldSpec>,
}

impl ParameterSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Validate a submission payload against the schema.
    ///
    /// Returns the normalized payload: defaults applied, every field
    /// checked against kind, bounds, and enumerations. Fields not
    /// declared in the schema are rejected so typos never silently feed
    /// a workflow.
    pub fn validate(&self, parameters: &Value) -> Result<Value, SubmissionError> {
        let empty = Map::new();
        let supplied = match parameters {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(SubmissionError::invalid_parameters(
                    "parameters",
                    "payload must be a JSON object",
                ))
            }
        };

        for key in supplied.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(SubmissionError::invalid_parameters(
                    key,
                    "field is not declared by this workflow",
                ));
            }
        }

        let mut normalized = Map::new();
        for field in &self.fields {
            match supplied.get(&field.name) {
                Some(value) if !value.is_null() => {
                    field.check(value)?;
                    normalized.insert(field.name.clone(), value.clone());
                }
                _ => {
                    if let Some(default) = &field.default {
                        normalized.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(SubmissionError::invalid_parameters(
                            &field.name,
                            "required field is missing",
                        ));
                    }
                }
            }
        }
        Ok(Value::Object(normalized))
    }

    /// Startup check: duplicate names, defaults that contradict their own
    /// declaration, bounds on non-numeric kinds.
    pub fn ensure_well_formed(&self) -> Result<(), String> {
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(format!("duplicate schema field: {}", field.name));
            }
            if let Some(default) = &field.default {
                if field.check(default).is_err() {
                    return Err(format!(
                        "default for field {} violates its own constraints",
                        field.name
                    ));
                }
            }
            if (field.min.is_some() || field.max.is_some())
                && !matches!(field.kind, FieldKind::Integer | FieldKind::Float)
            {
                return Err(format!(
                    "bounds declared on non-numeric field {}",
                    field.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParameterSchema {
        ParameterSchema::new()
            .field(FieldSpec::string("name").required())
            .field(
                FieldSpec::integer("chunk_count")
                    .with_default(json!(1))
                    .bounded(Some(1.0), Some(100.0)),
            )
            .field(FieldSpec::string("mode").one_of(vec![json!("fast"), json!("thorough")]))
    }

    #[test]
    fn applies_defaults_and_keeps_supplied_values() {
        let normalized = schema()
            .validate(&json!({"name": "Ada", "mode": "fast"}))
            .unwrap();
        assert_eq!(normalized["name"], "Ada");
        assert_eq!(normalized["chunk_count"], 1);
        assert_eq!(normalized["mode"], "fast");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = schema().validate(&json!({"chunk_count": 3})).unwrap_err();
        match err {
            SubmissionError::InvalidParameters { field, .. } => assert_eq!(field, "name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let err = schema()
            .validate(&json!({"name": "Ada", "chunk_count": "three"}))
            .unwrap_err();
        match err {
            SubmissionError::InvalidParameters { field, reason } => {
                assert_eq!(field, "chunk_count");
                assert!(reason.contains("integer"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bounds_are_enforced() {
        let err = schema()
            .validate(&json!({"name": "Ada", "chunk_count": 500}))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
    }

    #[test]
    fn enumerations_are_enforced() {
        let err = schema()
            .validate(&json!({"name": "Ada", "mode": "sloppy"}))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
    }

    #[test]
    fn undeclared_fields_are_rejected() {
        let err = schema()
            .validate(&json!({"name": "Ada", "chunks": 3}))
            .unwrap_err();
        match err {
            SubmissionError::InvalidParameters { field, .. } => assert_eq!(field, "chunks"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn null_payload_is_an_empty_object() {
        let schema = ParameterSchema::new().field(FieldSpec::integer("n").with_default(json!(7)));
        let normalized = schema.validate(&Value::Null).unwrap();
        assert_eq!(normalized, json!({"n": 7}));
    }

    #[test]
    fn well_formedness_catches_bad_defaults() {
        let schema = ParameterSchema::new()
            .field(FieldSpec::integer("n").with_default(json!("seven")));
        assert!(schema.ensure_well_formed().is_err());

        let schema = ParameterSchema::new().field(FieldSpec::string("s").bounded(Some(1.0), None));
        assert!(schema.ensure_well_formed().is_err());

        let schema = ParameterSchema::new()
            .field(FieldSpec::string("s"))
            .field(FieldSpec::integer("s"));
        assert!(schema.ensure_well_formed().is_err());
    }
}
