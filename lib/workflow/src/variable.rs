//! Workflow-scoped variables.

use crate::schema::FieldType;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Namespace head for variable references (`<variable.name>`).
pub const VARIABLE_NAMESPACE: &str = "variable";

/// A variable declared on the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    pub name: String,
    /// Declared type: "plain", "string", "number", "boolean", "object", "array".
    #[serde(rename = "type", default = "default_variable_type")]
    pub var_type: String,
    #[serde(default)]
    pub value: JsonValue,
}

fn default_variable_type() -> String {
    "plain".to_string()
}

impl Variable {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            var_type: default_variable_type(),
            value,
        }
    }

    /// The name used in references.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_variable_name(&self.name)
    }

    /// The reference tag for this variable.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{VARIABLE_NAMESPACE}.{}", self.normalized_name())
    }

    /// The value type surfaced to autocomplete.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        variable_field_type(&self.var_type)
    }
}

/// Strips whitespace from a variable name. Case is preserved.
#[must_use]
pub fn normalize_variable_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Maps a declared variable type to a field type. "plain" is text.
#[must_use]
pub fn variable_field_type(var_type: &str) -> FieldType {
    match var_type {
        "plain" => FieldType::String,
        other => FieldType::parse(other),
    }
}
