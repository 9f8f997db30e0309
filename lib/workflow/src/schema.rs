//! Output schemas for blocks, tools, and triggers.
//!
//! Catalogs describe outputs in several historical shapes: bare type strings,
//! `{type, description}` objects, JSON-Schema-like objects with `properties`
//! or `items`, and legacy nested maps such as `{response: {type: {content:
//! "string"}}}`. Each shape is recognized once, when the schema is ingested,
//! and stored as an [`OutputShape`]. Flattening walks the tree into dotted
//! paths with a type per path.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::HashSet;
use std::fmt;

/// The type of an output path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Json,
    /// A list of uploaded files.
    Files,
    /// A single uploaded file.
    File,
    Any,
    Other(String),
}

impl FieldType {
    /// Parses a declared type name. Unknown names are kept verbatim.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            "string" => Self::String,
            "number" | "integer" => Self::Number,
            "boolean" => Self::Boolean,
            "object" => Self::Object,
            "array" => Self::Array,
            "json" => Self::Json,
            "files" | "file[]" => Self::Files,
            "file" => Self::File,
            "any" | "" => Self::Any,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Json => "json",
            Self::Files => "files",
            Self::File => "file",
            Self::Any => "any",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata children every `files` output exposes, in display order.
pub const FILE_PROPERTIES: [(&str, FieldType); 7] = [
    ("url", FieldType::String),
    ("name", FieldType::String),
    ("size", FieldType::Number),
    ("type", FieldType::String),
    ("key", FieldType::String),
    ("uploadedAt", FieldType::String),
    ("expiresAt", FieldType::String),
];

/// One node of an output schema.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputShape {
    /// A typed value with no addressable children.
    Leaf {
        field_type: FieldType,
        description: Option<String>,
    },
    /// An object with declared properties.
    Object {
        description: Option<String>,
        properties: OutputSchema,
    },
    /// An array whose items declare properties.
    Array {
        description: Option<String>,
        items: OutputSchema,
    },
    /// Legacy nesting where the children sit directly under the key (or
    /// under a `type` object).
    LegacyNested(OutputSchema),
}

impl OutputShape {
    /// Creates an undocumented leaf.
    #[must_use]
    pub fn leaf(field_type: FieldType) -> Self {
        Self::Leaf {
            field_type,
            description: None,
        }
    }

    /// Recognizes the shape of one schema entry.
    #[must_use]
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::String(name) => Self::leaf(FieldType::parse(name)),
            JsonValue::Object(map) => Self::from_object(map),
            _ => Self::leaf(FieldType::Any),
        }
    }

    fn from_object(map: &JsonMap<String, JsonValue>) -> Self {
        let description = map
            .get("description")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let properties = map.get("properties").and_then(JsonValue::as_object);

        match map.get("type") {
            Some(JsonValue::String(name)) => {
                let field_type = FieldType::parse(name);
                match (&field_type, properties) {
                    (FieldType::Object | FieldType::Json, Some(properties)) => Self::Object {
                        description,
                        properties: OutputSchema::from_map(properties),
                    },
                    (FieldType::Array, _) => {
                        let items = map
                            .get("items")
                            .and_then(|items| items.get("properties"))
                            .and_then(JsonValue::as_object)
                            .map(OutputSchema::from_map)
                            .unwrap_or_default();
                        Self::Array { description, items }
                    }
                    _ => Self::Leaf {
                        field_type,
                        description,
                    },
                }
            }
            Some(JsonValue::Object(nested)) => Self::LegacyNested(OutputSchema::from_map(nested)),
            Some(_) => Self::Leaf {
                field_type: FieldType::Any,
                description,
            },
            None => match properties {
                Some(properties) => Self::Object {
                    description,
                    properties: OutputSchema::from_map(properties),
                },
                None => {
                    let children: JsonMap<String, JsonValue> = map
                        .iter()
                        .filter(|(key, _)| key.as_str() != "description")
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    if children.is_empty() {
                        Self::Leaf {
                            field_type: FieldType::Any,
                            description,
                        }
                    } else {
                        Self::LegacyNested(OutputSchema::from_map(&children))
                    }
                }
            },
        }
    }

    /// The type reported for the node itself.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Leaf { field_type, .. } => field_type.clone(),
            Self::Object { .. } | Self::LegacyNested(_) => FieldType::Object,
            Self::Array { .. } => FieldType::Array,
        }
    }

    fn to_json(&self) -> JsonValue {
        fn with_description(mut value: JsonValue, description: Option<&String>) -> JsonValue {
            if let (Some(description), Some(map)) = (description, value.as_object_mut()) {
                map.insert("description".to_string(), json!(description));
            }
            value
        }

        match self {
            Self::Leaf {
                field_type,
                description: None,
            } => json!(field_type.as_str()),
            Self::Leaf {
                field_type,
                description,
            } => with_description(json!({"type": field_type.as_str()}), description.as_ref()),
            Self::Object {
                description,
                properties,
            } => with_description(
                json!({"type": "object", "properties": properties.to_json()}),
                description.as_ref(),
            ),
            Self::Array { description, items } => with_description(
                json!({"type": "array", "items": {"type": "object", "properties": items.to_json()}}),
                description.as_ref(),
            ),
            Self::LegacyNested(children) => json!({"type": children.to_json()}),
        }
    }
}

/// An ordered set of named outputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub struct OutputSchema {
    fields: Vec<(String, OutputShape)>,
}

impl OutputSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema of flat leaves.
    pub fn from_fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldType)>,
        K: Into<String>,
    {
        let mut schema = Self::new();
        for (name, field_type) in fields {
            schema.insert(name, OutputShape::leaf(field_type));
        }
        schema
    }

    /// Recognizes every entry of a JSON object.
    #[must_use]
    pub fn from_map(map: &JsonMap<String, JsonValue>) -> Self {
        let mut schema = Self::new();
        for (name, value) in map {
            schema.insert(name.clone(), OutputShape::from_json(value));
        }
        schema
    }

    /// Adds or replaces an entry. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, shape: OutputShape) {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => *existing = shape,
            None => self.fields.push((name, shape)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputShape> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, shape)| shape)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputShape)> {
        self.fields.iter().map(|(name, shape)| (name.as_str(), shape))
    }

    /// Flattens the schema into dotted paths, parents before children.
    ///
    /// Object and array nodes are emitted themselves and then recursed into.
    /// `files` leaves are followed by their metadata children. A path is
    /// emitted at most once.
    #[must_use]
    pub fn flatten(&self) -> Vec<OutputPath> {
        let mut paths = Vec::new();
        let mut seen = HashSet::new();
        flatten_into(None, self, &mut paths, &mut seen);
        paths
    }

    fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(name, shape)| (name.clone(), shape.to_json()))
                .collect(),
        )
    }
}

impl From<JsonValue> for OutputSchema {
    fn from(value: JsonValue) -> Self {
        value
            .as_object()
            .map(Self::from_map)
            .unwrap_or_default()
    }
}

impl From<OutputSchema> for JsonValue {
    fn from(schema: OutputSchema) -> Self {
        schema.to_json()
    }
}

/// A flattened output path and its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPath {
    pub path: String,
    pub field_type: FieldType,
}

impl OutputPath {
    #[must_use]
    pub fn new(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
        }
    }
}

fn flatten_into(
    prefix: Option<&str>,
    schema: &OutputSchema,
    paths: &mut Vec<OutputPath>,
    seen: &mut HashSet<String>,
) {
    for (name, shape) in &schema.fields {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        if !seen.insert(path.clone()) {
            continue;
        }
        paths.push(OutputPath::new(path.clone(), shape.field_type()));

        match shape {
            OutputShape::Leaf {
                field_type: FieldType::Files,
                ..
            } => {
                for (property, field_type) in FILE_PROPERTIES {
                    let child = format!("{path}.{property}");
                    if seen.insert(child.clone()) {
                        paths.push(OutputPath::new(child, field_type));
                    }
                }
            }
            OutputShape::Leaf { .. } => {}
            OutputShape::Object { properties, .. } => {
                flatten_into(Some(&path), properties, paths, seen);
            }
            OutputShape::Array { items, .. } => flatten_into(Some(&path), items, paths, seen),
            OutputShape::LegacyNested(children) => {
                flatten_into(Some(&path), children, paths, seen);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(schema: &OutputSchema) -> Vec<(String, String)> {
        schema
            .flatten()
            .into_iter()
            .map(|p| (p.path, p.field_type.to_string()))
            .collect()
    }

    fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(p, t)| ((*p).to_string(), (*t).to_string()))
            .collect()
    }

    #[test]
    fn object_properties_flatten_under_parent() {
        let schema = OutputSchema::from(json!({
            "result": {
                "type": "object",
                "properties": {"a": "string", "b": {"type": "number"}}
            }
        }));
        assert_eq!(
            flat(&schema),
            pairs(&[
                ("result", "object"),
                ("result.a", "string"),
                ("result.b", "number")
            ])
        );
    }

    #[test]
    fn described_leaf_is_not_a_branch() {
        let schema = OutputSchema::from(json!({
            "content": {"type": "string", "description": "Generated text"},
            "model": "string"
        }));
        assert_eq!(
            flat(&schema),
            pairs(&[("content", "string"), ("model", "string")])
        );
        assert!(matches!(
            schema.get("content"),
            Some(OutputShape::Leaf { description: Some(_), .. })
        ));
    }

    #[test]
    fn legacy_nested_type_object() {
        let schema = OutputSchema::from(json!({
            "response": {"type": {"content": "string", "tokens": "any"}}
        }));
        assert_eq!(
            flat(&schema),
            pairs(&[
                ("response", "object"),
                ("response.content", "string"),
                ("response.tokens", "any")
            ])
        );
    }

    #[test]
    fn array_items_flatten_under_array() {
        let schema = OutputSchema::from(json!({
            "rows": {
                "type": "array",
                "items": {"type": "object", "properties": {"id": "number"}}
            },
            "tags": {"type": "array", "items": {"type": "string"}}
        }));
        assert_eq!(
            flat(&schema),
            pairs(&[("rows", "array"), ("rows.id", "number"), ("tags", "array")])
        );
    }

    #[test]
    fn files_leaf_gets_metadata_children() {
        let schema = OutputSchema::from(json!({"attachments": "files"}));
        let paths = flat(&schema);
        assert_eq!(paths[0], ("attachments".to_string(), "files".to_string()));
        assert_eq!(paths.len(), 1 + FILE_PROPERTIES.len());
        assert!(paths.contains(&("attachments.url".to_string(), "string".to_string())));
        assert!(paths.contains(&("attachments.size".to_string(), "number".to_string())));
    }

    #[test]
    fn unknown_shapes_are_any() {
        let schema = OutputSchema::from(json!({"weird": 42, "empty": {}}));
        assert_eq!(flat(&schema), pairs(&[("weird", "any"), ("empty", "any")]));
    }

    #[test]
    fn declared_order_is_preserved() {
        let schema = OutputSchema::from(json!({"zeta": "string", "alpha": "string"}));
        let names: Vec<_> = schema.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn schema_survives_serialization() {
        let original = OutputSchema::from(json!({
            "data": {"type": "object", "properties": {"id": "string"}},
            "files": "files"
        }));
        let json = serde_json::to_value(&original).expect("serialize");
        let parsed: OutputSchema = serde_json::from_value(json).expect("deserialize");
        assert_eq!(flat(&parsed), flat(&original));
    }

    #[test]
    fn field_type_parsing() {
        assert_eq!(FieldType::parse("integer"), FieldType::Number);
        assert_eq!(FieldType::parse("file[]"), FieldType::Files);
        assert_eq!(FieldType::parse(""), FieldType::Any);
        assert_eq!(
            FieldType::parse("custom"),
            FieldType::Other("custom".to_string())
        );
    }
}
