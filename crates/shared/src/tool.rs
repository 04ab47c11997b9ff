//! Tool types for toolgate

use crate::error::ValidationIssue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A declared tool parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    /// JSON type name (`string`, `number`, `integer`, `boolean`, `object`, `array`, `any`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,
}

impl ParameterSpec {
    pub fn new(param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            param_type: Some(param_type.into()),
            description: Some(description.into()),
            required: false,
        }
    }

    /// Builder: mark as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.param_type.as_deref() {
            None | Some("any") => true,
            Some("string") => value.is_string(),
            Some("number") => value.is_number(),
            Some("integer") => value.is_i64() || value.is_u64(),
            Some("boolean") => value.is_boolean(),
            Some("object") => value.is_object(),
            Some("array") => value.is_array(),
            Some("null") => value.is_null(),
            Some(_) => true,
        }
    }
}

/// Tool definition as submitted for registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name, `[A-Za-z0-9_-]+`
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Declared parameters, keyed by parameter name
    #[serde(default, rename = "parameterSchema", skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: None,
            version: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Builder: set category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Builder: set version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Builder: declare a parameter
    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    /// Check call parameters against the declared parameters.
    ///
    /// Tools without declared parameters accept anything.
    pub fn check_params(&self, params: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.parameters.is_empty() {
            return issues;
        }

        let empty = serde_json::Map::new();
        let object = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                issues.push(ValidationIssue::new("params", "must be an object"));
                return issues;
            }
        };

        for (name, spec) in &self.parameters {
            match object.get(name) {
                None if spec.required => {
                    issues.push(ValidationIssue::new(name.as_str(), "is required"));
                }
                Some(value) if !spec.accepts(value) => {
                    issues.push(ValidationIssue::new(
                        name.as_str(),
                        format!("expected {}", spec.param_type.as_deref().unwrap_or("any")),
                    ));
                }
                _ => {}
            }
        }

        issues
    }
}

/// Lifecycle status of a registered tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Active => "active",
            ToolStatus::Inactive => "inactive",
            ToolStatus::Deprecated => "deprecated",
        };
        f.write_str(s)
    }
}

/// A tool held by the registry, with usage bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    #[serde(flatten)]
    pub definition: ToolDefinition,

    pub registered_at: DateTime<Utc>,

    pub status: ToolStatus,

    pub usage_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    /// Free-form bookkeeping (e.g. `previousVersion`, `updatedAt`)
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RegisteredTool {
    pub fn new(definition: ToolDefinition, registered_at: DateTime<Utc>) -> Self {
        Self {
            definition,
            registered_at,
            status: ToolStatus::Active,
            usage_count: 0,
            last_used_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn is_active(&self) -> bool {
        self.status == ToolStatus::Active
    }
}
