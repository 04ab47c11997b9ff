//! ToolRegistry - Tool definitions, validation and usage tracking
//!
//! The registry holds no security logic; permissions and quotas live in
//! [`crate::AccessController`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use shared::{Clock, RegisteredTool, RegistryConfig, ToolDefinition, ToolStatus, ValidationIssue};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const NAME_PATTERN: &str = r"^[A-Za-z0-9_-]+$";
const EVENT_BUFFER: usize = 64;

/// Signals emitted by the registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered {
        name: String,
        version: Option<String>,
    },
    Updated {
        name: String,
        previous_version: Option<String>,
        version: Option<String>,
    },
    Unregistered {
        name: String,
    },
    ValidationFailed {
        name: String,
        issues: Vec<ValidationIssue>,
    },
    StatusChanged {
        name: String,
        status: ToolStatus,
    },
}

/// Why a registration was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("invalid tool definition: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    Validation(Vec<ValidationIssue>),

    #[error("tool '{name}' is already registered")]
    AlreadyExists { name: String },

    #[error("registry is full ({max} tools)")]
    CapacityReached { max: usize },
}

impl RegistryError {
    /// Issues describing this refusal
    pub fn issues(&self) -> Vec<ValidationIssue> {
        match self {
            RegistryError::Validation(issues) => issues.clone(),
            RegistryError::AlreadyExists { name } => {
                vec![ValidationIssue::new("name", format!("tool '{name}' is already registered"))]
            }
            RegistryError::CapacityReached { max } => {
                vec![ValidationIssue::new("registry", format!("maximum of {max} tools reached"))]
            }
        }
    }
}

/// Successful registration result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Updated { previous_version: Option<String> },
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_tools: usize,
    pub active_tools: usize,
    pub by_category: BTreeMap<String, usize>,
    pub total_usage: u64,
}

/// Store of registered tools
#[derive(Debug)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    config: RegistryConfig,
    events: broadcast::Sender<RegistryEvent>,
    clock: Arc<dyn Clock>,
}

impl ToolRegistry {
    /// Create a new ToolRegistry
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tools: RwLock::new(HashMap::new()),
            config,
            events,
            clock,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Check a definition against every registration rule
    pub fn validate(&self, tool: &ToolDefinition) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if tool.name.is_empty() {
            issues.push(ValidationIssue::new("name", "must not be empty"));
        } else if !name_is_valid(&tool.name) {
            issues.push(ValidationIssue::new(
                "name",
                "may only contain letters, digits, '_' and '-'",
            ));
        }

        if tool.description.trim().is_empty() {
            issues.push(ValidationIssue::new("description", "must not be empty"));
        }

        if let Some(allowed) = &self.config.allowed_categories {
            match &tool.category {
                None => issues.push(ValidationIssue::new(
                    "category",
                    format!("is required (one of: {})", allowed.join(", ")),
                )),
                Some(category) if !allowed.contains(category) => issues.push(ValidationIssue::new(
                    "category",
                    format!("'{}' is not one of: {}", category, allowed.join(", ")),
                )),
                _ => {}
            }
        }

        for (param, spec) in &tool.parameters {
            if spec.param_type.as_deref().map_or(true, |t| t.trim().is_empty()) {
                issues.push(ValidationIssue::new(
                    format!("parameters.{param}.type"),
                    "must be declared",
                ));
            }
            if spec.description.as_deref().map_or(true, |d| d.trim().is_empty()) {
                issues.push(ValidationIssue::new(
                    format!("parameters.{param}.description"),
                    "must be declared",
                ));
            }
        }

        issues
    }

    /// Register a tool, reporting why it was refused.
    ///
    /// With versioning enabled, registering an existing name under a different
    /// version replaces the definition in place and keeps its usage history.
    pub fn try_register(&self, tool: ToolDefinition) -> Result<RegistrationOutcome, RegistryError> {
        let issues = self.validate(&tool);
        if !issues.is_empty() {
            return Err(self.refuse(&tool.name, RegistryError::Validation(issues)));
        }

        let now = self.clock.now();
        let mut tools = self.tools.write();

        if let Some(existing) = tools.get_mut(&tool.name) {
            if !self.config.allow_versioning || existing.definition.version == tool.version {
                let name = tool.name.clone();
                drop(tools);
                return Err(self.refuse(&name, RegistryError::AlreadyExists { name: name.clone() }));
            }

            let previous_version = existing.definition.version.clone();
            record_version_change(existing, previous_version.as_deref(), now);
            existing.definition = tool;

            let event = RegistryEvent::Updated {
                name: existing.definition.name.clone(),
                previous_version: previous_version.clone(),
                version: existing.definition.version.clone(),
            };
            drop(tools);

            info!(tool = ?event, "tool updated");
            let _ = self.events.send(event);
            return Ok(RegistrationOutcome::Updated { previous_version });
        }

        if tools.len() >= self.config.max_tools {
            let name = tool.name.clone();
            drop(tools);
            return Err(self.refuse(&name, RegistryError::CapacityReached { max: self.config.max_tools }));
        }

        let event = RegistryEvent::Registered {
            name: tool.name.clone(),
            version: tool.version.clone(),
        };
        info!(tool = %tool.name, version = ?tool.version, "tool registered");
        tools.insert(tool.name.clone(), RegisteredTool::new(tool, now));
        drop(tools);

        let _ = self.events.send(event);
        Ok(RegistrationOutcome::Registered)
    }

    /// Register a tool; `false` if it was refused
    pub fn register(&self, tool: ToolDefinition) -> bool {
        self.try_register(tool).is_ok()
    }

    /// Remove a tool; `false` if it was not registered
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.write().remove(name).is_some();
        if removed {
            info!(tool = name, "tool unregistered");
            let _ = self.events.send(RegistryEvent::Unregistered {
                name: name.to_string(),
            });
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// All tools, sorted by name
    pub fn list(&self) -> Vec<RegisteredTool> {
        let mut tools: Vec<_> = self.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Case-insensitive match on name, description or category
    pub fn search(&self, query: &str) -> Vec<RegisteredTool> {
        let needle = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|t| {
                let def = &t.definition;
                def.name.to_lowercase().contains(&needle)
                    || def.description.to_lowercase().contains(&needle)
                    || def
                        .category
                        .as_ref()
                        .is_some_and(|c| c.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Record a use of a tool
    pub fn mark_used(&self, name: &str) -> bool {
        let now = self.clock.now();
        match self.tools.write().get_mut(name) {
            Some(tool) => {
                tool.usage_count += 1;
                tool.last_used_at = Some(now);
                debug!(tool = name, usage = tool.usage_count, "tool used");
                true
            }
            None => false,
        }
    }

    /// Change a tool's lifecycle status
    pub fn set_status(&self, name: &str, status: ToolStatus) -> bool {
        let changed = match self.tools.write().get_mut(name) {
            Some(tool) => {
                tool.status = status;
                true
            }
            None => false,
        };
        if changed {
            if status == ToolStatus::Deprecated {
                warn!(tool = name, "tool deprecated");
            }
            let _ = self.events.send(RegistryEvent::StatusChanged {
                name: name.to_string(),
                status,
            });
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let tools = self.tools.read();
        let mut by_category = BTreeMap::new();
        for tool in tools.values() {
            let category = tool
                .definition
                .category
                .clone()
                .unwrap_or_else(|| "uncategorized".to_string());
            *by_category.entry(category).or_insert(0) += 1;
        }

        RegistryStats {
            total_tools: tools.len(),
            active_tools: tools.values().filter(|t| t.is_active()).count(),
            by_category,
            total_usage: tools.values().map(|t| t.usage_count).sum(),
        }
    }

    fn refuse(&self, name: &str, error: RegistryError) -> RegistryError {
        let issues = error.issues();
        warn!(tool = name, %error, "tool registration refused");
        let _ = self.events.send(RegistryEvent::ValidationFailed {
            name: name.to_string(),
            issues,
        });
        error
    }
}

fn name_is_valid(name: &str) -> bool {
    regex::Regex::new(NAME_PATTERN)
        .map(|r| r.is_match(name))
        .unwrap_or(false)
}

fn record_version_change(tool: &mut RegisteredTool, previous: Option<&str>, now: DateTime<Utc>) {
    let previous = serde_json::Value::from(previous);
    let history = tool
        .metadata
        .entry("versionHistory")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let Some(list) = history.as_array_mut() {
        list.push(previous.clone());
    }
    tool.metadata.insert("previousVersion".to_string(), previous);
    tool.metadata
        .insert("updatedAt".to_string(), serde_json::Value::from(now.to_rfc3339()));
}
