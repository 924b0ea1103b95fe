//! Role definitions: the static catalog entries behind the registry.
//!
//! A role couples a prompt and tool set with the task types it accepts,
//! the task types it may produce, routing targets, and scaling bounds.
//! Definitions are loaded once at startup; changing them requires an
//! orchestrator restart.

use serde::{Deserialize, Serialize};

use super::task::TaskPriority;

fn default_max_instances() -> u32 {
    1
}

fn default_initial_instances() -> u32 {
    1
}

fn default_task_timeout_secs() -> u64 {
    30 * 60
}

/// Auto-scaling parameters for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleSpec {
    pub enabled: bool,
    /// Spawn another instance once this many tasks are pending.
    pub scale_up_threshold: u64,
    /// Retire an instance after the whole role has idled this long.
    pub scale_down_idle_seconds: u64,
    /// Minimum spacing between scale actions for the role.
    pub cooldown_seconds: u64,
}

impl Default for AutoScaleSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 2,
            scale_down_idle_seconds: 60,
            cooldown_seconds: 30,
        }
    }
}

/// Routing rule: completed work of this role may fan out to `role` for
/// any of the listed task types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub role: String,
    pub task_types: Vec<String>,
}

/// How produced task types are matched to consumer roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Any role accepting the produced task type is a legal consumer.
    Open,
    /// Only targets named in `routes_to` are legal; others are dropped.
    Restricted,
}

impl Default for RoutingMode {
    fn default() -> Self {
        Self::Open
    }
}

/// One role's full definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Registry key, e.g. `coder`
    pub role: String,
    /// Human-facing name, e.g. `Coder`
    pub display_name: String,
    /// Task id prefix, e.g. `CD`
    pub prefix: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    /// Opaque to the core; handed to the provider verbatim.
    #[serde(default)]
    pub system_prompt: String,
    /// Opaque tool identifiers handed to the provider.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Model override for this role, else the team default.
    #[serde(default)]
    pub model: Option<String>,
    /// Provider override for this role, else the team default.
    #[serde(default)]
    pub provider: Option<String>,
    /// Task types instances of this role will claim.
    pub accepts: Vec<String>,
    /// Task types completions of this role may declare.
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub routing_mode: RoutingMode,
    #[serde(default)]
    pub routes_to: Vec<RoutingRule>,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_initial_instances")]
    pub initial_instances: u32,
    #[serde(default)]
    pub auto_scale: AutoScaleSpec,
    /// Wall-clock limit per provider invocation.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Priority given to rejection re-queue tasks for this role.
    #[serde(default)]
    pub rejection_priority: Option<TaskPriority>,
}

impl RoleDefinition {
    /// Minimal definition for wiring and tests.
    pub fn new(role: impl Into<String>, prefix: impl Into<String>, accepts: Vec<String>) -> Self {
        let role = role.into();
        Self {
            display_name: {
                let mut chars = role.chars();
                chars
                    .next()
                    .map(|c| c.to_uppercase().collect::<String>() + chars.as_str())
                    .unwrap_or_default()
            },
            role,
            prefix: prefix.into(),
            color: None,
            emoji: None,
            system_prompt: String::new(),
            tools: Vec::new(),
            model: None,
            provider: None,
            accepts,
            produces: Vec::new(),
            routing_mode: RoutingMode::default(),
            routes_to: Vec::new(),
            max_instances: default_max_instances(),
            initial_instances: default_initial_instances(),
            auto_scale: AutoScaleSpec::default(),
            task_timeout_secs: default_task_timeout_secs(),
            rejection_priority: None,
        }
    }

    pub fn accepts_task_type(&self, task_type: &str) -> bool {
        self.accepts.iter().any(|t| t == task_type)
    }

    pub fn produces_task_type(&self, task_type: &str) -> bool {
        self.produces.iter().any(|t| t == task_type)
    }

    /// Whether `routes_to` explicitly names (target_role, task_type).
    pub fn routes_to_target(&self, target_role: &str, task_type: &str) -> bool {
        self.routes_to
            .iter()
            .any(|r| r.role == target_role && r.task_types.iter().any(|t| t == task_type))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.role.trim().is_empty() {
            return Err("role name cannot be empty".to_string());
        }
        if self.prefix.trim().is_empty() {
            return Err(format!("role {} must declare an id prefix", self.role));
        }
        if self.accepts.is_empty() {
            return Err(format!("role {} accepts no task types", self.role));
        }
        if self.max_instances == 0 {
            return Err(format!("role {} allows zero instances", self.role));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_role_defaults() {
        let role = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        assert_eq!(role.display_name, "Coder");
        assert_eq!(role.max_instances, 1);
        assert_eq!(role.task_timeout_secs, 30 * 60);
        assert!(!role.auto_scale.enabled);
        assert!(role.accepts_task_type("implementation"));
        assert!(!role.accepts_task_type("review"));
    }

    #[test]
    fn test_routing_target_lookup() {
        let mut role = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
        role.routes_to = vec![RoutingRule {
            role: "coder".to_string(),
            task_types: vec!["implementation".to_string()],
        }];
        assert!(role.routes_to_target("coder", "implementation"));
        assert!(!role.routes_to_target("coder", "review"));
        assert!(!role.routes_to_target("reviewer", "implementation"));
    }

    #[test]
    fn test_validation() {
        let role = RoleDefinition::new("coder", "", vec!["implementation".to_string()]);
        assert!(role.validate().is_err());

        let role = RoleDefinition::new("coder", "CD", vec![]);
        assert!(role.validate().is_err());

        let mut role = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        role.max_instances = 0;
        assert!(role.validate().is_err());

        let role = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        assert!(role.validate().is_ok());
    }
}
