//! Read-only catalog of role definitions.
//!
//! Built once at startup from configuration documents and shared by
//! reference; changing roles requires an orchestrator restart.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{RoleDefinition, RoutingMode};

pub struct RoleRegistry {
    roles: HashMap<String, Arc<RoleDefinition>>,
    /// Declaration order, used for deterministic first-match lookups.
    order: Vec<String>,
}

impl RoleRegistry {
    pub fn from_definitions(definitions: Vec<RoleDefinition>) -> DomainResult<Self> {
        let mut roles = HashMap::new();
        let mut order = Vec::new();
        let mut prefixes: HashMap<String, String> = HashMap::new();

        for def in definitions {
            def.validate().map_err(DomainError::Validation)?;
            if roles.contains_key(&def.role) {
                return Err(DomainError::Validation(format!(
                    "duplicate role definition: {}",
                    def.role
                )));
            }
            if let Some(existing) = prefixes.insert(def.prefix.clone(), def.role.clone()) {
                return Err(DomainError::Validation(format!(
                    "roles {existing} and {} share id prefix {}",
                    def.role, def.prefix
                )));
            }
            order.push(def.role.clone());
            roles.insert(def.role.clone(), Arc::new(def));
        }

        if roles.is_empty() {
            return Err(DomainError::Validation(
                "at least one role must be defined".to_string(),
            ));
        }

        Ok(Self { roles, order })
    }

    pub fn get(&self, role: &str) -> Option<Arc<RoleDefinition>> {
        self.roles.get(role).cloned()
    }

    pub fn require(&self, role: &str) -> DomainResult<Arc<RoleDefinition>> {
        self.get(role)
            .ok_or_else(|| DomainError::RoleNotFound(role.to_string()))
    }

    pub fn roles(&self) -> impl Iterator<Item = Arc<RoleDefinition>> + '_ {
        self.order.iter().filter_map(|name| self.get(name))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// First role (in declaration order) accepting the task type.
    pub fn role_for_task_type(&self, task_type: &str) -> Option<Arc<RoleDefinition>> {
        self.roles()
            .find(|role| role.accepts_task_type(task_type))
    }

    /// Resolve the consumer role for a produced task type under the
    /// producing role's routing mode. `None` means the production is
    /// dropped.
    pub fn resolve_consumer(
        &self,
        producer: &RoleDefinition,
        task_type: &str,
    ) -> Option<Arc<RoleDefinition>> {
        match producer.routing_mode {
            RoutingMode::Open => self.role_for_task_type(task_type),
            RoutingMode::Restricted => producer
                .routes_to
                .iter()
                .find(|rule| rule.task_types.iter().any(|t| t == task_type))
                .and_then(|rule| self.get(&rule.role))
                .filter(|role| role.accepts_task_type(task_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RoutingRule;

    fn pm_coder_registry() -> RoleRegistry {
        let mut pm = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
        pm.produces = vec!["implementation".to_string()];
        let coder = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        RoleRegistry::from_definitions(vec![pm, coder]).unwrap()
    }

    #[test]
    fn test_lookup_and_order() {
        let registry = pm_coder_registry();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("pm").is_some());
        assert!(registry.get("unknown").is_none());
        assert!(registry.require("unknown").is_err());

        let role = registry.role_for_task_type("implementation").unwrap();
        assert_eq!(role.role, "coder");
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let a = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        let b = RoleDefinition::new("coder", "C2", vec!["implementation".to_string()]);
        assert!(RoleRegistry::from_definitions(vec![a, b]).is_err());
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let a = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        let b = RoleDefinition::new("checker", "CD", vec!["verification".to_string()]);
        assert!(RoleRegistry::from_definitions(vec![a, b]).is_err());
    }

    #[test]
    fn test_open_routing_finds_any_acceptor() {
        let registry = pm_coder_registry();
        let pm = registry.get("pm").unwrap();
        let consumer = registry.resolve_consumer(&pm, "implementation").unwrap();
        assert_eq!(consumer.role, "coder");
        assert!(registry.resolve_consumer(&pm, "deploy").is_none());
    }

    #[test]
    fn test_restricted_routing_only_declared_targets() {
        let mut pm = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
        pm.routing_mode = RoutingMode::Restricted;
        pm.routes_to = vec![RoutingRule {
            role: "coder".to_string(),
            task_types: vec!["implementation".to_string()],
        }];
        let coder = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        let reviewer = RoleDefinition::new("reviewer", "RV", vec!["review".to_string()]);
        let registry = RoleRegistry::from_definitions(vec![pm, coder, reviewer]).unwrap();

        let pm = registry.get("pm").unwrap();
        assert_eq!(
            registry.resolve_consumer(&pm, "implementation").unwrap().role,
            "coder"
        );
        // Not declared in routes_to: dropped even though reviewer accepts it.
        assert!(registry.resolve_consumer(&pm, "review").is_none());
    }
}
