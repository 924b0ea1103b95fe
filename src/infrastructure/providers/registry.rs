//! Provider registry: name → provider instances, populated at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::RoleDefinition;
use crate::domain::ports::Provider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_name: String,
}

impl ProviderRegistry {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_name: default_name.into(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Provider for a role: its override, else the team default.
    pub fn for_role(&self, role: &RoleDefinition) -> DomainResult<Arc<dyn Provider>> {
        let name = role.provider.as_deref().unwrap_or(&self.default_name);
        self.get(name).ok_or_else(|| {
            DomainError::Validation(format!(
                "provider {name} for role {} is not registered",
                role.role
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The registry is usable when the default provider exists.
    pub fn validate(&self) -> DomainResult<()> {
        if self.providers.contains_key(&self.default_name) {
            Ok(())
        } else {
            Err(DomainError::Validation(format!(
                "default provider {} is not registered (have: {:?})",
                self.default_name,
                self.names()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::providers::ScriptedProvider;

    #[test]
    fn test_role_override_and_default() {
        let registry = ProviderRegistry::new("cli")
            .with_provider(Arc::new(ScriptedProvider::new("cli")))
            .with_provider(Arc::new(ScriptedProvider::new("alt")));
        registry.validate().unwrap();

        let plain = RoleDefinition::new("coder", "CD", vec!["implementation".to_string()]);
        assert_eq!(registry.for_role(&plain).unwrap().name(), "cli");

        let mut pinned = RoleDefinition::new("pm", "PM", vec!["goal".to_string()]);
        pinned.provider = Some("alt".to_string());
        assert_eq!(registry.for_role(&pinned).unwrap().name(), "alt");

        pinned.provider = Some("missing".to_string());
        assert!(registry.for_role(&pinned).is_err());
    }

    #[test]
    fn test_validate_requires_default() {
        let registry =
            ProviderRegistry::new("cli").with_provider(Arc::new(ScriptedProvider::new("alt")));
        assert!(registry.validate().is_err());
    }
}
