//! Definition registry for runtime workflow lookup.
//!
//! A simple name-indexed registry of validated workflow definitions. The CLI
//! uses it to find the definition a persisted instance belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::WorkflowDefinition;

/// Registry of available workflow definitions, indexed by name.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its own name.
    ///
    /// Names are unique: registering a second definition with the same name
    /// is rejected.
    pub fn register(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        let name = definition.name().to_string();
        if self.definitions.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let definition = Arc::new(definition);
        self.definitions.insert(name, Arc::clone(&definition));
        Ok(definition)
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Like `get`, but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("definitions", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow '{0}' is already registered")]
    Duplicate(String),

    #[error("no workflow named '{0}' is registered")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::TestStep;

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::builder(name)
            .add_step(TestStep::new("a"))
            .build()
            .unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition("reports")).unwrap();
        registry.register(definition("billing")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["billing", "reports"]);
        assert_eq!(registry.require("reports").unwrap().name(), "reports");
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition("reports")).unwrap();
        let err = registry.register(definition("reports")).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("reports".to_string()));
    }

    #[test]
    fn require_missing() {
        let registry = WorkflowRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.require("ghost").unwrap_err().to_string(),
            "no workflow named 'ghost' is registered"
        );
    }
}
