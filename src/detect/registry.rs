use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::InferenceEngine;

/// Constructor for a fresh engine instance.
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn InferenceEngine>> + Send + Sync>;

/// Thread-safe registry of engine constructors.
///
/// Every stream gets its own engine instance so tracking state and a stalled
/// inference call stay local to one stream.
#[derive(Clone)]
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
    default_name: Option<String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a constructor. The first registered engine becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn InferenceEngine>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default engine by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("engine '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Instantiate an engine by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn InferenceEngine>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("engine '{}' not registered", name))?;
        let mut engine = factory()?;
        engine.warm_up()?;
        Ok(engine)
    }

    /// Instantiate the default engine.
    pub fn create_default(&self) -> Result<Box<dyn InferenceEngine>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no inference engine registered"))?;
        self.create(name)
    }

    /// List registered engines, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
