//! Typed configuration bundle handed to recipe factories

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

/// Values a caller supplies for one `start` call, looked up by type
///
/// Recipe factories read from it inside `initialize`. Asking for a type
/// that was never added is a configuration error.
#[derive(Clone, Default)]
pub struct StartupConfig {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    name_override: Option<String>,
}

impl StartupConfig {
    /// Create an empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, replacing any earlier value of the same type
    pub fn add<T: Any + Send + Sync>(&mut self, value: T) -> &mut Self {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// Builder-style [`add`](Self::add)
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    /// The value of type `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Result<&T> {
        self.try_get::<T>().ok_or_else(|| {
            Error::configuration(format!(
                "startup config has no value of type {}",
                type_name::<T>()
            ))
        })
    }

    /// The value of type `T`, if one was added
    pub fn try_get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.as_ref().downcast_ref::<T>())
    }

    /// Override the application name used for pod labels
    pub fn set_name_override(&mut self, name: impl Into<String>) -> &mut Self {
        self.name_override = Some(name.into());
        self
    }

    /// Application name override, if set
    pub fn name_override(&self) -> Option<&str> {
        self.name_override.as_deref()
    }
}

impl std::fmt::Debug for StartupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupConfig")
            .field("values", &self.values.len())
            .field("name_override", &self.name_override)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct CodexSetup {
        log_level: String,
    }

    #[test]
    fn test_get_returns_added_value() {
        let config = StartupConfig::new().with(CodexSetup {
            log_level: "TRACE".to_string(),
        });
        assert_eq!(config.get::<CodexSetup>().unwrap().log_level, "TRACE");
    }

    #[test]
    fn test_missing_type_is_configuration_error() {
        let config = StartupConfig::new();
        let err = config.get::<CodexSetup>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("CodexSetup"));
        assert!(config.try_get::<CodexSetup>().is_none());
    }

    #[test]
    fn test_later_value_replaces_earlier() {
        let mut config = StartupConfig::new();
        config.add(1u16).add(2u16);
        assert_eq!(*config.get::<u16>().unwrap(), 2);
    }

    #[test]
    fn test_name_override() {
        let mut config = StartupConfig::new();
        assert_eq!(config.name_override(), None);
        config.set_name_override("bootstrap-node");
        assert_eq!(config.name_override(), Some("bootstrap-node"));
    }
}
