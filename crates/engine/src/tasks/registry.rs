//! Task name to handler lookup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::Task;

/// Failure signalled by a handler.
///
/// The classification decides what the executor does next: `Transient` and
/// `Unclassified` are retried with backoff, `Permanent` dead-letters at once.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (network, external API, lock contention)
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help (malformed payload, missing domain row)
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Permanent(_))
    }
}

/// Runs one task's payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered: {0}")]
    Duplicate(String),
    #[error("no handler registered for task: {0}")]
    NotFound(String),
}

/// Handlers keyed by task name. Populated once at start-up.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::NewTask;
    use chrono::Utc;

    #[tokio::test]
    async fn resolves_registered_handlers_by_name() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("noop", handler_fn(|_task| async { Ok(()) }))
            .unwrap();

        let task = NewTask::new("noop", serde_json::json!({})).into_task(Utc::now());
        let handler = registry.resolve("noop").unwrap();
        assert!(handler.handle(&task).await.is_ok());

        assert_eq!(
            registry.resolve("missing").err(),
            Some(RegistryError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("a", handler_fn(|_| async { Ok(()) })).unwrap();
        let err = registry
            .register("a", handler_fn(|_| async { Ok(()) }))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("a".to_string()));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn anyhow_errors_default_to_retryable() {
        let err: HandlerError = anyhow::anyhow!("socket closed").into();
        assert!(err.is_retryable());
        assert!(HandlerError::transient("x").is_retryable());
        assert!(!HandlerError::permanent("x").is_retryable());
    }
}
