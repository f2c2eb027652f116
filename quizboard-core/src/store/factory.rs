use super::{KeyLayout, MemoryStore, RedisStore, SharedStore};
use crate::{QuizError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    redis_url: Option<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(QuizError::Config(
                "store namespace cannot be empty".to_string(),
            ));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(QuizError::Config(
                "store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub fn key_layout(&self) -> Result<KeyLayout> {
        Ok(KeyLayout::new(self.resolve_namespace()?))
    }

    pub async fn build(&self) -> Result<Arc<dyn SharedStore>> {
        self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(QuizError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisStore::new(url).await?;
                Ok(Arc::new(store))
            }
            "memory" => {
                tracing::warn!("Using in-memory store; events will not leave this process");
                Ok(Arc::new(MemoryStore::new()))
            }
            other => Err(QuizError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}
