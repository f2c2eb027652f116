use quizboard_core::{QuizError, Result, StoreBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Shared state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
    #[serde(default = "default_membership_ttl_secs")]
    pub membership_ttl_secs: u64,
}

impl StoreConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("quizboard")
    }

    pub fn membership_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_ttl_secs)
    }
}

fn default_membership_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Timing and size limits for streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            ping_period_secs: default_ping_period_secs(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl WebSocketConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

// Pings go out at 90% of the pong wait.
fn default_ping_period_secs() -> u64 {
    default_pong_wait_secs() * 9 / 10
}

fn default_max_message_size() -> usize {
    1024
}

/// Bearer tokens accepted on `/user` routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
}

impl AuthConfig {
    pub fn token_map(&self) -> HashMap<String, String> {
        self.tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.user_id.clone()))
            .collect()
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("QUIZBOARD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| QuizError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| QuizError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(QuizError::Config("server.bind_addr cannot be empty".to_string()));
        }

        if self.store.backend == StoreBackend::Redis
            && self
                .store
                .redis
                .as_ref()
                .is_none_or(|redis| redis.url.trim().is_empty())
        {
            return Err(QuizError::Config(
                "redis configuration is required for redis backend".to_string(),
            ));
        }

        if self.store.membership_ttl_secs == 0 {
            return Err(QuizError::Config(
                "store.membership_ttl_secs must be positive".to_string(),
            ));
        }

        let ws = &self.websocket;
        if ws.write_wait_secs == 0 || ws.pong_wait_secs == 0 || ws.ping_period_secs == 0 {
            return Err(QuizError::Config(
                "websocket timings must be positive".to_string(),
            ));
        }
        if ws.ping_period_secs >= ws.pong_wait_secs {
            return Err(QuizError::Config(format!(
                "websocket.ping_period_secs ({}) must be less than pong_wait_secs ({})",
                ws.ping_period_secs, ws.pong_wait_secs
            )));
        }
        if ws.max_message_size == 0 {
            return Err(QuizError::Config(
                "websocket.max_message_size must be positive".to_string(),
            ));
        }

        for entry in &self.auth.tokens {
            if entry.token.trim().is_empty() || entry.user_id.trim().is_empty() {
                return Err(QuizError::Config(
                    "auth tokens need both token and user_id".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn store_builder(&self) -> StoreBuilder {
        let builder = StoreBuilder::new()
            .backend(self.store.backend.as_str())
            .namespace(self.store.namespace_or_default());

        match &self.store.redis {
            Some(redis) => builder.redis_url(redis.url.clone()),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let path = path.to_string_lossy().into_owned();
        (dir, path)
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let (_dir, path) = write_config("store:\n  backend: memory\n");

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.namespace_or_default(), "quizboard");
        assert_eq!(config.store.membership_ttl(), Duration::from_secs(3600));
        assert_eq!(config.websocket.write_wait(), Duration::from_secs(10));
        assert_eq!(config.websocket.pong_wait(), Duration::from_secs(60));
        assert_eq!(config.websocket.ping_period(), Duration::from_secs(54));
        assert_eq!(config.websocket.max_message_size, 1024);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let (_dir, path) = write_config(
            r#"
server:
  bind_addr: "127.0.0.1:9000"
store:
  backend: redis
  namespace: live
  redis:
    url: "redis://127.0.0.1:6379"
  membership_ttl_secs: 600
websocket:
  write_wait_secs: 5
  pong_wait_secs: 30
  ping_period_secs: 20
  max_message_size: 2048
auth:
  tokens:
    - token: Secret-1
      user_id: user-1
"#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.namespace_or_default(), "live");
        assert_eq!(config.store.membership_ttl_secs, 600);
        assert_eq!(config.websocket.ping_period(), Duration::from_secs(20));
        assert_eq!(
            config.auth.token_map().get("Secret-1").map(String::as_str),
            Some("user-1")
        );

        let layout = config.store_builder().key_layout().unwrap();
        assert_eq!(layout.events_channel(), "live:events");
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let (_dir, path) = write_config("store:\n  backend: redis\n");
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, QuizError::Config(_)));
    }

    #[test]
    fn test_ping_period_must_be_below_pong_wait() {
        let (_dir, path) = write_config(
            "store:\n  backend: memory\nwebsocket:\n  pong_wait_secs: 30\n  ping_period_secs: 30\n",
        );
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("ping_period_secs"));
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let (_dir, path) =
            write_config("store:\n  backend: memory\nwebsocket:\n  max_message_size: 0\n");
        assert!(Config::from_file(&path).is_err());

        let (_dir, path) = write_config("store:\n  backend: memory\n  membership_ttl_secs: 0\n");
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = Config::from_file(&path.to_string_lossy()).unwrap_err();
        assert!(matches!(err, QuizError::Config(_)));
    }
}
