//! Balancer configuration
//!
//! Loaded from a YAML or JSON file, then overridden from the environment
//! (after `.env` is read), then validated.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::core::health_monitor::HealthCheckConfig;
use crate::core::routing::LoadBalancingAlgorithm;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub nodes: Vec<NodeConfig>,
    pub routing: RoutingConfig,
    pub health: HealthConfig,
    pub operation_timeout_ms: u64,
    pub command_log: CommandLogConfig,
    pub logging: LoggingConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            routing: RoutingConfig::default(),
            health: HealthConfig::default(),
            operation_timeout_ms: 5000,
            command_log: CommandLogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Connection string handed to the driver factory
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: LoadBalancingAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 5,
            probe_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLogConfig {
    /// Durable log file; memory-only when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `compact`, `pretty` or `json`
    pub format: String,
    /// Print the event target (module path)
    pub show_target: bool,
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            show_target: false,
            thread_ids: false,
        }
    }
}

fn default_weight() -> u32 {
    1
}

impl BalancerConfig {
    /// Load from an optional file, apply environment overrides and validate
    pub async fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: BalancerConfig = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .map_err(|e| AppError::ConfigError(format!("Invalid YAML config: {}", e)))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| AppError::ConfigError(format!("Invalid JSON config: {}", e)))?
        } else {
            return Err(AppError::ConfigError(
                "Config file must be .yaml, .yml, or .json".to_string(),
            ));
        };

        debug!(path = path, nodes = config.nodes.len(), "Configuration loaded from file");
        Ok(config)
    }

    /// Apply `BALANCER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(strategy) = lookup("BALANCER_STRATEGY") {
            self.routing.strategy = strategy.parse()?;
        }
        if let Some(interval) = lookup("BALANCER_PROBE_INTERVAL_SECS") {
            self.health.probe_interval_secs = interval.parse().map_err(|e| {
                AppError::ConfigError(format!("Invalid BALANCER_PROBE_INTERVAL_SECS: {}", e))
            })?;
        }
        if let Some(timeout) = lookup("BALANCER_PROBE_TIMEOUT_MS") {
            self.health.probe_timeout_ms = timeout.parse().map_err(|e| {
                AppError::ConfigError(format!("Invalid BALANCER_PROBE_TIMEOUT_MS: {}", e))
            })?;
        }
        if let Some(path) = lookup("BALANCER_COMMAND_LOG_PATH") {
            self.command_log.path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(level) = lookup("BALANCER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("BALANCER_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(AppError::ConfigError("Node name must not be empty".to_string()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(AppError::DuplicateNode(node.name.clone()));
            }
            if node.weight == 0 {
                return Err(AppError::ConfigError(format!(
                    "Node {} must have a positive weight",
                    node.name
                )));
            }
        }

        if self.health.probe_interval_secs == 0 {
            return Err(AppError::ConfigError(
                "Probe interval must be positive".to_string(),
            ));
        }
        if self.health.probe_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(AppError::ConfigError("Timeouts must be positive".to_string()));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(AppError::ConfigError("Invalid log level".to_string())),
        }
        match self.logging.format.as_str() {
            "compact" | "pretty" | "json" => {}
            other => {
                return Err(AppError::ConfigError(format!(
                    "Invalid log format: {}",
                    other
                )))
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn health_check(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            probe_interval: Duration::from_secs(self.health.probe_interval_secs),
            probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
nodes:
  - name: primary
    weight: 3
    endpoint: postgres://db1:5432/app
  - name: replica
routing:
  strategy: weighted_round_robin
health:
  probe_interval_secs: 2
command_log:
  path: /var/lib/balancer/log.json
"#;

    fn write_config(name: &str, content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        let path = path.to_string_lossy().to_string();
        (dir, path)
    }

    #[tokio::test]
    async fn test_load_yaml_with_defaults() {
        let (_dir, path) = write_config("balancer.yaml", SAMPLE);
        let config = BalancerConfig::load_from_file(&path).await.unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].weight, 3);
        assert_eq!(config.nodes[1].weight, 1);
        assert!(config.nodes[1].endpoint.is_none());
        assert_eq!(
            config.routing.strategy,
            LoadBalancingAlgorithm::WeightedRoundRobin
        );
        assert_eq!(config.health.probe_interval_secs, 2);
        assert_eq!(config.health.probe_timeout_ms, 1000);
        assert_eq!(config.operation_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_json() {
        let (_dir, path) = write_config(
            "balancer.json",
            r#"{"nodes":[{"name":"a"}],"routing":{"strategy":"least_response_time"}}"#,
        );
        let config = BalancerConfig::load_from_file(&path).await.unwrap();
        assert_eq!(
            config.routing.strategy,
            LoadBalancingAlgorithm::LeastResponseTime
        );
    }

    #[tokio::test]
    async fn test_logging_flags_from_yaml() {
        let (_dir, path) = write_config(
            "balancer.yaml",
            "logging:\n  format: json\n  show_target: true\n  thread_ids: true\n",
        );
        let config = BalancerConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.logging.format, "json");
        assert!(config.logging.show_target);
        assert!(config.logging.thread_ids);
        // unset fields keep their defaults
        assert_eq!(config.logging.level, "info");
        assert!(!LoggingConfig::default().show_target);
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected() {
        let (_dir, path) = write_config("balancer.toml", "nodes = []");
        assert!(matches!(
            BalancerConfig::load_from_file(&path).await,
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_overrides_applied() {
        let env: HashMap<&str, &str> = [
            ("BALANCER_STRATEGY", "rr"),
            ("BALANCER_PROBE_TIMEOUT_MS", "250"),
            ("BALANCER_COMMAND_LOG_PATH", "/tmp/balancer.json"),
            ("BALANCER_LOG_LEVEL", "debug"),
            ("BALANCER_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = BalancerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.routing.strategy, LoadBalancingAlgorithm::RoundRobin);
        assert_eq!(config.health.probe_timeout_ms, 250);
        assert_eq!(
            config.command_log.path,
            Some(PathBuf::from("/tmp/balancer.json"))
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = BalancerConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "BALANCER_PROBE_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_validation() {
        let node = |name: &str, weight| NodeConfig {
            name: name.to_string(),
            weight,
            endpoint: None,
        };
        let mut config = BalancerConfig {
            nodes: vec![node("a", 1), node("a", 2)],
            ..BalancerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AppError::DuplicateNode(_))
        ));

        config.nodes = vec![node("a", 0)];
        assert!(config.validate().is_err());

        config.nodes = vec![node("a", 1)];
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "warn".to_string();
        assert!(config.validate().is_ok());

        config.health.probe_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_check_conversion() {
        let config = BalancerConfig::default();
        let health = config.health_check();
        assert_eq!(health.probe_interval, Duration::from_secs(5));
        assert_eq!(health.probe_timeout, Duration::from_millis(1000));
    }
}
