//! Configuration management for the application.
//!
//! Exposes strongly typed structures backed by the `config` crate so the
//! service can load settings from user configuration directories or project
//! overrides alongside environment variables.

use config::{Config, ConfigError, Environment, File};
use dirs::{config_dir, data_dir, home_dir};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// The main application configuration structure.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port).
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Routing/selection defaults.
    pub routing: RoutingConfig,
    /// Provider catalogue source.
    pub catalogue: CatalogueConfig,
}

/// Server-specific configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// The host address to bind the server to.
    pub host: String,
    /// The port to listen on.
    pub port: u16,
}

/// Database-specific configuration.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// The database connection URL.
    pub url: String,
}

/// Defaults governing plan execution and provider selection.
#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    /// Maximum concurrent in-flight dispatches.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Default per-request deadline, in seconds, when the caller omits one.
    #[serde(default = "default_request_timeout_secs")]
    pub default_request_timeout_secs: u64,
    /// Default weight on the capability-match sub-score.
    #[serde(default = "default_weight_capability")]
    pub weight_capability: f64,
    /// Default weight on the quality sub-score.
    #[serde(default = "default_weight_quality")]
    pub weight_quality: f64,
    /// Default weight on the live availability sub-score.
    #[serde(default = "default_weight_availability")]
    pub weight_availability: f64,
    /// Default weight on the cost sub-score.
    #[serde(default = "default_weight_cost")]
    pub weight_cost: f64,
    /// Default weight on the speed sub-score.
    #[serde(default = "default_weight_speed")]
    pub weight_speed: f64,
    /// How often the metrics store flushes to its sink.
    #[serde(default = "default_metrics_flush_secs")]
    pub metrics_flush_secs: u64,
}

impl RoutingConfig {
    /// The configured per-request deadline as a `Duration`.
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_secs(self.default_request_timeout_secs)
    }

    /// The configured metrics flush period as a `Duration`.
    pub fn metrics_flush_period(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_secs)
    }

    /// Builds a `SelectorWeights` from the configured defaults.
    pub fn selector_weights(&self) -> crate::selector::SelectorWeights {
        crate::selector::SelectorWeights {
            capability: self.weight_capability,
            quality: self.weight_quality,
            availability: self.weight_availability,
            cost: self.weight_cost,
            speed: self.weight_speed,
        }
    }
}

fn default_max_workers() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_weight_capability() -> f64 {
    0.4
}

fn default_weight_quality() -> f64 {
    0.3
}

fn default_weight_availability() -> f64 {
    0.2
}

fn default_weight_cost() -> f64 {
    0.05
}

fn default_weight_speed() -> f64 {
    0.05
}

fn default_metrics_flush_secs() -> u64 {
    30
}

/// Where the provider catalogue is loaded from on startup.
#[derive(Debug, Deserialize)]
pub struct CatalogueConfig {
    /// Path to a CSV catalogue file, following the provider-catalogue format.
    /// When absent, the router starts with an empty registry and relies on
    /// operator-issued reload calls.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// Loads the application configuration.
    ///
    /// Searches the user's configuration directories first, then project-local
    /// overrides, and finally allows environment variables prefixed with
    /// `ROUTER__` to override nested values.
    pub fn load() -> Result<Self, ConfigError> {
        let _dotenv_path = dotenvy::dotenv();

        let mut builder = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.url", default_database_url())?
            .set_default("routing.max_workers", 5)?
            .set_default("routing.default_request_timeout_secs", 60)?
            .set_default("routing.weight_capability", 0.4)?
            .set_default("routing.weight_quality", 0.3)?
            .set_default("routing.weight_availability", 0.2)?
            .set_default("routing.weight_cost", 0.05)?
            .set_default("routing.weight_speed", 0.05)?
            .set_default("routing.metrics_flush_secs", 30)?;

        for path in candidate_config_files() {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        if config.database.url.trim().is_empty() {
            config.database.url = default_database_url();
        }

        config.database.url = normalize_database_url(&config.database.url)?;

        Ok(config)
    }
}

fn candidate_config_files() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(dir) = config_dir() {
        let path = dir.join("routewise").join("config.toml");
        if path.exists() {
            paths.push(path);
        }
    }

    if let Some(home) = home_dir() {
        let legacy = home.join(".routewise").join("config.toml");
        if legacy.exists() {
            paths.push(legacy);
        }
    }

    let project_override = Path::new("routewise.toml");
    if project_override.exists() {
        paths.push(project_override.to_path_buf());
    }

    let secrets_path = Path::new(".secrets/app.toml");
    if secrets_path.exists() {
        paths.push(secrets_path.to_path_buf());
    }

    paths
}

fn default_database_url() -> String {
    format!("sqlite://{}", default_database_path().display())
}

fn normalize_database_url(url: &str) -> Result<String, ConfigError> {
    if !url.starts_with("sqlite:") {
        return Ok(url.to_string());
    }

    let remainder = &url["sqlite:".len()..];
    if remainder == ":memory:" || remainder.starts_with("memory") {
        return Ok(url.to_string());
    }

    let default_dir = default_data_dir();
    let mut path = if remainder.is_empty() {
        default_database_path()
    } else if remainder.starts_with("///") {
        PathBuf::from(&remainder[3..])
    } else if remainder.starts_with("//") {
        PathBuf::from(&remainder[2..])
    } else if remainder.starts_with('/') {
        PathBuf::from(remainder)
    } else {
        PathBuf::from(remainder)
    };

    if !path.is_absolute() {
        path = default_dir.join(path);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            ConfigError::Message(format!(
                "Failed to create database directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    Ok(format!("sqlite://{}", path.display()))
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("routewise.db")
}

fn default_data_dir() -> PathBuf {
    data_dir()
        .or_else(home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("routewise")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_database_url_leaves_memory_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:").unwrap(), "sqlite::memory:");
    }
}
