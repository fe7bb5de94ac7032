/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file config.rs
 * @brief FerroDB configuration management
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub postgresql: PostgresConfig,
    pub logging: LoggingConfig,
    pub cursors: CursorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub uri: String,
    pub pool_size: u32,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Idle cursors are collected lazily on the next getMore once this many
    /// seconds have passed.
    pub ttl_seconds: u64,
    pub default_batch_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 27017,
                max_connections: 1000,
            },
            postgresql: PostgresConfig {
                uri: "postgresql://localhost:5432/ferrodb".to_string(),
                pool_size: 10,
                connection_timeout_ms: 5000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            cursors: CursorConfig {
                ttl_seconds: 600,
                default_batch_size: 101,
            },
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Layered load: defaults, then the optional file, then `FERRODB_*`
    /// environment variables (e.g. `FERRODB_SERVER__PORT=27018`).
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("FERRODB").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
