//! Broker configuration.
//!
//! Layered: built-in defaults, then an optional `harbor.toml`, then
//! `HARBOR__*` environment variables, then the documented plain variables
//! (`PORT`, `HOST`, `LOG_LEVEL`, `ALLOWED_ORIGINS`, `JWT_SECRET`).
//! The JWT secret is mandatory; the process refuses to start without it.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    pub server: ServerConfig,
    pub auth: AuthSettings,
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing secret. Required at startup.
    pub jwt_secret: Option<String>,
    /// When set, `POST /api/auth/token` mints a token for this user id.
    /// Development convenience only.
    pub dev_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent name; the session tree lives at `~/.{name}/projects`.
    pub name: String,
    /// Binary to invoke per turn. Defaults to the agent name.
    pub binary: Option<String>,
    /// Per-turn timeout in seconds.
    pub turn_timeout_secs: u64,
    /// Override for the home directory the session tree is resolved under.
    pub home: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthSettings::default(),
            agent: AgentConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            allowed_origins: Vec::new(),
            log_level: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            binary: None,
            turn_timeout_secs: 600,
            home: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: data_dir.join("harbor").join("harbor.db"),
        }
    }
}

impl HarborConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else if let Some(default_path) = default_config_file() {
            builder = builder.add_source(
                File::from(default_path.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }
        let built = builder
            .add_source(Environment::with_prefix("HARBOR").separator("__"))
            .build()
            .context("building configuration")?;

        let mut config: HarborConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.apply_plain_env()?;
        Ok(config)
    }

    /// Apply the documented un-prefixed environment variables.
    fn apply_plain_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("HOST")
            && !host.is_empty()
        {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PORT")
            && !port.is_empty()
        {
            self.server.port = port
                .parse()
                .with_context(|| format!("invalid PORT value: {port}"))?;
        }
        if let Ok(level) = env::var("LOG_LEVEL")
            && !level.is_empty()
        {
            self.server.log_level = Some(level);
        }
        if let Ok(origins) = env::var("ALLOWED_ORIGINS")
            && !origins.is_empty()
        {
            self.server.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(secret) = env::var("JWT_SECRET")
            && !secret.is_empty()
        {
            self.auth.jwt_secret = Some(secret);
        }
        Ok(())
    }

    /// Startup validation. The broker must not run without a signing secret.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.as_deref().unwrap_or("").is_empty() {
            bail!("JWT_SECRET is required; refusing to start without a signing secret");
        }
        Ok(())
    }

    pub fn agent_binary(&self) -> &str {
        self.agent.binary.as_deref().unwrap_or(&self.agent.name)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.turn_timeout_secs)
    }

    /// Home directory the agent session tree is resolved under.
    pub fn agent_home(&self) -> PathBuf {
        self.agent
            .home
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("harbor").join("harbor.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = HarborConfig::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.agent.name, "claude");
        assert_eq!(config.agent_binary(), "claude");
        assert_eq!(config.turn_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn validate_requires_jwt_secret() {
        let mut config = HarborConfig::default();
        assert!(config.validate().is_err());
        config.auth.jwt_secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_binary_overrides_agent_name() {
        let mut config = HarborConfig::default();
        config.agent.binary = Some("/usr/local/bin/claude-dev".to_string());
        assert_eq!(config.agent_binary(), "/usr/local/bin/claude-dev");
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9999\n[auth]\njwt_secret = \"abc\"\n[agent]\nname = \"claude\"\n",
        )
        .unwrap();
        let config = HarborConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9999);
        assert!(config.validate().is_ok());
    }
}
