//! Application configuration
//!
//! TOML file (path from `CONFIG_FILE`, default under the platform config
//! dir) with environment overrides: `PORT`, `HA_URL`, `HA_TOKEN`,
//! `LOG_DB_PATH`. The configuration is an immutable snapshot; rebinding
//! requires a restart. An invalid configuration is fatal at startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use validator::Validate;

use crate::application::arbitration::ControlPolicy;
use crate::domain::OcppVersion;
use crate::support::ProxyError;

/// Default location: `~/.config/ocpp-proxy/config.toml` (platform dependent).
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|dir| dir.join("ocpp-proxy").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-IP request budget for the REST group.
    pub api_requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            api_requests_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ChargerConfig {
    /// Identity used when the charger does not announce one.
    pub default_id: String,
    /// Heartbeat interval handed out in BootNotification responses.
    pub heartbeat_interval_seconds: u32,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            default_id: "charger".to_string(),
            heartbeat_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct HomeAssistantConfig {
    #[validate(url)]
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Token,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OcppServiceConfig {
    pub id: String,
    #[validate(url)]
    pub url: String,
    #[serde(default = "default_service_version")]
    pub version: OcppVersion,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_service_version() -> OcppVersion {
    OcppVersion::V16
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
    #[validate(nested)]
    pub charger: ChargerConfig,
    #[validate(nested)]
    pub home_assistant: HomeAssistantConfig,

    // ── Arbitration policy ─────────────────────────────────
    pub allow_shared_charging: bool,
    pub preferred_provider: Option<String>,
    #[validate(range(min = 0))]
    pub rate_limit_seconds: i64,
    pub allowed_providers: Vec<String>,
    pub disallowed_providers: Vec<String>,

    // ── Protocol ───────────────────────────────────────────
    pub ocpp_version: OcppVersion,
    pub auto_detect_ocpp_version: bool,

    // ── External sources ───────────────────────────────────
    pub presence_sensor: Option<String>,
    pub override_input_boolean: Option<String>,

    // ── Outbound services & persistence ────────────────────
    #[validate(nested)]
    pub ocpp_services: Vec<OcppServiceConfig>,
    pub log_db_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            charger: ChargerConfig::default(),
            home_assistant: HomeAssistantConfig::default(),
            allow_shared_charging: true,
            preferred_provider: None,
            rate_limit_seconds: 10,
            allowed_providers: Vec::new(),
            disallowed_providers: Vec::new(),
            ocpp_version: OcppVersion::V16,
            auto_detect_ocpp_version: true,
            presence_sensor: None,
            override_input_boolean: None,
            ocpp_services: Vec::new(),
            log_db_path: "ocpp-proxy.sqlite".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `CONFIG_FILE` (or the default path), apply environment
    /// overrides and validate. A missing file yields the defaults; an
    /// unreadable or invalid one is fatal.
    pub fn load() -> Result<Self, ProxyError> {
        let path = std::env::var("CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        let mut config = if path.exists() {
            Self::from_path(&path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate_config()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ProxyError> {
        toml::from_str(raw).map_err(|e| ProxyError::ConfigInvalid(e.to_string()))
    }

    fn apply_env(&mut self) -> Result<(), ProxyError> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ProxyError::ConfigInvalid(format!("PORT: '{port}'")))?;
        }
        if let Ok(url) = std::env::var("HA_URL") {
            self.home_assistant.url = Some(url);
        }
        if let Ok(token) = std::env::var("HA_TOKEN") {
            self.home_assistant.token = Some(token);
        }
        if let Ok(path) = std::env::var("LOG_DB_PATH") {
            self.log_db_path = path;
        }
        Ok(())
    }

    /// Field validation plus the cross-field rules the derive cannot see.
    pub fn validate_config(&self) -> Result<(), ProxyError> {
        self.validate()
            .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for service in &self.ocpp_services {
            if service.id.is_empty() {
                return Err(ProxyError::ConfigInvalid("service id must not be empty".into()));
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ProxyError::ConfigInvalid(format!(
                    "duplicate service id '{}'",
                    service.id
                )));
            }
            match service.auth_type {
                AuthType::Basic if service.username.is_none() || service.password.is_none() => {
                    return Err(ProxyError::ConfigInvalid(format!(
                        "service '{}': basic auth needs username and password",
                        service.id
                    )));
                }
                AuthType::Token if service.token.is_none() => {
                    return Err(ProxyError::ConfigInvalid(format!(
                        "service '{}': token auth needs a token",
                        service.id
                    )));
                }
                _ => {}
            }
        }

        if self.presence_sensor.is_some() || self.override_input_boolean.is_some() {
            if self.home_assistant.url.is_none() || self.home_assistant.token.is_none() {
                return Err(ProxyError::ConfigInvalid(
                    "presence_sensor/override_input_boolean require home_assistant url and token"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.log_db_path)
    }

    /// Immutable policy snapshot for the arbitration engine.
    pub fn control_policy(&self) -> ControlPolicy {
        ControlPolicy {
            allow_shared_charging: self.allow_shared_charging,
            preferred_provider: self.preferred_provider.clone(),
            rate_limit_seconds: self.rate_limit_seconds,
            allowed_providers: self.allowed_providers.clone(),
            disallowed_providers: self.disallowed_providers.clone(),
        }
    }
}
