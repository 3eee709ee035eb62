// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gate Configuration Types
//
// Defines the configuration schema for the remote build gate, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Proxy listener settings
// - Builder readiness polling bounds
// - Whole-build retry policy
// - Fast-load registry and desktop relay settings
// - Build timing telemetry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "buildgate/v1";
pub const KIND: &str = "GateConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfigManifest {
    /// API version (must be "buildgate/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GateConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: GateConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfigSpec {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub builder: BuilderConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fast_load: FastLoadConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the local proxy listeners bind to (port is always ephemeral)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Delay between a shutdown-triggering RPC and the proxy actually stopping,
    /// so the triggering response is flushed first
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Liveness probes before a booting builder is declared failed
    #[serde(default = "default_builder_attempts")]
    pub readiness_attempts: u32,

    /// Delay between liveness probes in milliseconds
    #[serde(default = "default_builder_interval_ms")]
    pub readiness_interval_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            readiness_attempts: default_builder_attempts(),
            readiness_interval_ms: default_builder_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whole-build retries for allow-listed transient errors (0 disables retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLoadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Image used for the desktop network relay container
    #[serde(default = "default_relay_image")]
    pub relay_image: String,

    #[serde(default = "default_registry_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_registry_interval_ms")]
    pub readiness_interval_ms: u64,
}

impl Default for FastLoadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_image: default_relay_image(),
            readiness_attempts: default_registry_attempts(),
            readiness_interval_ms: default_registry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// How often buffered step timings are reported
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Bounded poll: `attempts` probes, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// Bounded whole-build retry with fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self { max_retries: 0, backoff: Duration::ZERO }
    }
}

impl BuilderConfig {
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: self.readiness_attempts,
            interval: Duration::from_millis(self.readiness_interval_ms),
        }
    }
}

impl FastLoadConfig {
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: self.readiness_attempts,
            interval: Duration::from_millis(self.readiness_interval_ms),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl Default for GateConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "default".to_string(),
                version: Some("1.0.0".to_string()),
            },
            spec: GateConfigSpec::default(),
        }
    }
}

impl GateConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BUILDGATE_CONFIG_PATH environment variable
    /// 2. ./buildgate.yaml (working directory)
    /// 3. ~/.buildgate/config.yaml (user home)
    /// 4. /etc/buildgate/config.yaml (system, Unix) or C:\ProgramData\Buildgate\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BUILDGATE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./buildgate.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".buildgate").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/buildgate/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Buildgate\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(no_retry) = env_flag("BUILDGATE_NO_RETRY") {
            if no_retry {
                tracing::info!("Environment override: BUILDGATE_NO_RETRY=true");
                self.spec.retry.max_retries = 0;
            }
        }

        if let Some(disabled) = env_flag("BUILDGATE_DISABLE_FAST_LOAD") {
            tracing::info!("Environment override: BUILDGATE_DISABLE_FAST_LOAD={}", disabled);
            self.spec.fast_load.enabled = !disabled;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.proxy.bind_address.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!(
                "spec.proxy.bind_address '{}' is not an IP address",
                self.spec.proxy.bind_address
            );
        }

        if self.spec.builder.readiness_attempts == 0 {
            anyhow::bail!("spec.builder.readiness_attempts must be at least 1");
        }
        if self.spec.builder.readiness_interval_ms == 0 {
            anyhow::bail!("spec.builder.readiness_interval_ms must be greater than 0");
        }

        if self.spec.fast_load.readiness_attempts == 0 {
            anyhow::bail!("spec.fast_load.readiness_attempts must be at least 1");
        }
        if self.spec.fast_load.readiness_interval_ms == 0 {
            anyhow::bail!("spec.fast_load.readiness_interval_ms must be greater than 0");
        }
        if self.spec.fast_load.relay_image.is_empty() {
            anyhow::bail!("spec.fast_load.relay_image cannot be empty");
        }

        if self.spec.telemetry.flush_interval_ms == 0 {
            anyhow::bail!("spec.telemetry.flush_interval_ms must be greater than 0");
        }

        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                name,
                val
            );
            None
        }
    }
}


fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_builder_attempts() -> u32 {
    120
}

fn default_builder_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_relay_image() -> String {
    "alpine/socat:1.8.0.1".to_string()
}

fn default_registry_attempts() -> u32 {
    50
}

fn default_registry_interval_ms() -> u64 {
    100
}

fn default_flush_interval_ms() -> u64 {
    5000
}
