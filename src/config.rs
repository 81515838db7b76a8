use crate::container::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the hub
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration (ports, paths, backend selection)
    #[serde(default)]
    pub server: ServerConfig,

    /// External tools the hub shells out to
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Payload server settings
    #[serde(default)]
    pub payload: PayloadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the reverse proxy listens on (default: 8080)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port the hub's own UI/API listens on (default: 8000)
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    /// Container backend used to build and launch environments
    #[serde(default)]
    pub backend: BackendKind,

    /// Root directory holding one subdirectory per built environment
    #[serde(default = "default_environments_dir")]
    pub environments_dir: PathBuf,

    /// Path of the generated reverse-proxy configuration file
    #[serde(default = "default_proxy_conf_path")]
    pub proxy_conf_path: PathBuf,
}

/// Commands for the external tools the hub drives.
///
/// Kept configurable so deployments can point at wrappers and tests can
/// substitute stubs.
#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// Package-environment build tool (default: micromamba)
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    /// Image build/run tool (default: docker)
    #[serde(default = "default_image_builder")]
    pub image_builder: String,

    /// Reverse proxy binary (default: nginx)
    #[serde(default = "default_proxy_command")]
    pub proxy: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayloadConfig {
    /// Executable launched inside each built environment
    #[serde(default = "default_payload_command")]
    pub command: String,

    /// Public path prefix under which payload servers are proxied
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Fixed port the payload server binds inside an image (default: 5000)
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Dependencies appended to every environment manifest so the payload
    /// server is always installable
    #[serde(default = "default_payload_dependencies")]
    pub dependencies: Vec<String>,

    /// Maximum seconds to wait for a started payload server to respond
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between liveness probes in milliseconds (default: 100)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

impl PayloadConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            hub_port: default_hub_port(),
            backend: BackendKind::default(),
            environments_dir: default_environments_dir(),
            proxy_conf_path: default_proxy_conf_path(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            package_manager: default_package_manager(),
            image_builder: default_image_builder(),
            proxy: default_proxy_command(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            command: default_payload_command(),
            base_path: default_base_path(),
            internal_port: default_internal_port(),
            dependencies: default_payload_dependencies(),
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_hub_port() -> u16 {
    8000
}

fn default_environments_dir() -> PathBuf {
    PathBuf::from("environments")
}

fn default_proxy_conf_path() -> PathBuf {
    PathBuf::from("etc/nginx/sites.d/default-site.conf")
}

fn default_package_manager() -> String {
    "micromamba".to_string()
}

fn default_image_builder() -> String {
    "docker".to_string()
}

fn default_proxy_command() -> String {
    "nginx".to_string()
}

fn default_payload_command() -> String {
    "payload-server".to_string()
}

fn default_base_path() -> String {
    "/payload".to_string()
}

fn default_internal_port() -> u16 {
    5000
}

fn default_payload_dependencies() -> Vec<String> {
    vec!["payload-server".to_string()]
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_probe_interval() -> u64 {
    100
}
