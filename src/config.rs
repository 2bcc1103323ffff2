use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Default proxy listen port.
pub const DEFAULT_PORT: u16 = 8866;

/// Executable looked up on PATH when no custom path is configured.
pub const DEFAULT_EXECUTABLE: &str = "mitmdump";

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_response_status() -> u16 {
    204
}

fn default_idle_timeout() -> u32 {
    60
}

fn default_host_process_names() -> Vec<String> {
    vec!["Electron".into(), "Code".into(), "node".into()]
}

/// Top‑level on-disk configuration (`interceptd.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Interception on/off. A disabled config still cleans up stale indirection.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Custom proxy executable; falls back to `mitmdump` on PATH when absent or missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addon_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<PathBuf>,
    /// Base for relative `blacklist` paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_response_status")]
    pub response_status: u16,
    #[serde(default)]
    pub response_body: String,
    #[serde(default = "default_true")]
    pub log_blocked: bool,
    /// Minutes without proxy output before the owner shuts down; 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u32,
    /// Parent command names that mark a proxy as supervised (substring match).
    #[serde(default = "default_host_process_names")]
    pub host_process_names: Vec<String>,
    /// JSON settings file receiving `http.proxy` / `https.proxy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<PathBuf>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_PORT,
            executable: None,
            addon_script: None,
            blacklist: None,
            workspace_root: None,
            response_status: default_response_status(),
            response_body: String::new(),
            log_blocked: true,
            idle_timeout_minutes: default_idle_timeout(),
            host_process_names: default_host_process_names(),
            settings_file: None,
        }
    }
}

/// `<data dir>/interceptd`, home of the default addon, blacklist and settings file.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(std::env::temp_dir))
        .join("interceptd")
}

/// Default config file location: `<config dir>/interceptd/interceptd.toml`.
pub fn default_config_path() -> Result<PathBuf, ProxyError> {
    let dir = dirs::config_dir().ok_or_else(|| {
        ProxyError::ConfigInvalid("could not determine config directory".into())
    })?;
    Ok(dir.join("interceptd").join("interceptd.toml"))
}

/// Location of the interception CA certificate generated by the proxy on first run.
pub fn certificate_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".mitmproxy")
        .join("mitmproxy-ca-cert.pem")
}

impl InterceptorConfig {
    /// Read `path`, writing a default file first when it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ProxyError> {
        if !path.exists() {
            log::info!(
                "Config not found at {}, creating default configuration",
                path.display()
            );
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let default_toml = toml::to_string_pretty(&Self::default()).map_err(|e| {
                ProxyError::ConfigInvalid(format!("failed to serialize default config: {e}"))
            })?;
            fs::write(path, default_toml)?;
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ProxyError> {
        toml::from_str(text)
            .map_err(|e| ProxyError::ConfigInvalid(format!("failed to parse config: {e}")))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_file
            .clone()
            .unwrap_or_else(|| data_dir().join("proxy-settings.json"))
    }

    fn resolve_blacklist(&self) -> PathBuf {
        match &self.blacklist {
            None => data_dir().join("blacklist.json"),
            Some(path) if path.is_relative() => match &self.workspace_root {
                Some(root) => root.join(path),
                None => path.clone(),
            },
            Some(path) => path.clone(),
        }
    }

    fn resolve_executable(&self) -> PathBuf {
        if let Some(custom) = &self.executable
            && custom.exists()
        {
            return custom.clone();
        }
        which::which(DEFAULT_EXECUTABLE).unwrap_or_else(|_| {
            log::debug!("{DEFAULT_EXECUTABLE} not found in PATH, using bare name");
            PathBuf::from(DEFAULT_EXECUTABLE)
        })
    }

    /// Build the immutable per-session proxy config. Existence checks happen in
    /// [`ProxyConfig::validate`], right before a spawn.
    pub fn to_proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            port: self.port,
            executable_path: self.resolve_executable(),
            addon_script_path: self
                .addon_script
                .clone()
                .unwrap_or_else(|| data_dir().join("mitm_addon.py")),
            blacklist_path: self.resolve_blacklist(),
            response_status: self.response_status,
            response_body: self.response_body.clone(),
            log_blocked: self.log_blocked,
            idle_timeout_minutes: self.idle_timeout_minutes,
        }
    }
}

/// Immutable settings for one proxy session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host-unique identity of the proxy across independent instances.
    pub port: u16,
    pub executable_path: PathBuf,
    pub addon_script_path: PathBuf,
    pub blacklist_path: PathBuf,
    pub response_status: u16,
    pub response_body: String,
    pub log_blocked: bool,
    pub idle_timeout_minutes: u32,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.port == 0 {
            return Err(ProxyError::ConfigInvalid("port must be in 1..=65535".into()));
        }
        if !(100..=599).contains(&self.response_status) {
            return Err(ProxyError::ConfigInvalid(format!(
                "response status {} is not a valid HTTP status",
                self.response_status
            )));
        }
        if !self.blacklist_path.exists() {
            return Err(ProxyError::ConfigInvalid(format!(
                "blacklist not found: {}",
                self.blacklist_path.display()
            )));
        }
        if !self.addon_script_path.exists() {
            return Err(ProxyError::ConfigInvalid(format!(
                "addon not found: {}",
                self.addon_script_path.display()
            )));
        }
        Ok(())
    }

    /// Fixed argument set handed to the proxy executable.
    pub fn command_args(&self) -> Vec<String> {
        vec![
            "--listen-port".into(),
            self.port.to_string(),
            "--set".into(),
            format!("blacklist_config={}", self.blacklist_path.display()),
            "--set".into(),
            format!("response_status={}", self.response_status),
            "--set".into(),
            format!("response_body={}", self.response_body),
            "--set".into(),
            format!("log_blocked={}", self.log_blocked),
            "-s".into(),
            self.addon_script_path.display().to_string(),
            "--ssl-insecure".into(),
        ]
    }
}

/// Protocol timings. Defaults are the production values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub reconcile_interval: Duration,
    pub idle_check_interval: Duration,
    /// Alive at the end of this window ⇒ spawn counts as started.
    pub startup_window: Duration,
    /// Pause before re-checking the port after a lost startup race.
    pub race_retry_delay: Duration,
    pub graceful_stop: Duration,
    /// Pause between killing an orphan and respawning on its port.
    pub port_release_wait: Duration,
    pub version_check_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            idle_check_interval: Duration::from_secs(60),
            startup_window: Duration::from_secs(2),
            race_retry_delay: Duration::from_secs(2),
            graceful_stop: Duration::from_secs(3),
            port_release_wait: Duration::from_secs(1),
            version_check_timeout: Duration::from_secs(5),
        }
    }
}
