//! Host proxy indirection: the setting that routes outbound traffic through the proxy port.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};

use crate::error::ProxyError;
use crate::port;

const HTTP_KEY: &str = "http.proxy";
const HTTPS_KEY: &str = "https.proxy";

/// Current `http`/`https` proxy values; empty means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: String,
    pub https: String,
}

impl ProxySettings {
    /// True when both values route through exactly `http://127.0.0.1:<port>`.
    pub fn targets_port(&self, port: u16) -> bool {
        let url = port::proxy_url(port);
        [&self.http, &self.https]
            .iter()
            .all(|value| value.trim_end_matches('/') == url)
    }

    /// True when the indirection points at any loopback proxy.
    pub fn targets_loopback(&self) -> bool {
        self.http.contains("127.0.0.1")
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.https.is_empty()
    }
}

/// External get/set interface for the environment's proxy indirection.
pub trait SystemProxyConfigurator: Send + Sync {
    fn current(&self) -> Result<ProxySettings, ProxyError>;

    /// Route both `http` and `https` through `url`.
    fn point_at(&self, url: &str) -> Result<(), ProxyError>;

    fn clear(&self) -> Result<(), ProxyError>;
}

/// In-process indirection for embedders that apply the value themselves.
#[derive(Debug, Default)]
pub struct MemoryProxySettings {
    inner: Mutex<ProxySettings>,
}

impl MemoryProxySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemProxyConfigurator for MemoryProxySettings {
    fn current(&self) -> Result<ProxySettings, ProxyError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn point_at(&self, url: &str) -> Result<(), ProxyError> {
        let mut settings = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        settings.http = url.to_string();
        settings.https = url.to_string();
        Ok(())
    }

    fn clear(&self) -> Result<(), ProxyError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = ProxySettings::default();
        Ok(())
    }
}

/// Editor-style JSON settings file holding `http.proxy` / `https.proxy` keys.
///
/// Every other key in the file is preserved on write.
#[derive(Debug, Clone)]
pub struct SettingsFileProxy {
    path: PathBuf,
}

impl SettingsFileProxy {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, ProxyError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(ProxyError::Io(e)),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ProxyError::SystemProxy(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(ProxyError::SystemProxy(format!(
                "failed to parse {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn store(&self, map: Map<String, Value>) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(map)).map_err(|e| {
            ProxyError::SystemProxy(format!("failed to serialize settings: {e}"))
        })?;
        fs::write(&self.path, text)?;
        Ok(())
    }

    fn write_both(&self, value: &str) -> Result<(), ProxyError> {
        let mut map = self.load()?;
        map.insert(HTTP_KEY.to_string(), Value::String(value.to_string()));
        map.insert(HTTPS_KEY.to_string(), Value::String(value.to_string()));
        self.store(map)
    }
}

impl SystemProxyConfigurator for SettingsFileProxy {
    fn current(&self) -> Result<ProxySettings, ProxyError> {
        let map = self.load()?;
        let get = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(ProxySettings {
            http: get(HTTP_KEY),
            https: get(HTTPS_KEY),
        })
    }

    fn point_at(&self, url: &str) -> Result<(), ProxyError> {
        self.write_both(url)
    }

    fn clear(&self) -> Result<(), ProxyError> {
        self.write_both("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_settings_round_trip() {
        let settings = MemoryProxySettings::new();
        settings.point_at("http://127.0.0.1:8866").expect("point");
        let current = settings.current().expect("current");
        assert!(current.targets_port(8866));
        assert!(!current.targets_port(8867));
        settings.clear().expect("clear");
        assert!(settings.current().expect("current").is_empty());
    }

    #[test]
    fn port_match_is_exact() {
        let settings = |http: &str, https: &str| ProxySettings {
            http: http.into(),
            https: https.into(),
        };
        let longer = settings("http://127.0.0.1:11000", "http://127.0.0.1:11000");
        assert!(!longer.targets_port(1100));
        assert!(longer.targets_port(11000));

        let slash = settings("http://127.0.0.1:1100/", "http://127.0.0.1:1100");
        assert!(slash.targets_port(1100));

        let http_only = settings("http://127.0.0.1:1100", "");
        assert!(!http_only.targets_port(1100));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = SettingsFileProxy::new(dir.path().join("nested").join("settings.json"));
        assert!(file.current().expect("current").is_empty());
    }

    #[test]
    fn file_settings_preserve_unrelated_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"editor.fontSize": 14, "http.proxy": ""}"#).expect("seed");

        let file = SettingsFileProxy::new(&path);
        file.point_at("http://127.0.0.1:9000").expect("point");
        let current = file.current().expect("current");
        assert_eq!(current.http, "http://127.0.0.1:9000");
        assert_eq!(current.https, "http://127.0.0.1:9000");

        file.clear().expect("clear");
        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["editor.fontSize"], 14);
        assert_eq!(raw["http.proxy"], "");
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2]").expect("seed");
        let err = SettingsFileProxy::new(&path).current().expect_err("array must fail");
        assert!(matches!(err, ProxyError::SystemProxy(_)));
    }
}
