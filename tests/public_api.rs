use std::fs;
use std::net::TcpListener;
use std::sync::Arc;

use interceptd::{
    InterceptorConfig, MemoryProxySettings, OwnershipState, ProxyError, ProxyManager,
    ProxyStatus, SettingsFileProxy, SystemProxyConfigurator, port,
};

#[test]
fn config_file_drives_proxy_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let text = format!(
        r#"
enabled = true
port = 9911
blacklist = "rules/blacklist.json"
workspace_root = "{}"
response_status = 403
idle_timeout_minutes = 0
"#,
        dir.path().display()
    );
    let cfg = InterceptorConfig::from_toml(&text).expect("parse");
    let proxy = cfg.to_proxy_config();

    assert_eq!(proxy.port, 9911);
    assert_eq!(proxy.blacklist_path, dir.path().join("rules/blacklist.json"));
    assert_eq!(proxy.response_status, 403);
    assert!(matches!(proxy.validate(), Err(ProxyError::ConfigInvalid(_))));
}

#[test]
fn default_config_file_is_generated_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("interceptd.toml");

    let cfg = InterceptorConfig::load_or_create(&path).expect("create");
    assert!(path.exists());
    assert!(!cfg.enabled);
    assert_eq!(cfg.port, 8866);

    fs::write(&path, "enabled = true\nport = 9000\n").expect("edit");
    let cfg = InterceptorConfig::load_or_create(&path).expect("reload");
    assert!(cfg.enabled);
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.idle_timeout_minutes, 60);
}

#[test]
fn stale_settings_file_is_cleared_but_other_keys_survive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{"editor.fontSize": 13, "http.proxy": "http://127.0.0.1:8866", "https.proxy": "http://127.0.0.1:8866"}"#,
    )
    .expect("seed");

    let settings = SettingsFileProxy::new(&path);
    assert!(settings.current().expect("read").targets_loopback());
    settings.clear().expect("clear");

    assert!(settings.current().expect("read").is_empty());
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).expect("read back")).expect("json");
    assert_eq!(json["editor.fontSize"], 13);
}

#[test]
fn bound_listener_is_seen_until_dropped() {
    let listener = TcpListener::bind("0.0.0.0:0").expect("bind");
    let bound = listener.local_addr().expect("addr").port();
    assert!(port::is_port_bound(bound));
    drop(listener);
    assert!(!port::is_port_bound(bound));
}

#[tokio::test]
async fn unavailable_executable_fails_start_without_side_effects() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("blacklist.json"), "{}").expect("blacklist");
    fs::write(dir.path().join("addon.py"), "").expect("addon");
    let free = TcpListener::bind("0.0.0.0:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port();

    let cfg = InterceptorConfig::from_toml(&format!(
        r#"
enabled = true
port = {free}
executable = "{exe}"
addon_script = "{addon}"
blacklist = "{blacklist}"
"#,
        exe = dir.path().join("no-such-proxy").display(),
        addon = dir.path().join("addon.py").display(),
        blacklist = dir.path().join("blacklist.json").display(),
    ))
    .expect("parse");
    let mut proxy = cfg.to_proxy_config();
    // force the missing custom path instead of any mitmdump on PATH
    proxy.executable_path = dir.path().join("no-such-proxy");

    let settings = Arc::new(MemoryProxySettings::new());
    let manager = ProxyManager::builder().configurator(settings.clone()).build();
    let err = manager.start(proxy).await.expect_err("must fail");

    assert!(matches!(err, ProxyError::ExecutableUnavailable { .. }));
    assert_eq!(manager.ownership(), OwnershipState::NotRunning);
    assert_eq!(manager.status(), ProxyStatus::default());
    assert!(settings.current().expect("settings").is_empty());
}

#[tokio::test]
async fn stop_without_start_is_harmless() {
    let settings = Arc::new(MemoryProxySettings::new());
    settings.point_at("http://127.0.0.1:1").expect("seed");
    let manager = ProxyManager::builder().configurator(settings.clone()).build();

    manager.stop().await;
    assert!(!manager.status().running);
    assert!(settings.current().expect("settings").is_empty());
    assert!(matches!(manager.restart().await, Err(ProxyError::NoPriorConfig)));
}
