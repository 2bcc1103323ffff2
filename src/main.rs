mod cli;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use interceptd::arbiter::{OrphanVerdict, classify_orphan};
use interceptd::config::{self, InterceptorConfig};
use interceptd::inspect::Lookup;
use interceptd::{
    EventKind, PlatformInspector, ProcessInspector, ProxyEvent, ProxyManager, SettingsFileProxy,
    SystemProxyConfigurator, port,
};
use log::{debug, error, info, warn};

/// How often the foreground loop checks for signals and session end.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    // Initialize logger with custom format
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            eprintln!("The proxy supervisor cannot start without an async runtime.");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    match args.sub.unwrap_or(cli::Cmd::Run { config: None }) {
        cli::Cmd::Run { config } => run_supervisor(config).await,
        cli::Cmd::Status { config } => handle_status(config),
        cli::Cmd::Cleanup { config } => handle_cleanup(config),
        cli::Cmd::CertPath => {
            println!("{}", config::certificate_path().display());
            Ok(())
        }
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<InterceptorConfig> {
    let cfg_path = match config_path {
        Some(path) => path,
        None => config::default_config_path()?,
    };
    let cfg = InterceptorConfig::load_or_create(&cfg_path)
        .with_context(|| format!("Failed to load config {}", cfg_path.display()))?;
    info!("Using config from: {}", cfg_path.display());
    Ok(cfg)
}

/// Clear loopback indirection a crashed instance left behind while interception is off.
fn clean_stale_indirection(cfg: &InterceptorConfig, settings: &dyn SystemProxyConfigurator) {
    if cfg.enabled {
        return;
    }
    match settings.current() {
        Ok(current) if current.targets_loopback() => {
            warn!(
                "Found stale proxy settings ({}) while interception is disabled, cleaning up",
                current.http
            );
            if let Err(e) = settings.clear() {
                error!("Failed to clean up stale proxy settings: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Could not read proxy settings: {e}"),
    }
}

async fn run_supervisor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let settings = Arc::new(SettingsFileProxy::new(cfg.settings_path()));
    clean_stale_indirection(&cfg, settings.as_ref());

    if !cfg.enabled {
        info!("Interception is disabled; set `enabled = true` to supervise the proxy");
        return Ok(());
    }

    signals::install_signal_handlers()?;
    let manager = ProxyManager::builder()
        .inspector(Arc::new(PlatformInspector::new()))
        .configurator(settings)
        .host_process_names(cfg.host_process_names.clone())
        .build();
    spawn_event_logger(manager.events());

    let state = manager
        .start(cfg.to_proxy_config())
        .await
        .context("Failed to start proxy")?;
    info!(
        "interceptd started (pid {}, {state:?} on port {})",
        std::process::id(),
        cfg.port
    );

    let mut status = manager.subscribe_status();
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tick.tick().await;
        if let Some(sig) = signals::check_signals() {
            info!("Received {sig}, shutting down");
            break;
        }
        if !status.borrow_and_update().running {
            info!("Proxy session ended");
            break;
        }
    }

    manager.stop().await;
    info!("interceptd exiting");
    Ok(())
}

/// Drain lifecycle events into the log on a plain thread.
fn spawn_event_logger(rx: Receiver<ProxyEvent>) {
    std::thread::spawn(move || {
        for evt in rx {
            let line = serde_json::to_string(&evt).unwrap_or_else(|_| format!("{:?}", evt.kind));
            match evt.kind {
                // already logged by the output forwarder
                EventKind::BlockedRequest { .. } => debug!("event: {line}"),
                _ => info!("event: {line}"),
            }
        }
    });
}

/// Handle status command - who serves the port, and is it supervised
fn handle_status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let listen_port = cfg.port;

    if !port::is_port_bound(listen_port) {
        println!("no proxy on port {listen_port}");
        std::process::exit(1);
    }
    println!("proxy listening on {}", port::proxy_url(listen_port));

    let inspector = PlatformInspector::new();
    match inspector.find_owning_pid(listen_port) {
        Lookup::Found(pid) => {
            println!("owner pid: {pid}");
            match inspector.parent_of(pid) {
                Lookup::Found(parent) => {
                    println!("parent: {} ({})", parent.ppid, parent.command);
                }
                Lookup::Missing => println!("parent: unresolvable"),
                Lookup::Unknown(reason) => println!("parent: unknown ({reason})"),
            }
        }
        Lookup::Missing => println!("owner pid: unresolvable"),
        Lookup::Unknown(reason) => println!("owner pid: unknown ({reason})"),
    }

    match classify_orphan(&inspector, listen_port, &cfg.host_process_names) {
        OrphanVerdict::Healthy { parent_command, .. } => {
            println!("verdict: supervised by {parent_command}");
        }
        OrphanVerdict::Orphaned { reason, .. } => println!("verdict: orphaned ({reason})"),
        OrphanVerdict::Uncertain { reason } => println!("verdict: uncertain ({reason})"),
    }

    let settings = SettingsFileProxy::new(cfg.settings_path());
    match settings.current() {
        Ok(current) if current.is_empty() => println!("indirection: none"),
        Ok(current) => println!("indirection: {}", current.http),
        Err(e) => println!("indirection: unreadable ({e})"),
    }
    Ok(())
}

/// Handle cleanup command - clear proxy indirection unconditionally
fn handle_cleanup(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let settings = SettingsFileProxy::new(cfg.settings_path());
    settings
        .clear()
        .with_context(|| format!("Failed to clear {}", settings.path().display()))?;
    println!("cleared proxy settings in {}", settings.path().display());
    Ok(())
}
