//! Pankha Cross-Platform Agent
//!
//! Hardware monitoring and fan control agent. Discovers sensors and fans,
//! runs the local control loop, and maintains a reconnecting WebSocket
//! session to the hub. The control loop keeps hardware safe even while the
//! hub is unreachable.

mod app;
mod config;
mod control;
mod daemon;
mod hardware;
mod websocket;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::process;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use app::cli::{exit_codes, Args};
use app::logging;
use config::persistence::{default_config_path, load_config, ConfigStore};
use control::engine::ControlEngine;
use websocket::client::WebSocketClient;
use websocket::SessionHandle;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!();
            Args::command().print_help().unwrap();
            process::exit(exit_codes::FAILURE);
        }
    };

    // Management verbs run before any async machinery
    #[cfg(target_os = "linux")]
    {
        if args.install_service {
            if let Err(e) = daemon::systemd::install_systemd_service() {
                eprintln!("ERROR: {}", e);
                process::exit(exit_codes::PRIVILEGE_DENIED);
            }
            return Ok(());
        }
        if args.uninstall_service {
            if let Err(e) = daemon::systemd::uninstall_systemd_service() {
                eprintln!("ERROR: {}", e);
                process::exit(exit_codes::PRIVILEGE_DENIED);
            }
            return Ok(());
        }
        if args.start {
            return daemon::control::start_daemon(args.log_level);
        }
        if args.stop {
            return daemon::control::stop_daemon();
        }
        if args.restart {
            return daemon::control::restart_daemon(args.log_level);
        }
        if args.status {
            return daemon::status::show_status().await;
        }
        if args.check {
            let ok = daemon::status::run_health_check()?;
            process::exit(if ok { exit_codes::OK } else { exit_codes::FAILURE });
        }
        if let Some(lines) = args.logs {
            return tail_logs(lines);
        }
        // --log-level alone is a one-shot change against the running agent
        if args.log_level.is_some() && !args.daemon_child && !args.test {
            let level = args.log_level.as_deref().unwrap();
            return daemon::control::set_log_level_runtime(level);
        }
    }

    // Logging priority: flag, then LOG_LEVEL env, then config, then info
    let log_level = if let Some(level) = args.log_level.as_ref() {
        level.clone()
    } else if let Ok(env_level) = std::env::var("LOG_LEVEL") {
        env_level
    } else {
        "info".to_string()
    };
    logging::init_tracing(logging::filter_for_level(&log_level));

    #[cfg(target_os = "linux")]
    if args.daemon_child {
        daemon::pid::ensure_directories()?;
        daemon::pid::save_pid(process::id())?;
    }

    info!(
        "Pankha Agent v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    );

    if args.config {
        let config = load_config(&default_config_path()?).await?;
        println!("\n{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if args.setup {
        config::setup::run_setup_wizard(None).await?;
        return Ok(());
    }

    let config_path = default_config_path()?;

    if args.test {
        // Discovery only, no network
        let config = load_config(&config_path).await?;
        let monitor = hardware::platform_monitor(config.hardware.clone());
        let sensors = monitor.discover_sensors().await?;
        let fans = monitor.discover_fans().await?;
        info!("Discovered {} sensors and {} fans", sensors.len(), fans.len());
        if sensors.is_empty() && fans.is_empty() {
            error!("Hardware discovery found nothing");
            process::exit(exit_codes::NO_HARDWARE);
        }
        return Ok(());
    }

    if !config_path.exists() {
        eprintln!("ERROR: Configuration file not found: {:?}", config_path);
        eprintln!("\nPlease run the setup wizard first:");
        eprintln!("  ./pankha-agent --setup");
        process::exit(exit_codes::MISSING_CONFIG);
    }

    let config = load_config(&config_path).await?;
    // The config's level applies unless the flag or env already chose one
    if args.log_level.is_none() && std::env::var("LOG_LEVEL").is_err() {
        logging::set_level(&config.agent.log_level);
    }
    let store = ConfigStore::new(config.clone(), config_path);

    let monitor = hardware::platform_monitor(config.hardware.clone());
    let session = SessionHandle::new();
    let (engine, engine_tx, disabled_fans) =
        ControlEngine::new(monitor.clone(), store.clone(), session.clone());
    let client = Arc::new(WebSocketClient::new(
        store.clone(),
        monitor.clone(),
        session.clone(),
        engine_tx,
        disabled_fans,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Config-change listener: SIGHUP re-reads the file, re-applies the log
    // level, and announces the locally-originated change to the hub
    #[cfg(unix)]
    {
        let store = store.clone();
        let session = session.clone();
        tokio::spawn(async move {
            use pankha_protocol::frames::AgentFrame;
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                match store.reload().await {
                    Ok(config) => {
                        logging::set_level(&config.agent.log_level);
                        if let Ok(data) = serde_json::to_value(&config) {
                            session
                                .send_reliable(AgentFrame::UpdateConfig { data })
                                .await;
                        }
                    }
                    Err(e) => error!("Config reload failed: {}", e),
                }
            }
        });
    }

    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));

    let client_shutdown = shutdown_rx.clone();
    let client_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run(client_shutdown).await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received (Ctrl+C)");
    let _ = shutdown_tx.send(true);

    // The engine performs its final safety write before exiting
    if let Err(e) = engine_task.await {
        error!("Control loop task error: {}", e);
    }
    client_task.abort();
    let _ = client_task.await;

    #[cfg(target_os = "linux")]
    if let Ok(Some(pid)) = daemon::pid::get_pid() {
        if pid == process::id() {
            let _ = daemon::pid::remove_pid_file();
            info!("PID file cleaned up");
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}

#[cfg(target_os = "linux")]
fn tail_logs(lines: Option<usize>) -> Result<()> {
    let log_path = format!("{}/agent.log", daemon::LOG_DIR);
    let mut cmd = process::Command::new("tail");

    match lines {
        Some(n) => {
            println!("Showing last {} log entries...\n", n);
            cmd.arg("-n").arg(n.to_string());
        }
        None => {
            println!("Showing live agent logs (Ctrl+C to exit)...\n");
            cmd.arg("-f");
        }
    }

    cmd.arg(&log_path);
    let status = cmd.status()?;
    process::exit(status.code().unwrap_or(exit_codes::FAILURE));
}
