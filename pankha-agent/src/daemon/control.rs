//! Daemon start/stop/restart and the one-shot runtime log-level change.

use anyhow::Result;
use std::fs;
use std::process;

use crate::config::types::AgentConfig;
use crate::config::validate;
use crate::daemon::pid::*;
use crate::daemon::systemd::is_systemd_service_active;
use crate::daemon::LOG_DIR;

pub fn start_daemon(log_level: Option<String>) -> Result<()> {
    if is_running() {
        anyhow::bail!("Agent is already running (PID: {:?})", get_pid()?);
    }

    let exe_path = std::env::current_exe()?;
    let config_path = exe_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
        .join("config.json");

    if !config_path.exists() {
        eprintln!("ERROR: Configuration file not found: {:?}", config_path);
        eprintln!("\nPlease run the setup wizard first:");
        eprintln!("  ./pankha-agent --setup");
        process::exit(crate::app::cli::exit_codes::MISSING_CONFIG);
    }

    println!(
        "\x1b[32mStarting pankha-agent v{} ({})\x1b[0m",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    );

    ensure_directories()?;
    let log_path = format!("{}/agent.log", LOG_DIR);
    let log_file = fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

    let mut cmd = process::Command::new(&exe_path);
    cmd.arg("--daemon-child");
    if let Some(level) = log_level {
        cmd.arg("--log-level").arg(level);
    }

    let child = cmd
        .current_dir(std::env::current_dir()?)
        .stdin(process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;

    save_pid(child.id())?;

    println!("Agent started successfully (PID: {})", child.id());
    println!("Logs: tail -f {}/agent.log", LOG_DIR);
    Ok(())
}

pub fn stop_daemon() -> Result<()> {
    // A systemd-managed agent must stop through systemctl, or
    // Restart=on-failure brings it right back
    if is_systemd_service_active() {
        println!("Agent is managed by systemd. Using systemctl stop...");
        match process::Command::new("systemctl").args(["stop", "pankha-agent"]).status() {
            Ok(s) if s.success() => {
                println!("Agent stopped via systemd");
                return Ok(());
            }
            Ok(_) => eprintln!("WARNING: systemctl stop failed, falling back to manual stop"),
            Err(e) => eprintln!("WARNING: Could not run systemctl: {}, falling back", e),
        }
    }

    if !is_running() {
        anyhow::bail!("Agent is not running");
    }

    if let Some(pid) = get_pid()? {
        println!("Stopping pankha-agent (PID: {})...", pid);
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };

        for _ in 0..10 {
            if !is_running() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }

        if is_running() {
            println!("WARNING: Force killing agent...");
            unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        }

        remove_pid_file()?;
        println!("Agent stopped");
    }
    Ok(())
}

pub fn restart_daemon(log_level: Option<String>) -> Result<()> {
    println!(
        "\x1b[32mRestarting pankha-agent v{} ({})\x1b[0m",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    );

    if is_systemd_service_active() {
        println!("Agent is managed by systemd. Using systemctl restart...");
        match process::Command::new("systemctl")
            .args(["restart", "pankha-agent"])
            .status()
        {
            Ok(s) if s.success() => {
                println!("Agent restarted via systemd");
                return Ok(());
            }
            Ok(_) => eprintln!("WARNING: systemctl restart failed, falling back"),
            Err(e) => eprintln!("WARNING: Could not run systemctl: {}, falling back", e),
        }
    }

    if is_running() {
        stop_daemon()?;
        std::thread::sleep(std::time::Duration::from_secs(1));
    } else {
        println!("Agent not running, starting it...");
    }

    start_daemon(log_level)
}

/// One-shot `--log-level` against a running agent: persist the new level
/// and nudge the process with SIGHUP to re-read its config.
pub fn set_log_level_runtime(level: &str) -> Result<()> {
    validate::log_level(level)?;

    if !is_running() {
        anyhow::bail!("Agent is not running. Start the agent first with: --start");
    }

    let config_path = std::env::current_exe()?
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?
        .join("config.json");

    let content = std::fs::read_to_string(&config_path)?;
    let mut config: AgentConfig = serde_json::from_str(&content)?;

    let old_level = config.agent.log_level.clone();
    config.agent.log_level = level.to_uppercase();

    let tmp = config_path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&config)?)?;
    std::fs::rename(&tmp, &config_path)?;

    println!("Log level updated: {} → {}", old_level, level.to_uppercase());

    if let Some(pid) = get_pid()? {
        println!("Sending reload signal to agent (PID: {})...", pid);
        unsafe { libc::kill(pid as i32, libc::SIGHUP) };
        println!("✅ Log level changed successfully");
    }
    Ok(())
}
