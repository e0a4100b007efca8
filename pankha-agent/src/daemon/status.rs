//! Status display and installation health check.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::config::persistence::{default_config_path, load_config};
use crate::daemon::pid::*;
use crate::daemon::systemd::has_systemd;
use crate::daemon::{LOG_DIR, SYSTEMD_SERVICE_PATH};

pub async fn show_status() -> Result<()> {
    println!(
        "\x1b[32mpankha-agent v{} ({})\x1b[0m",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    );
    println!("================================");

    if is_running() {
        if let Some(pid) = get_pid()? {
            println!("Status: Running (PID: {})", pid);

            let log_path = format!("{}/agent.log", LOG_DIR);
            if Path::new(&log_path).exists() {
                println!("\nLast 5 log entries:");
                if let Ok(content) = fs::read_to_string(&log_path) {
                    let lines: Vec<&str> = content.lines().rev().take(5).collect();
                    for line in lines.iter().rev() {
                        println!("   {}", line);
                    }
                }
            }
        }
    } else {
        println!("Status: Not running");
    }

    println!("\nConfiguration:");
    match load_config(&default_config_path()?).await {
        Ok(config) => {
            println!("   Server: {}", config.backend.server_url);
            println!("   Update Interval: {}s", config.agent.update_interval);
            println!("   Agent Name: {}", config.agent.name);
        }
        Err(_) => println!("   Error: Could not load configuration"),
    }

    Ok(())
}

/// Verify config, directories, and service installation. Returns false if
/// any required piece is missing.
pub fn run_health_check() -> Result<bool> {
    println!(
        "\x1b[32mpankha-agent v{} ({})\x1b[0m",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH
    );
    println!("Health Check");
    println!("============\n");

    let mut all_ok = true;

    let config_path = default_config_path()?;
    if config_path.exists() {
        println!("✓ Config file: {}", config_path.display());
    } else {
        println!("✗ Config file: NOT FOUND");
        println!("  Run: ./pankha-agent --setup");
        all_ok = false;
    }

    if Path::new("/run/pankha-agent").exists() {
        println!("✓ Runtime dir: /run/pankha-agent");
    } else {
        println!("⚠ Runtime dir: Not created (will be created on start)");
    }

    if Path::new(LOG_DIR).exists() {
        println!("✓ Log dir: {}", LOG_DIR);
    } else {
        println!("⚠ Log dir: Not created (will be created on start)");
    }

    if has_systemd() {
        if Path::new(SYSTEMD_SERVICE_PATH).exists() {
            println!("✓ systemd service: installed");
        } else {
            println!("⚠ systemd service: not installed (--install-service)");
        }
    } else {
        println!("⚠ systemd: not available on this system");
    }

    if is_running() {
        println!("✓ Agent: running (PID: {:?})", get_pid()?.unwrap_or(0));
    } else {
        println!("⚠ Agent: not running");
    }

    println!();
    if all_ok {
        println!("All checks passed");
    } else {
        println!("Some checks failed");
    }
    Ok(all_ok)
}
