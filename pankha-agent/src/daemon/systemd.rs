//! systemd service install/uninstall and management detection.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process;

use crate::daemon::{SYSTEMD_SERVICE_PATH, SYSTEMD_SERVICE_TEMPLATE};

pub fn has_systemd() -> bool {
    Path::new("/run/systemd/system").exists()
}

/// Whether the pankha-agent systemd unit exists and is active. Stop and
/// restart delegate to systemctl in that case, otherwise Restart=on-failure
/// would fight a manual kill.
pub fn is_systemd_service_active() -> bool {
    if !has_systemd() || !Path::new(SYSTEMD_SERVICE_PATH).exists() {
        return false;
    }
    process::Command::new("systemctl")
        .args(["is-active", "--quiet", "pankha-agent"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Install or repair the systemd unit (idempotent).
pub fn install_systemd_service() -> Result<()> {
    if !is_root() {
        anyhow::bail!("Root privileges required. Run with: sudo ./pankha-agent --install-service");
    }

    if !has_systemd() {
        println!("❌ systemd not detected on this system.");
        println!("   The agent can still run manually with: ./pankha-agent --start");
        return Ok(());
    }

    let exe_path = std::env::current_exe()?;
    let work_dir = exe_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine executable directory"))?;

    let service_content = SYSTEMD_SERVICE_TEMPLATE
        .replace("{{EXEC_PATH}}", exe_path.to_str().unwrap_or("/opt/pankha-agent/pankha-agent"))
        .replace("{{WORK_DIR}}", work_dir.to_str().unwrap_or("/opt/pankha-agent"));

    fs::write(SYSTEMD_SERVICE_PATH, service_content)
        .context("Failed to write systemd service file")?;

    let status = process::Command::new("systemctl").args(["daemon-reload"]).status()?;
    if !status.success() {
        anyhow::bail!("systemctl daemon-reload failed");
    }
    let status = process::Command::new("systemctl")
        .args(["enable", "pankha-agent"])
        .status()?;
    if !status.success() {
        anyhow::bail!("systemctl enable failed");
    }

    println!("✅ systemd service installed: {}", SYSTEMD_SERVICE_PATH);
    println!("   Start now with: sudo systemctl start pankha-agent");
    Ok(())
}

pub fn uninstall_systemd_service() -> Result<()> {
    if !is_root() {
        anyhow::bail!("Root privileges required. Run with: sudo ./pankha-agent --uninstall-service");
    }

    if !Path::new(SYSTEMD_SERVICE_PATH).exists() {
        println!("Service not installed, nothing to do.");
        return Ok(());
    }

    let _ = process::Command::new("systemctl")
        .args(["stop", "pankha-agent"])
        .status();
    let _ = process::Command::new("systemctl")
        .args(["disable", "pankha-agent"])
        .status();

    fs::remove_file(SYSTEMD_SERVICE_PATH).context("Failed to remove systemd service file")?;
    let _ = process::Command::new("systemctl").args(["daemon-reload"]).status();

    println!("✅ systemd service uninstalled");
    Ok(())
}
