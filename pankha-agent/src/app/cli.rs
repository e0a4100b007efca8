//! Command-line argument definitions (clap).

use clap::Parser;

/// Process exit codes shared by the CLI verbs.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const MISSING_CONFIG: i32 = 2;
    pub const PRIVILEGE_DENIED: i32 = 3;
    pub const NO_HARDWARE: i32 = 4;
}

#[derive(Parser, Debug)]
#[command(name = "pankha-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pankha Cross-Platform Hardware Monitoring Agent", long_about = None)]
pub struct Args {
    // === Setup & Service ===
    /// Run interactive setup wizard
    #[arg(short = 'e', long, help_heading = "Setup & Service")]
    pub setup: bool,

    /// Install systemd service for auto-start on boot
    #[arg(short = 'I', long = "install-service", help_heading = "Setup & Service")]
    pub install_service: bool,

    /// Uninstall systemd service
    #[arg(short = 'U', long = "uninstall-service", help_heading = "Setup & Service")]
    pub uninstall_service: bool,

    // === Daemon Control ===
    /// Start the agent daemon in background
    #[arg(short = 's', long, help_heading = "Daemon Control")]
    pub start: bool,

    /// Stop the agent daemon
    #[arg(short = 'x', long, help_heading = "Daemon Control")]
    pub stop: bool,

    /// Restart the agent daemon
    #[arg(short = 'r', long, help_heading = "Daemon Control")]
    pub restart: bool,

    // === Status & Logs ===
    /// Show agent status
    #[arg(short = 'i', long = "status", help_heading = "Status & Logs")]
    pub status: bool,

    /// Show agent logs (tail -f by default, or tail -n <lines> if provided)
    #[arg(short = 'l', long = "logs", help_heading = "Status & Logs")]
    pub logs: Option<Option<usize>>,

    /// Set log level (TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL). One-shot
    /// against a running agent, or combined with --start/--restart
    #[arg(long = "log-level", help_heading = "Status & Logs")]
    pub log_level: Option<String>,

    // === Config & Debug ===
    /// Show current configuration
    #[arg(short = 'c', long, help_heading = "Config & Debug")]
    pub config: bool,

    /// Run health check (verify config, service, directories)
    #[arg(long, help_heading = "Config & Debug")]
    pub check: bool,

    /// Test mode (hardware discovery only, no network)
    #[arg(long, help_heading = "Config & Debug")]
    pub test: bool,

    /// Internal flag for daemon child process (do not use directly)
    #[arg(long, hide = true)]
    pub daemon_child: bool,
}
