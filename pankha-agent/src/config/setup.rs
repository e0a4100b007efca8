//! Interactive setup wizard for first-run configuration.

use anyhow::Result;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::config::persistence::{default_config_path, load_config, save_config};
use crate::config::types::*;
use crate::hardware::{self, HardwareMonitor};

fn prompt(question: &str) -> Result<String> {
    print!("{}", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().to_string())
}

pub async fn run_setup_wizard(config_path: Option<&str>) -> Result<()> {
    let config_file = if let Some(p) = config_path {
        PathBuf::from(p)
    } else {
        default_config_path()?
    };

    println!("\n╔══════════════════════════════════════╗");
    println!("║      Pankha Agent Setup Wizard       ║");
    println!("╚══════════════════════════════════════╝");
    println!("Build: \x1b[32mpankha-agent v{} ({})\x1b[0m\n", env!("CARGO_PKG_VERSION"), std::env::consts::ARCH);

    // Load existing config if present; keep its identity on re-run
    let existing_config = if config_file.exists() {
        println!("⚠️  Config file already exists: {:?}", config_file);
        if !prompt("Overwrite? (y/N): ")?.eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }
        load_config(&config_file).await.ok()
    } else {
        None
    };

    println!("\n📋 Configuration:\n");
    println!("Values in [brackets] are defaults - press Enter to use them.\n");

    let mut config = existing_config.clone().unwrap_or_default();

    let answer = prompt(&format!("Agent Name [{}]: ", config.agent.name))?;
    if !answer.is_empty() {
        config.agent.name = answer;
    }

    let answer = prompt(&format!("Backend Server URL [{}]: ", config.backend.server_url))?;
    if !answer.is_empty() {
        config.backend.server_url = answer;
    }

    let answer = prompt(&format!("Update Interval (seconds) [{}]: ", config.agent.update_interval))?;
    if let Ok(interval) = answer.parse::<f64>() {
        config.agent.update_interval = interval.clamp(0.5, 30.0);
    }

    let answer = prompt("Enable Fan Control? (Y/n): ")?;
    config.hardware.enable_fan_control = !answer.eq_ignore_ascii_case("n");

    let answer = prompt(&format!(
        "Fan safety minimum percentage (0-100%, default {}, 0=allow stop): ",
        config.hardware.fan_safety_minimum
    ))?;
    if let Ok(min) = answer.parse::<u8>() {
        config.hardware.fan_safety_minimum = min.min(100);
    }

    let answer = prompt(&format!(
        "Failsafe fan speed while disconnected (0-100%) [{}]: ",
        config.hardware.failsafe_speed
    ))?;
    if let Ok(speed) = answer.parse::<u8>() {
        config.hardware.failsafe_speed = speed.min(100);
    }

    let answer = prompt("Filter Duplicate Sensors? (y/N): ")?;
    config.hardware.filter_duplicate_sensors = answer.eq_ignore_ascii_case("y");

    if config.hardware.filter_duplicate_sensors {
        let answer = prompt(&format!(
            "Sensor Tolerance (°C) [{}]: ",
            config.hardware.duplicate_sensor_tolerance
        ))?;
        if let Ok(tolerance) = answer.parse::<f64>() {
            config.hardware.duplicate_sensor_tolerance = tolerance.clamp(0.25, 5.0);
        }
    }

    save_config(&config, &config_file).await?;
    println!("\n✅ Configuration saved to: {:?}", config_file);

    if !prompt("\n🔍 Test hardware discovery now? (Y/n): ")?.eq_ignore_ascii_case("n") {
        println!("\nTesting hardware discovery...\n");
        let monitor = hardware::platform_monitor(config.hardware.clone());
        let sensors = monitor.discover_sensors().await?;
        let fans = monitor.discover_fans().await?;

        println!("✅ Discovered {} sensors and {} fans", sensors.len(), fans.len());

        if !sensors.is_empty() {
            println!("\n📊 Sensors:");
            for sensor in sensors.iter().take(5) {
                println!("  • {} - {:.1}°C", sensor.name, sensor.temperature);
            }
            if sensors.len() > 5 {
                println!("  ... and {} more", sensors.len() - 5);
            }
        }

        if !fans.is_empty() {
            println!("\n🌀 Fans:");
            for fan in fans.iter().take(5) {
                println!("  • {} - {} RPM", fan.name, fan.rpm.unwrap_or(0));
            }
            if fans.len() > 5 {
                println!("  ... and {} more", fans.len() - 5);
            }
        }
    }

    println!("\n✨ Setup complete! Run the agent with:");
    println!("   ./pankha-agent --start\n");

    Ok(())
}
