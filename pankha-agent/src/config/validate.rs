//! Range validation for runtime configuration mutations. A rejected value
//! leaves the config untouched and surfaces a structured error in the
//! command response.

use anyhow::Result;
use pankha_protocol::commands::{VALID_FAN_STEPS, VALID_LOG_LEVELS};

pub fn update_interval(interval: f64) -> Result<()> {
    if !(0.5..=30.0).contains(&interval) {
        anyhow::bail!(
            "Invalid interval: {}. Must be between 0.5 and 30 seconds",
            interval
        );
    }
    Ok(())
}

pub fn sensor_tolerance(tolerance: f64) -> Result<()> {
    if !(0.25..=5.0).contains(&tolerance) {
        anyhow::bail!(
            "Invalid tolerance: {}. Must be between 0.25 and 5.0°C",
            tolerance
        );
    }
    Ok(())
}

pub fn fan_step(step: u8) -> Result<()> {
    if !VALID_FAN_STEPS.contains(&step) {
        anyhow::bail!(
            "Invalid fan step: {}. Must be one of: 3, 5, 10, 15, 25, 50, 100 (disable)",
            step
        );
    }
    Ok(())
}

pub fn hysteresis(hysteresis: f64) -> Result<()> {
    if !(0.0..=10.0).contains(&hysteresis) {
        anyhow::bail!(
            "Invalid hysteresis: {}. Must be between 0.0 (disable) and 10.0°C",
            hysteresis
        );
    }
    Ok(())
}

pub fn emergency_temp(temp: f64) -> Result<()> {
    if !(70.0..=100.0).contains(&temp) {
        anyhow::bail!(
            "Invalid emergency temp: {}. Must be between 70.0 and 100.0°C",
            temp
        );
    }
    Ok(())
}

pub fn fan_speed(speed: u64) -> Result<()> {
    if speed > 100 {
        anyhow::bail!("Invalid fan speed: {}. Must be between 0-100", speed);
    }
    Ok(())
}

pub fn log_level(level: &str) -> Result<()> {
    if !VALID_LOG_LEVELS.contains(&level.to_uppercase().as_str()) {
        anyhow::bail!(
            "Invalid log level '{}'. Valid levels: TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL",
            level
        );
    }
    Ok(())
}

pub fn agent_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Agent name cannot be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_bounds() {
        assert!(update_interval(0.5).is_ok());
        assert!(update_interval(30.0).is_ok());
        assert!(update_interval(0.4).is_err());
        assert!(update_interval(31.0).is_err());
    }

    #[test]
    fn fan_step_must_be_in_table() {
        for step in [3, 5, 10, 15, 25, 50, 100] {
            assert!(fan_step(step).is_ok());
        }
        assert!(fan_step(4).is_err());
        assert!(fan_step(0).is_err());
    }

    #[test]
    fn log_level_is_case_insensitive() {
        assert!(log_level("debug").is_ok());
        assert!(log_level("CRITICAL").is_ok());
        assert!(log_level("verbose").is_err());
    }

    #[test]
    fn tolerance_and_temps() {
        assert!(sensor_tolerance(0.25).is_ok());
        assert!(sensor_tolerance(5.1).is_err());
        assert!(hysteresis(0.0).is_ok());
        assert!(hysteresis(10.1).is_err());
        assert!(emergency_temp(70.0).is_ok());
        assert!(emergency_temp(69.9).is_err());
        assert!(fan_speed(100).is_ok());
        assert!(fan_speed(101).is_err());
    }
}
