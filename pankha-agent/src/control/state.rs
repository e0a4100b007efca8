//! Control-loop state: the effective mode and per-fan bookkeeping.

use pankha_protocol::curves::CurvePoint;

/// The loop's behavior mode, recomputed every tick. Emergency wins over
/// everything; Failsafe covers any tick where the hub is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Online,
    Failsafe,
    Emergency,
}

/// Hub-pushed binding of a fan to a curve and a control source.
#[derive(Debug, Clone)]
pub struct FanAssignment {
    pub profile_id: String,
    pub points: Vec<CurvePoint>,
    /// A sensor id, `HIGHEST`, or a chip-group name.
    pub control_sensor: String,
}

/// Per-fan control bookkeeping, owned exclusively by the engine task.
#[derive(Debug, Clone, Default)]
pub struct FanControlState {
    /// Duty the smoothing converges toward.
    pub target: u8,
    /// Source temperature at the last target change; hysteresis compares
    /// against this.
    pub target_temp: Option<f64>,
    /// Duty currently commanded (post smoothing and floor).
    pub commanded: u8,
    /// Hardware-write failures since the last success. Two in a row
    /// disables control on the fan.
    pub write_failures: u8,
    pub control_disabled: bool,
    /// One-shot `setFanSpeed` override; profile evaluation replaces it on
    /// the next tick for assigned fans.
    pub manual_duty: Option<u8>,
    /// Whether the engine has seeded this fan's commanded duty from a real
    /// reading yet.
    pub initialized: bool,
}

/// Mutations handed to the engine task; it is the only component allowed to
/// touch fan hardware.
#[derive(Debug)]
pub enum EngineCommand {
    SetManualDuty { fan_id: String, duty: u8 },
    EmergencyStop,
    ClearEmergency,
    AssignProfile { fan_id: String, assignment: FanAssignment },
}
