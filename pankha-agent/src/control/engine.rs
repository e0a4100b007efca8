//! The control loop. Runs at the configured cadence; each tick refreshes
//! readings, recomputes the loop mode, shapes per-fan duties, writes
//! hardware, and emits one telemetry frame.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pankha_protocol::chips::{classify_sensor_type, derive_chip_name};
use pankha_protocol::curves;
use pankha_protocol::frames::{AgentFrame, TelemetryData};
use pankha_protocol::types::{Fan, Sensor, CONTROL_SOURCE_HIGHEST};

use crate::config::persistence::ConfigStore;
use crate::config::types::AgentConfig;
use crate::hardware::dedup::apply_duplicate_filter;
use crate::hardware::{HardwareMonitor, Sample};
use crate::websocket::SessionHandle;

use super::state::{EngineCommand, FanAssignment, FanControlState, LoopMode};

const ENGINE_COMMAND_QUEUE: usize = 32;

pub struct ControlEngine {
    hardware: Arc<dyn HardwareMonitor>,
    config: Arc<ConfigStore>,
    session: Arc<SessionHandle>,
    commands: mpsc::Receiver<EngineCommand>,
    fans: HashMap<String, FanControlState>,
    assignments: HashMap<String, FanAssignment>,
    mode: LoopMode,
    /// Latched by the `emergencyStop` command; only `clearEmergency`
    /// releases it.
    operator_emergency: bool,
    /// Fans whose control was disabled by repeated write failures; shared
    /// with the command dispatcher so `setFanSpeed` can refuse them.
    disabled_fans: Arc<StdRwLock<HashSet<String>>>,
}

impl ControlEngine {
    pub fn new(
        hardware: Arc<dyn HardwareMonitor>,
        config: Arc<ConfigStore>,
        session: Arc<SessionHandle>,
    ) -> (Self, mpsc::Sender<EngineCommand>, Arc<StdRwLock<HashSet<String>>>) {
        let (tx, rx) = mpsc::channel(ENGINE_COMMAND_QUEUE);
        let disabled_fans = Arc::new(StdRwLock::new(HashSet::new()));
        let engine = Self {
            hardware,
            config,
            session,
            commands: rx,
            fans: HashMap::new(),
            assignments: HashMap::new(),
            mode: LoopMode::Online,
            operator_emergency: false,
            disabled_fans: disabled_fans.clone(),
        };
        (engine, tx, disabled_fans)
    }

    /// Run until the shutdown signal flips. Ends with one last safety write.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Control loop started");
        loop {
            let interval = self.config.snapshot().await.tick_interval();
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {
                    self.tick().await;
                }
                Some(cmd) = self.commands.recv() => {
                    self.apply_engine_command(cmd).await;
                }
            }
        }

        info!("Control loop stopping, applying final safety state");
        self.final_safety_write().await;
    }

    /// One control iteration.
    pub async fn tick(&mut self) {
        let config = self.config.snapshot().await;

        let mut sample = match self.hardware.read_sample().await {
            Ok(sample) => sample,
            Err(e) => {
                error!("Hardware sample failed: {}", e);
                return;
            }
        };

        if config.hardware.filter_duplicate_sensors {
            apply_duplicate_filter(
                &mut sample.sensors,
                config.hardware.duplicate_sensor_tolerance,
            );
        }

        self.seed_new_fans(&sample);
        let mode = self.resolve_mode(&sample, &config);
        if mode != self.mode {
            info!("Control mode: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }

        match self.mode {
            LoopMode::Emergency => self.tick_emergency(&sample, &config).await,
            LoopMode::Failsafe => self.tick_failsafe(&sample, &config).await,
            LoopMode::Online => self.tick_online(&sample, &config).await,
        }

        self.emit_telemetry(&sample, &config).await;
    }

    fn seed_new_fans(&mut self, sample: &Sample) {
        for fan in &sample.fans {
            let state = self.fans.entry(fan.id.clone()).or_default();
            if !state.initialized {
                state.commanded = fan.speed;
                state.target = fan.speed;
                state.initialized = true;
            }
        }
    }

    /// Highest priority first: emergency, then failsafe, then online.
    fn resolve_mode(&mut self, sample: &Sample, config: &AgentConfig) -> LoopMode {
        let emergency_temp = config.hardware.emergency_temp;
        let hysteresis = config.hardware.hysteresis_temp;

        let any_hot = visible_sensors(&sample.sensors)
            .any(|s| s.temperature >= emergency_temp);
        let all_cooled = visible_sensors(&sample.sensors)
            .all(|s| s.temperature < emergency_temp - hysteresis);

        // The operator latch only releases via clearEmergency; a
        // temperature-triggered emergency releases once every visible
        // sensor cools past the hysteresis margin.
        if self.mode == LoopMode::Emergency && !all_cooled {
            return LoopMode::Emergency;
        }
        if any_hot || self.operator_emergency {
            return LoopMode::Emergency;
        }
        if self.session.is_connected() {
            LoopMode::Online
        } else {
            LoopMode::Failsafe
        }
    }

    /// Every controllable fan to 100, bypassing curve, hysteresis,
    /// smoothing, and floor.
    async fn tick_emergency(&mut self, sample: &Sample, config: &AgentConfig) {
        for fan in controllable(&sample.fans) {
            let state = self.fans.entry(fan.id.clone()).or_default();
            if state.control_disabled {
                continue;
            }
            state.target = 100;
            state.commanded = 100;
            if config.hardware.enable_fan_control {
                Self::write_duty(&*self.hardware, &self.disabled_fans, state, &fan.id, 100).await;
            }
        }
    }

    /// Every controllable fan pinned to failsafe speed; GPU fans on
    /// platforms that prefer it are handed back to the driver instead.
    async fn tick_failsafe(&mut self, sample: &Sample, config: &AgentConfig) {
        let failsafe_speed = config.hardware.failsafe_speed;
        let release_gpus = self.hardware.release_gpu_fans_when_offline();

        for fan in controllable(&sample.fans) {
            let state = self.fans.entry(fan.id.clone()).or_default();
            if state.control_disabled {
                continue;
            }
            if release_gpus && is_gpu_fan(fan) {
                if config.hardware.enable_fan_control {
                    if let Err(e) = self.hardware.release_fan_to_auto(&fan.id).await {
                        warn!("Failed to release GPU fan {} to driver: {}", fan.id, e);
                    }
                }
                continue;
            }
            state.target = failsafe_speed;
            state.commanded = failsafe_speed;
            if config.hardware.enable_fan_control {
                Self::write_duty(&*self.hardware, &self.disabled_fans, state, &fan.id, failsafe_speed).await;
            }
        }
    }

    /// Profile-driven control: resolve source, evaluate curve, hysteresis,
    /// smoothing, safety floor.
    async fn tick_online(&mut self, sample: &Sample, config: &AgentConfig) {
        if !config.hardware.enable_fan_control {
            return;
        }
        let hysteresis = config.hardware.hysteresis_temp;
        let step = config.hardware.fan_step_percent;
        let floor = config.hardware.fan_safety_minimum;

        for fan in controllable(&sample.fans) {
            let assignment = self.assignments.get(&fan.id).cloned();
            let state = self.fans.entry(fan.id.clone()).or_default();
            if state.control_disabled {
                continue;
            }

            match &assignment {
                Some(assignment) => {
                    // A queued manual override lasts until the profile
                    // re-evaluates here.
                    state.manual_duty = None;
                    let Some(source_temp) =
                        resolve_source_temp(&assignment.control_sensor, &sample.sensors)
                    else {
                        debug!(
                            "No readable source '{}' for fan {}, holding target",
                            assignment.control_sensor, fan.id
                        );
                        continue;
                    };

                    let moved_enough = match state.target_temp {
                        Some(at) => (source_temp - at).abs() >= hysteresis,
                        None => true,
                    };
                    if moved_enough {
                        state.target = curves::evaluate(&assignment.points, source_temp);
                        state.target_temp = Some(source_temp);
                    }
                }
                None => {
                    if let Some(duty) = state.manual_duty {
                        state.target = duty;
                    } else {
                        // Unassigned fan with no manual request: leave the
                        // firmware's value alone.
                        continue;
                    }
                }
            }

            let next = step_toward(state.commanded, state.target, step).max(floor);
            state.commanded = next;
            Self::write_duty(&*self.hardware, &self.disabled_fans, state, &fan.id, next).await;
        }
    }

    /// Write with failure tracking: one retry on the next tick, then the
    /// fan's control is disabled until restart.
    async fn write_duty(
        hardware: &dyn HardwareMonitor,
        disabled_fans: &StdRwLock<HashSet<String>>,
        state: &mut FanControlState,
        fan_id: &str,
        duty: u8,
    ) {
        match hardware.set_fan_duty(fan_id, duty).await {
            Ok(()) => {
                state.write_failures = 0;
            }
            Err(e) => {
                state.write_failures = state.write_failures.saturating_add(1);
                if state.write_failures >= 2 {
                    error!(
                        "Disabling control for fan {} after repeated write failures: {}",
                        fan_id, e
                    );
                    state.control_disabled = true;
                    if let Ok(mut disabled) = disabled_fans.write() {
                        disabled.insert(fan_id.to_string());
                    }
                } else {
                    warn!("PWM write failed for fan {} (will retry): {}", fan_id, e);
                }
            }
        }
    }

    async fn apply_engine_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetManualDuty { fan_id, duty } => {
                let config = self.config.snapshot().await;
                let effective = duty.max(config.hardware.fan_safety_minimum);
                let state = self.fans.entry(fan_id.clone()).or_default();
                if state.control_disabled {
                    return;
                }
                state.manual_duty = Some(duty);
                // Emergency and failsafe outrank manual requests
                if self.mode == LoopMode::Online {
                    state.target = effective;
                    state.commanded = effective;
                    if config.hardware.enable_fan_control {
                        Self::write_duty(&*self.hardware, &self.disabled_fans, state, &fan_id, effective).await;
                    }
                }
            }
            EngineCommand::EmergencyStop => {
                warn!("🚨 Operator emergency stop latched - all fans to 100%");
                self.operator_emergency = true;
                self.mode = LoopMode::Emergency;
                let config = self.config.snapshot().await;
                if config.hardware.enable_fan_control {
                    if let Ok(sample) = self.hardware.read_sample().await {
                        self.tick_emergency(&sample, &config).await;
                    }
                }
            }
            EngineCommand::ClearEmergency => {
                info!("Operator emergency latch cleared");
                self.operator_emergency = false;
            }
            EngineCommand::AssignProfile { fan_id, assignment } => {
                debug!(
                    "Fan {} assigned profile {} (source: {})",
                    fan_id, assignment.profile_id, assignment.control_sensor
                );
                if let Some(state) = self.fans.get_mut(&fan_id) {
                    state.target_temp = None;
                    state.manual_duty = None;
                }
                self.assignments.insert(fan_id, assignment);
            }
        }
    }

    /// Telemetry reflects the engine's commanded duties and assignments.
    async fn emit_telemetry(&self, sample: &Sample, config: &AgentConfig) {
        let mut fans: Vec<Fan> = sample.fans.clone();
        for fan in &mut fans {
            if let Some(state) = self.fans.get(&fan.id) {
                fan.target_speed = state.target;
                fan.speed = state.commanded;
                if state.control_disabled {
                    fan.status = "error".to_string();
                }
            }
            if let Some(assignment) = self.assignments.get(&fan.id) {
                fan.profile_id = Some(assignment.profile_id.clone());
                fan.control_sensor = Some(assignment.control_sensor.clone());
            }
        }

        let system_health = match self.hardware.system_health().await {
            Ok(health) => health,
            Err(e) => {
                warn!("System health read failed: {}", e);
                return;
            }
        };

        let frame = AgentFrame::Telemetry {
            data: TelemetryData {
                agent_id: config.agent.id.clone(),
                timestamp: pankha_protocol::now_millis(),
                sensors: sample.sensors.clone(),
                fans,
                system_health,
            },
        };
        self.session.send(frame).await;
    }

    /// Last write before exit: failsafe speed, or driver-auto for GPU fans
    /// on platforms that support it.
    async fn final_safety_write(&mut self) {
        let config = self.config.snapshot().await;
        if !config.hardware.enable_fan_control {
            return;
        }
        let Ok(sample) = self.hardware.read_sample().await else {
            error!("Final safety write skipped: hardware unavailable");
            return;
        };
        let release_gpus = self.hardware.release_gpu_fans_when_offline();
        for fan in controllable(&sample.fans) {
            let result = if release_gpus && is_gpu_fan(fan) {
                self.hardware.release_fan_to_auto(&fan.id).await
            } else {
                self.hardware
                    .set_fan_duty(&fan.id, config.hardware.failsafe_speed)
                    .await
            };
            if let Err(e) = result {
                error!("Final safety write failed for fan {}: {}", fan.id, e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn mode(&self) -> LoopMode {
        self.mode
    }

    #[cfg(test)]
    pub(crate) fn fan_state(&self, fan_id: &str) -> Option<&FanControlState> {
        self.fans.get(fan_id)
    }
}

fn visible_sensors(sensors: &[Sensor]) -> impl Iterator<Item = &Sensor> {
    sensors.iter().filter(|s| s.visible)
}

fn controllable(fans: &[Fan]) -> impl Iterator<Item = &Fan> {
    fans.iter().filter(|f| f.has_pwm_control)
}

fn is_gpu_fan(fan: &Fan) -> bool {
    classify_sensor_type(derive_chip_name(&fan.id)) == "gpu"
}

/// Resolve a control-source token against the current sensor readings.
/// Hidden sensors count only when addressed by their exact id.
fn resolve_source_temp(token: &str, sensors: &[Sensor]) -> Option<f64> {
    if let Some(sensor) = sensors.iter().find(|s| s.id == token) {
        return Some(sensor.temperature);
    }
    if token == CONTROL_SOURCE_HIGHEST {
        return sensors
            .iter()
            .filter(|s| s.visible)
            .map(|s| s.temperature)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    }
    // Chip-group token: max over visible members
    sensors
        .iter()
        .filter(|s| s.visible && derive_chip_name(&s.id) == token)
        .map(|s| s.temperature)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Move `current` toward `target` by at most `step` percentage points.
fn step_toward(current: u8, target: u8, step: u8) -> u8 {
    if step >= 100 {
        return target;
    }
    if target > current {
        current.saturating_add(step.min(target - current))
    } else {
        current.saturating_sub(step.min(current - target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::hardware::HardwareError;
    use pankha_protocol::curves::CurvePoint;
    use pankha_protocol::types::SystemHealth;

    /// Scriptable hardware for engine tests: fixed fans, settable sensor
    /// temps, a write log, and optional write failure injection.
    struct MockMonitor {
        temps: Mutex<Vec<(String, f64)>>,
        fans: Vec<String>,
        writes: Mutex<Vec<(String, u8)>>,
        releases: Mutex<Vec<String>>,
        fail_writes: Mutex<bool>,
        gpu_release: bool,
    }

    impl MockMonitor {
        fn new(sensor_ids: &[&str], fan_ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                temps: Mutex::new(sensor_ids.iter().map(|s| (s.to_string(), 40.0)).collect()),
                fans: fan_ids.iter().map(|s| s.to_string()).collect(),
                writes: Mutex::new(Vec::new()),
                releases: Mutex::new(Vec::new()),
                fail_writes: Mutex::new(false),
                gpu_release: false,
            })
        }

        fn set_temp(&self, id: &str, temp: f64) {
            let mut temps = self.temps.lock().unwrap();
            for entry in temps.iter_mut() {
                if entry.0 == id {
                    entry.1 = temp;
                }
            }
        }

        fn last_write(&self, fan_id: &str) -> Option<u8> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == fan_id)
                .map(|(_, duty)| *duty)
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HardwareMonitor for MockMonitor {
        async fn discover_sensors(&self) -> Result<Vec<Sensor>, HardwareError> {
            Ok(self.read_sample().await?.sensors)
        }

        async fn discover_fans(&self) -> Result<Vec<Fan>, HardwareError> {
            Ok(self.read_sample().await?.fans)
        }

        async fn read_sample(&self) -> Result<Sample, HardwareError> {
            let sensors = self
                .temps
                .lock()
                .unwrap()
                .iter()
                .map(|(id, temp)| Sensor {
                    id: id.clone(),
                    name: id.clone(),
                    temperature: *temp,
                    sensor_type: "cpu".into(),
                    max_temp: None,
                    crit_temp: None,
                    chip: None,
                    hardware_name: None,
                    source: None,
                    visible: true,
                    stale: false,
                })
                .collect();
            let fans = self
                .fans
                .iter()
                .map(|id| Fan {
                    id: id.clone(),
                    name: id.clone(),
                    rpm: Some(800),
                    speed: 20,
                    target_speed: 20,
                    status: "ok".into(),
                    has_pwm_control: true,
                    pwm_file: None,
                    profile_id: None,
                    control_sensor: None,
                })
                .collect();
            Ok(Sample { sensors, fans })
        }

        async fn set_fan_duty(&self, fan_id: &str, duty: u8) -> Result<(), HardwareError> {
            if *self.fail_writes.lock().unwrap() {
                return Err(HardwareError::AccessDenied(fan_id.to_string()));
            }
            self.writes.lock().unwrap().push((fan_id.to_string(), duty));
            Ok(())
        }

        async fn release_fan_to_auto(&self, fan_id: &str) -> Result<(), HardwareError> {
            self.releases.lock().unwrap().push(fan_id.to_string());
            Ok(())
        }

        async fn system_health(&self) -> Result<SystemHealth, HardwareError> {
            Ok(SystemHealth {
                cpu_usage: 1.0,
                memory_usage: 10.0,
                agent_uptime: 1.0,
            })
        }

        async fn invalidate_cache(&self) {}

        fn release_gpu_fans_when_offline(&self) -> bool {
            self.gpu_release
        }
    }

    struct Rig {
        engine: ControlEngine,
        hardware: Arc<MockMonitor>,
        session: Arc<SessionHandle>,
        config: Arc<ConfigStore>,
        disabled: Arc<StdRwLock<HashSet<String>>>,
        _dir: TempDir,
    }

    async fn rig(sensor_ids: &[&str], fan_ids: &[&str]) -> Rig {
        let dir = TempDir::new().unwrap();
        let mut config = AgentConfig::default();
        config.hardware.emergency_temp = 85.0;
        config.hardware.hysteresis_temp = 2.0;
        config.hardware.fan_step_percent = 5;
        config.hardware.fan_safety_minimum = 10;
        config.hardware.failsafe_speed = 70;
        config.hardware.filter_duplicate_sensors = false;
        let config = ConfigStore::new(config, dir.path().join("config.json"));
        let hardware = MockMonitor::new(sensor_ids, fan_ids);
        let session = SessionHandle::new();
        let (engine, _tx, disabled) =
            ControlEngine::new(hardware.clone(), config.clone(), session.clone());
        Rig {
            engine,
            hardware,
            session,
            config,
            disabled,
            _dir: dir,
        }
    }

    fn scenario_curve() -> FanAssignment {
        FanAssignment {
            profile_id: "prof-1".into(),
            points: vec![
                CurvePoint { temperature: 30.0, duty: 20 },
                CurvePoint { temperature: 50.0, duty: 40 },
                CurvePoint { temperature: 65.0, duty: 70 },
                CurvePoint { temperature: 80.0, duty: 100 },
            ],
            control_sensor: "cpu_tctl".into(),
        }
    }

    async fn go_online(rig: &Rig) {
        let (tx, _rx) = mpsc::channel(64);
        rig.session.attach(tx).await;
    }

    #[tokio::test]
    async fn steady_state_control_follows_curve_with_shaping() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;

        // Temperature steps 30 -> 57 -> 57.5 -> 70 -> 86 -> 60
        r.hardware.set_temp("cpu_tctl", 30.0);
        r.engine.tick().await;
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 20);

        r.hardware.set_temp("cpu_tctl", 57.0);
        r.engine.tick().await;
        // target = curve(57) = 54, stepped from 20 by 5
        assert_eq!(r.engine.fan_state("fan1").unwrap().target, 54);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 25);

        r.hardware.set_temp("cpu_tctl", 57.5);
        r.engine.tick().await;
        // Hysteresis (0.5 < 2.0): target unchanged, smoothing continues
        assert_eq!(r.engine.fan_state("fan1").unwrap().target, 54);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 30);

        r.hardware.set_temp("cpu_tctl", 70.0);
        r.engine.tick().await;
        assert_eq!(r.engine.fan_state("fan1").unwrap().target, 80);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 35);

        r.hardware.set_temp("cpu_tctl", 86.0);
        r.engine.tick().await;
        // Emergency bypasses shaping entirely
        assert_eq!(r.engine.mode(), LoopMode::Emergency);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 100);
        assert_eq!(r.hardware.last_write("fan1"), Some(100));

        r.hardware.set_temp("cpu_tctl", 60.0);
        r.engine.tick().await;
        // 60 < 85 - 2: emergency clears, duty steps back down
        assert_eq!(r.engine.mode(), LoopMode::Online);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 95);

        // Further ticks at 60 converge toward curve(60) = 60 in 5-pp steps
        for expected in [90, 85, 80, 75, 70, 65, 60, 60] {
            r.engine.tick().await;
            assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, expected);
        }
    }

    #[tokio::test]
    async fn consecutive_tick_deltas_bounded_by_step() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;

        let mut prev = 20i32;
        for temp in [30.0, 75.0, 78.0, 41.0, 33.0, 79.0, 52.0] {
            r.hardware.set_temp("cpu_tctl", temp);
            r.engine.tick().await;
            let commanded = r.engine.fan_state("fan1").unwrap().commanded as i32;
            assert!((commanded - prev).abs() <= 5, "step exceeded at {}", temp);
            prev = commanded;
        }
    }

    #[tokio::test]
    async fn disconnect_forces_failsafe_then_recovers() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;

        r.hardware.set_temp("cpu_tctl", 70.0);
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Online);

        // Session drops mid-load: next tick pins failsafe speed
        r.session.detach().await;
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Failsafe);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 70);
        assert_eq!(r.hardware.last_write("fan1"), Some(70));

        // Reconnection resumes curve control on the next tick
        go_online(&r).await;
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Online);
    }

    #[tokio::test]
    async fn emergency_overrides_failsafe_while_offline() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        // Never connected: failsafe from the start
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Failsafe);
        assert_eq!(r.engine.fan_state("fan1").unwrap().commanded, 70);

        r.hardware.set_temp("cpu_tctl", 86.0);
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Emergency);
        assert_eq!(r.hardware.last_write("fan1"), Some(100));
    }

    #[tokio::test]
    async fn emergency_clear_requires_hysteresis_margin() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.hardware.set_temp("cpu_tctl", 86.0);
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Emergency);

        // 84 is below threshold but within the hysteresis band: still latched
        r.hardware.set_temp("cpu_tctl", 84.0);
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Emergency);

        r.hardware.set_temp("cpu_tctl", 82.5);
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Online);
    }

    #[tokio::test]
    async fn operator_emergency_latches_until_cleared() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine.apply_engine_command(EngineCommand::EmergencyStop).await;
        assert_eq!(r.engine.mode(), LoopMode::Emergency);
        assert_eq!(r.hardware.last_write("fan1"), Some(100));

        // Temperatures are benign but the latch holds...
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Emergency);

        // ...until explicitly cleared
        r.engine.apply_engine_command(EngineCommand::ClearEmergency).await;
        r.engine.tick().await;
        assert_eq!(r.engine.mode(), LoopMode::Online);
    }

    #[tokio::test]
    async fn disabled_fan_control_never_writes() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        r.config
            .mutate(|c| c.hardware.enable_fan_control = false)
            .await
            .unwrap();
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;

        r.hardware.set_temp("cpu_tctl", 70.0);
        r.engine.tick().await;
        r.hardware.set_temp("cpu_tctl", 86.0);
        r.engine.tick().await; // even emergency must not write
        r.session.detach().await;
        r.hardware.set_temp("cpu_tctl", 40.0);
        r.engine.tick().await; // nor failsafe

        assert_eq!(r.hardware.write_count(), 0);
    }

    #[tokio::test]
    async fn manual_duty_honors_safety_floor() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::SetManualDuty {
                fan_id: "fan1".into(),
                duty: 4,
            })
            .await;
        // floor is 10
        assert_eq!(r.hardware.last_write("fan1"), Some(10));

        r.engine
            .apply_engine_command(EngineCommand::SetManualDuty {
                fan_id: "fan1".into(),
                duty: 75,
            })
            .await;
        assert_eq!(r.hardware.last_write("fan1"), Some(75));
    }

    #[tokio::test]
    async fn repeated_write_failure_disables_fan_control() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;
        *r.hardware.fail_writes.lock().unwrap() = true;

        r.hardware.set_temp("cpu_tctl", 70.0);
        r.engine.tick().await; // first failure, retry pending
        assert!(!r.engine.fan_state("fan1").unwrap().control_disabled);
        r.hardware.set_temp("cpu_tctl", 75.0);
        r.engine.tick().await; // second failure disables control
        assert!(r.engine.fan_state("fan1").unwrap().control_disabled);
        // The command dispatcher sees the disabled fan too
        assert!(r.disabled.read().unwrap().contains("fan1"));

        // Once disabled, no further writes are attempted
        *r.hardware.fail_writes.lock().unwrap() = false;
        r.hardware.set_temp("cpu_tctl", 79.0);
        r.engine.tick().await;
        assert_eq!(r.hardware.write_count(), 0);
    }

    #[tokio::test]
    async fn highest_token_ignores_hidden_sensors() {
        let mut r = rig(&["k10temp_tctl", "wmi_cpu"], &["fan1"]).await;
        r.config
            .mutate(|c| {
                c.hardware.filter_duplicate_sensors = true;
                c.hardware.duplicate_sensor_tolerance = 1.0;
            })
            .await
            .unwrap();
        go_online(&r).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: FanAssignment {
                    control_sensor: CONTROL_SOURCE_HIGHEST.into(),
                    ..scenario_curve()
                },
            })
            .await;

        // Duplicates within tolerance: wmi (45.8) hides behind k10temp (45.2).
        // HIGHEST must resolve to the visible 45.2, not the hidden 45.8.
        r.hardware.set_temp("k10temp_tctl", 45.2);
        r.hardware.set_temp("wmi_cpu", 45.8);
        r.engine.tick().await;
        let state = r.engine.fan_state("fan1").unwrap();
        // curve(45.2) = 35 (between (30,20) and (50,40))
        assert_eq!(state.target, 35);
    }

    #[tokio::test]
    async fn telemetry_reflects_commanded_duty_and_assignment() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        let (tx, mut rx) = mpsc::channel(64);
        r.session.attach(tx).await;
        r.engine
            .apply_engine_command(EngineCommand::AssignProfile {
                fan_id: "fan1".into(),
                assignment: scenario_curve(),
            })
            .await;

        r.hardware.set_temp("cpu_tctl", 57.0);
        r.engine.tick().await;

        let frame = rx.recv().await.unwrap();
        match frame {
            AgentFrame::Telemetry { data } => {
                assert_eq!(data.fans[0].speed, 25);
                assert_eq!(data.fans[0].target_speed, 54);
                assert_eq!(data.fans[0].profile_id.as_deref(), Some("prof-1"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn final_safety_write_pins_failsafe_speed() {
        let mut r = rig(&["cpu_tctl"], &["fan1"]).await;
        go_online(&r).await;
        r.engine.final_safety_write().await;
        assert_eq!(r.hardware.last_write("fan1"), Some(70));
    }

    #[test]
    fn step_toward_behaviour() {
        assert_eq!(step_toward(20, 54, 5), 25);
        assert_eq!(step_toward(54, 20, 5), 49);
        assert_eq!(step_toward(50, 52, 5), 52);
        assert_eq!(step_toward(50, 50, 5), 50);
        // step 100 disables smoothing
        assert_eq!(step_toward(10, 90, 100), 90);
    }

    #[test]
    fn source_resolution_rules() {
        let sensors = vec![
            Sensor {
                id: "k10temp_tctl".into(),
                name: "cpu".into(),
                temperature: 61.0,
                sensor_type: "cpu".into(),
                max_temp: None,
                crit_temp: None,
                chip: None,
                hardware_name: None,
                source: None,
                visible: true,
                stale: false,
            },
            Sensor {
                id: "nvme_composite".into(),
                name: "ssd".into(),
                temperature: 70.0,
                sensor_type: "nvme".into(),
                max_temp: None,
                crit_temp: None,
                chip: None,
                hardware_name: None,
                source: None,
                visible: false,
                stale: false,
            },
        ];
        // Hidden sensor is skipped by HIGHEST but reachable by exact id
        assert_eq!(resolve_source_temp("HIGHEST", &sensors), Some(61.0));
        assert_eq!(resolve_source_temp("nvme_composite", &sensors), Some(70.0));
        // Chip-group token
        assert_eq!(resolve_source_temp("k10temp", &sensors), Some(61.0));
        assert_eq!(resolve_source_temp("missing", &sensors), None);
    }
}
