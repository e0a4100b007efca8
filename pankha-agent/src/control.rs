//! Closed-loop fan control: per-fan curve evaluation, smoothing, hysteresis,
//! emergency override, and the offline failsafe.

pub mod engine;
pub mod state;
