//! Per-device state machine producing telemetry ticks.
//!
//! Two states: Idle (no ticks remaining, emits nothing, state untouched) and
//! Active (a 10-tick diagnostics run: five "burst" ticks driving load and heat
//! up, five "cooldown" ticks relaxing back toward baseline).

use crate::models::{TelemetryEvent, TelemetryPatch};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

pub const BASELINE_TEMP: f64 = 25.0;
pub const HIGH_LOAD_CPU: f64 = 95.0;
const DIAGNOSTICS_TICKS: u8 = 10;
const COOLDOWN_TICKS: u8 = 5;
const CHARGE_RATE: f64 = 5.0;
const SLOW_DRAIN: f64 = 0.1;

const TEMP_MIN: f64 = 20.0;
const TEMP_MAX: f64 = 100.0;

/// Linear load → steady-state-temperature map shared read-only by every
/// simulator. The supervisor constructs one instance; simulators never own it.
#[derive(Debug, Clone)]
pub struct DriftModel {
    slope: f64,
    intercept: f64,
}

impl Default for DriftModel {
    fn default() -> Self {
        // Fixed-band coefficients: ~85C steady state at the high-load target.
        Self {
            slope: 0.63,
            intercept: BASELINE_TEMP,
        }
    }
}

impl DriftModel {
    /// Least-squares fit over (load, temperature) samples. Falls back to the
    /// fixed-band coefficients when the samples carry no spread.
    pub fn fit(samples: &[(f64, f64)]) -> Self {
        let n = samples.len() as f64;
        if samples.len() < 2 {
            return Self::default();
        }
        let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
        let var_x = samples.iter().map(|(x, _)| (x - mean_x).powi(2)).sum::<f64>();
        if var_x == 0.0 {
            return Self::default();
        }
        let cov = samples
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum::<f64>();
        let slope = cov / var_x;
        Self {
            slope,
            intercept: mean_y - slope * mean_x,
        }
    }

    /// Temperature the device trends toward under a sustained cpu load.
    pub fn steady_state_temp(&self, cpu: f64) -> f64 {
        (self.intercept + self.slope * cpu).clamp(TEMP_MIN, TEMP_MAX)
    }
}

pub struct DeviceSimulator {
    serial_number: String,
    cpu: f64,
    temperature: f64,
    battery: f64,
    charging: bool,
    active_ticks_remaining: u8,
    model: Arc<DriftModel>,
    rng: StdRng,
}

impl DeviceSimulator {
    pub fn new(serial_number: impl Into<String>, model: Arc<DriftModel>) -> Self {
        Self::with_rng(serial_number, model, StdRng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_rng(serial_number: impl Into<String>, model: Arc<DriftModel>, mut rng: StdRng) -> Self {
        let battery = rng.gen_range(40..=90) as f64;
        Self {
            serial_number: serial_number.into(),
            cpu: 0.0,
            temperature: BASELINE_TEMP,
            battery,
            charging: false,
            active_ticks_remaining: 0,
            model,
            rng,
        }
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn is_idle(&self) -> bool {
        self.active_ticks_remaining == 0
    }

    /// React to a remote command. Only RUN_DIAGNOSTICS is recognized; it arms
    /// a 10-tick run and forces cpu to the high-load target. Anything else is
    /// ignored.
    pub fn trigger(&mut self, action: &str) {
        if action == crate::models::ACTION_RUN_DIAGNOSTICS {
            self.active_ticks_remaining = DIAGNOSTICS_TICKS;
            self.cpu = HIGH_LOAD_CPU;
        }
    }

    /// Advance one tick. Idle simulators emit nothing and stay untouched.
    pub fn update(&mut self) -> Option<TelemetryEvent> {
        if self.active_ticks_remaining == 0 {
            return None;
        }

        if self.active_ticks_remaining > COOLDOWN_TICKS {
            // Burst phase: pinned high load, heat rises toward the
            // load-dependent steady state, battery drains fast.
            self.cpu = self.rng.gen_range(85.0..=100.0);
            let target = self.model.steady_state_temp(self.cpu);
            let step = self.rng.gen_range(3.0..=7.0);
            // Capped at the load-dependent steady state, but a burst tick
            // never cools: a re-trigger can catch the device hotter than this
            // tick's target.
            self.temperature = (self.temperature + step).min(target).max(self.temperature);
            let drain = self.rng.gen_range(0.5..=1.0);
            self.advance_battery(drain);
        } else {
            // Cooldown phase: load decays, heat relaxes to baseline, battery
            // back to the slow drain.
            self.cpu = (self.cpu - self.rng.gen_range(20.0..=30.0)).max(0.0);
            self.temperature = (self.temperature - self.rng.gen_range(2.0..=4.0)).max(BASELINE_TEMP);
            self.advance_battery(SLOW_DRAIN);
        }

        self.cpu = self.cpu.clamp(0.0, 100.0);
        self.temperature = self.temperature.clamp(TEMP_MIN, TEMP_MAX);
        self.battery = self.battery.clamp(0.0, 100.0);
        self.active_ticks_remaining -= 1;

        Some(TelemetryEvent {
            serial_number: self.serial_number.clone(),
            patch: TelemetryPatch {
                cpu_usage: Some(self.cpu.round() as u8),
                temperature: Some((self.temperature * 10.0).round() / 10.0),
                battery_health: Some(self.battery.floor() as u8),
                is_charging: Some(self.charging),
            },
        })
    }

    /// Charging takes precedence over drain and toggles at the thresholds.
    fn advance_battery(&mut self, drain: f64) {
        if self.charging {
            self.battery = (self.battery + CHARGE_RATE).min(100.0);
            if self.battery >= 100.0 {
                self.charging = false;
            }
        } else {
            self.battery = (self.battery - drain).max(0.0);
            if self.battery < 10.0 {
                self.charging = true;
            }
        }
    }
}
