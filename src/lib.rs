//! fleetwin — device-fleet twin simulation with a broker-backed telemetry and
//! analytics pipeline.
//!
//! Data flow: supervisor ticks simulators → telemetry queue → consumer merges
//! into canonical twins and fans out push events; a scheduler enqueues one
//! analytics job per device which the worker turns into a risk-scored record.

pub mod analysis;
pub mod analytics;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod simulator;
pub mod state;
pub mod stores;
pub mod supervisor;
pub mod telemetry;
