//! Robot voice link library
//! Connects to a BLE wheeled robot, sends it movement commands derived from
//! spoken phrases and surfaces the telemetry it pushes back.

pub mod config;
pub mod core;
pub mod logging;
