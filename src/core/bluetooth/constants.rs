//! Constants used throughout the application
//! This module contains the fixed protocol values of the robot link,
//! such as UUIDs, the robot's address and timeouts.

use uuid::Uuid;

/// Hardware address of the robot's BLE module
pub const ROBOT_ADDRESS: &str = "00:15:86:13:DF:F3";

/// The UART bridge service exposed by the robot's BLE module
pub const UUID_ROBOT_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// The single characteristic used for both commands (write) and telemetry (notify)
pub const UUID_ROBOT_CHANNEL_CHAR: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 6;

/// Number of matches a discovery attempt is allowed to deliver
pub const SCAN_MATCH_BUDGET: usize = 1;

/// Full PWM duty, the speed the robot is driven at unless told otherwise
pub const DEFAULT_SPEED: u8 = 255;

/// Capacity of the advertisement channel between the radio and the scanner
pub const ADVERTISEMENT_CHANNEL_CAPACITY: usize = 32;
