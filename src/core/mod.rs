//! Core functionality for the robot link
//! This module contains the BLE protocol core and the phrase-to-command parser

pub mod bluetooth;
pub mod phrase;

// Re-export commonly used types
pub use bluetooth::RobotManager;
pub use phrase::{PhraseError, PhraseParser};
