use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_SCAN_DURATION_SECS, DEFAULT_SPEED, ROBOT_ADDRESS, UUID_ROBOT_CHANNEL_CHAR,
    UUID_ROBOT_SERVICE,
};
use crate::core::bluetooth::{LinkConfig, PeerIdentity};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("scan duration must be at least one second")]
    InvalidScanDuration,
}

/// Robot link settings.
///
/// Every field has a default matching the stock robot, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Hardware address of the robot's BLE module
    pub target_address: PeerIdentity,
    /// UART bridge service
    pub service_uuid: Uuid,
    /// Shared command/telemetry characteristic
    pub characteristic_uuid: Uuid,
    /// How long one discovery attempt may take
    pub scan_duration_secs: u64,
    /// PWM duty the robot is driven at
    pub default_speed: u8,
}

impl Default for RobotConfig {
    fn default() -> Self {
        RobotConfig {
            target_address: ROBOT_ADDRESS.parse().expect("ROBOT_ADDRESS is well-formed"),
            service_uuid: UUID_ROBOT_SERVICE,
            characteristic_uuid: UUID_ROBOT_CHANNEL_CHAR,
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            default_speed: DEFAULT_SPEED,
        }
    }
}

impl RobotConfig {
    /// Loads the config from `path`, falling back to defaults if the file does not exist.
    pub async fn load_config(path: &Path) -> Result<Self, ConfigError> {
        let path_str = path.to_string_lossy().into_owned();

        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let config = Self::from_json(&config_json).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path_str.clone(),
                source,
            },
            other => other,
        })?;

        info!("Config loaded from {:?}", path_str);
        Ok(config)
    }

    pub fn from_json(config_json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(config_json).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        if config.scan_duration_secs == 0 {
            return Err(ConfigError::InvalidScanDuration);
        }
        Ok(config)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
        }
    }
}
