pub mod robot_config;

pub use robot_config::{ConfigError, RobotConfig};
