//! Driver configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::reverse::{DEFAULT_SERVOJ_GAIN, DEFAULT_SERVOJ_LOOKAHEAD_TIME};
use crate::{EcdError, Result};

/// Everything the driver needs to take control of a robot.
///
/// Ports may be set to 0 to bind ephemerally; the composed control
/// script always carries the actually bound ports.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Address of the robot controller.
    pub robot_ip: String,
    /// Local interface announced to the robot. Discovered from the
    /// primary connection when unset.
    pub local_ip: Option<String>,
    /// Path of the control script template.
    pub script_file_path: PathBuf,
    /// Push the script through the primary port instead of serving it.
    pub headless_mode: bool,
    pub reverse_port: u16,
    pub script_sender_port: u16,
    pub trajectory_port: u16,
    pub script_command_port: u16,
    /// Robot-side servoj cycle time in seconds.
    pub servoj_time: f64,
    pub servoj_lookahead_time: f64,
    pub servoj_gain: i32,
    /// Deceleration used by the robot-side stopj (rad/s^2).
    pub stopj_acc: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            robot_ip: String::new(),
            local_ip: None,
            script_file_path: PathBuf::from("resources/external_control.script"),
            headless_mode: false,
            reverse_port: 50001,
            script_sender_port: 50002,
            trajectory_port: 50003,
            script_command_port: 50004,
            servoj_time: 0.008,
            servoj_lookahead_time: DEFAULT_SERVOJ_LOOKAHEAD_TIME,
            servoj_gain: DEFAULT_SERVOJ_GAIN,
            stopj_acc: 8.0,
        }
    }
}

impl DriverConfig {
    /// Load a configuration from a YAML file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| EcdError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: DriverConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.reverse_port, 50001);
        assert_eq!(config.script_sender_port, 50002);
        assert_eq!(config.trajectory_port, 50003);
        assert_eq!(config.script_command_port, 50004);
        assert_eq!(config.servoj_time, 0.008);
        assert_eq!(config.servoj_gain, 300);
        assert!(!config.headless_mode);
    }

    #[test]
    fn test_yaml_round_trip_with_partial_input() {
        let yaml = "robot_ip: 192.0.2.10\nheadless_mode: true\nservoj_time: 0.004\n";
        let config: DriverConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.robot_ip, "192.0.2.10");
        assert!(config.headless_mode);
        assert_eq!(config.servoj_time, 0.004);
        // Unlisted fields keep their defaults.
        assert_eq!(config.reverse_port, 50001);
        assert_eq!(config.local_ip, None);
    }
}
