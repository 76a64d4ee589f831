//! Driver façade
//!
//! Owns the host-side interfaces, composes the control script and
//! exposes the full operation set to the host application. Constructing
//! a [`Driver`] binds the reverse, script command and trajectory ports;
//! the robot connects back to them once its control script runs.

use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::control::{Vector6d, Vector6i32};
use crate::primary::{PrimaryPortClient, PRIMARY_PORT};
use crate::reverse::{FreedriveAction, ReverseInterface, TrajectoryControlAction};
use crate::script_command::{ForceMode, ScriptCommandInterface, ToolVoltage};
use crate::script_composer::ScriptComposer;
use crate::script_sender::ScriptSender;
use crate::serial::{SerialCommunication, SerialConfig};
use crate::tcp_server::Reactor;
use crate::trajectory::{TrajectoryInterface, TrajectoryMotionResult};
use crate::{EcdError, Result};

/// External control driver for one robot.
pub struct Driver {
    config: DriverConfig,
    script: String,
    reverse: ReverseInterface,
    script_command: ScriptCommandInterface,
    trajectory: TrajectoryInterface,
    script_sender: Option<ScriptSender>,
}

impl Driver {
    /// Build the driver: read the script template, bind the interfaces,
    /// compose the script from the actually bound ports and publish it
    /// (script sender, or primary-port push in headless mode).
    pub fn new(config: DriverConfig) -> Result<Driver> {
        let template = fs::read_to_string(&config.script_file_path).map_err(|e| {
            EcdError::Config(format!(
                "Failed to read script template {}: {}",
                config.script_file_path.display(),
                e
            ))
        })?;

        let reactor = Reactor::shared()?;
        let reverse = ReverseInterface::new(Arc::clone(&reactor), config.reverse_port)?;
        let script_command =
            ScriptCommandInterface::new(Arc::clone(&reactor), config.script_command_port)?;
        let trajectory = TrajectoryInterface::new(Arc::clone(&reactor), config.trajectory_port)?;
        let script_sender = if config.headless_mode {
            None
        } else {
            Some(ScriptSender::new(Arc::clone(&reactor), config.script_sender_port)?)
        };

        // A transient primary connection resolves the local address and,
        // in headless mode, delivers the script.
        let primary = PrimaryPortClient::new();
        let needs_primary = config.headless_mode || config.local_ip.is_none();
        let primary_up = needs_primary && primary.connect(&config.robot_ip, PRIMARY_PORT);

        let local_ip = match &config.local_ip {
            Some(ip) => ip.clone(),
            None => {
                let ip = primary.get_local_ip();
                if ip.is_empty() {
                    return Err(EcdError::Config(
                        "local_ip not set and local address discovery failed".to_string(),
                    ));
                }
                ip
            }
        };

        let script = ScriptComposer::new()
            .value("HOST_IP", local_ip.as_str())
            .value("REVERSE_PORT", reverse.local_port())
            .value(
                "SCRIPT_SENDER_PORT",
                script_sender
                    .as_ref()
                    .map(|sender| sender.local_port())
                    .unwrap_or(config.script_sender_port),
            )
            .value("SCRIPT_COMMAND_PORT", script_command.local_port())
            .value("TRAJECTORY_PORT", trajectory.local_port())
            .value("SERVOJ_TIME", config.servoj_time)
            .value("SERVOJ_LOOKAHEAD_TIME", config.servoj_lookahead_time)
            .value("SERVOJ_GAIN", config.servoj_gain)
            .value("STOPJ_ACC", config.stopj_acc)
            .compose(&template)?;

        if let Some(sender) = &script_sender {
            sender.start(script.clone());
            info!(
                "Serving external control script on port {}",
                sender.local_port()
            );
        }
        if config.headless_mode {
            if primary_up && primary.send_script(&script) {
                info!("External control script sent to {}", config.robot_ip);
            } else {
                warn!("Could not deliver external control script; call send_external_control_script() once the robot is reachable");
            }
        }
        drop(primary);

        Ok(Driver {
            config,
            script,
            reverse,
            script_command,
            trajectory,
            script_sender,
        })
    }

    /// True while the robot's control script is connected to the reverse
    /// channel.
    pub fn is_robot_connected(&self) -> bool {
        self.reverse.is_robot_connected()
    }

    /// The composed control script.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn reverse_port(&self) -> u16 {
        self.reverse.local_port()
    }

    pub fn trajectory_port(&self) -> u16 {
        self.trajectory.local_port()
    }

    pub fn script_command_port(&self) -> u16 {
        self.script_command.local_port()
    }

    /// Port of the script sender, absent in headless mode.
    pub fn script_sender_port(&self) -> Option<u16> {
        self.script_sender.as_ref().map(|sender| sender.local_port())
    }

    /// Re-send the composed script through a fresh primary connection
    /// (headless helper).
    pub fn send_external_control_script(&self) -> bool {
        let primary = PrimaryPortClient::new();
        if !primary.connect(&self.config.robot_ip, PRIMARY_PORT) {
            return false;
        }
        let sent = primary.send_script(&self.script);
        primary.disconnect();
        sent
    }

    /// Emit a reverse STOP and drop every robot connection.
    pub fn stop_control(&self) -> bool {
        let stopped = self.reverse.write_stop();
        self.reverse.release();
        self.trajectory.release();
        self.script_command.release();
        stopped
    }

    // Realtime channel -----------------------------------------------------

    pub fn write_servoj(&self, positions: &Vector6d, timeout_ms: u32) -> bool {
        self.reverse.write_servoj(
            positions,
            timeout_ms,
            self.config.servoj_lookahead_time,
            self.config.servoj_gain,
        )
    }

    pub fn write_speedj(&self, velocities: &Vector6d, timeout_ms: u32) -> bool {
        self.reverse.write_speedj(velocities, timeout_ms)
    }

    pub fn write_speedl(&self, velocities: &Vector6d, timeout_ms: u32) -> bool {
        self.reverse.write_speedl(velocities, timeout_ms)
    }

    pub fn write_servo_pose(&self, pose: &Vector6d, timeout_ms: u32) -> bool {
        self.reverse.write_servo_pose(pose, timeout_ms)
    }

    pub fn write_idle(&self, timeout_ms: u32) -> bool {
        self.reverse.write_idle(timeout_ms)
    }

    pub fn write_freedrive(&self, action: FreedriveAction, timeout_ms: u32) -> bool {
        self.reverse.write_freedrive(action, timeout_ms)
    }

    pub fn write_trajectory_control(
        &self,
        action: TrajectoryControlAction,
        point_count: i32,
        timeout_ms: u32,
    ) -> bool {
        self.reverse
            .write_trajectory_control(action, point_count, timeout_ms)
    }

    // Trajectory channel ---------------------------------------------------

    pub fn write_trajectory_point(
        &self,
        positions: &Vector6d,
        time_s: f64,
        blend_radius_m: f64,
        cartesian: bool,
    ) -> bool {
        self.trajectory
            .write_trajectory_point(positions, time_s, blend_radius_m, cartesian)
    }

    pub fn set_trajectory_result_callback<F>(&self, cb: F)
    where
        F: Fn(TrajectoryMotionResult) + Send + Sync + 'static,
    {
        self.trajectory.set_trajectory_result_callback(cb);
    }

    // Script command channel -----------------------------------------------

    pub fn zero_ft_sensor(&self) -> bool {
        self.script_command.zero_ft_sensor()
    }

    pub fn set_payload(&self, mass: f64, cog: &[f64; 3]) -> bool {
        self.script_command.set_payload(mass, cog)
    }

    pub fn set_tool_voltage(&self, voltage: ToolVoltage) -> bool {
        self.script_command.set_tool_voltage(voltage)
    }

    pub fn start_force_mode(
        &self,
        task_frame: &Vector6d,
        selection_vector: &Vector6i32,
        wrench: &Vector6d,
        mode: ForceMode,
        limits: &Vector6d,
    ) -> bool {
        self.script_command
            .start_force_mode(task_frame, selection_vector, wrench, mode, limits)
    }

    pub fn end_force_mode(&self) -> bool {
        self.script_command.end_force_mode()
    }

    /// Open the tool RS485 tunnel and hand back a client bound to it.
    /// The caller connects it once the robot-side bridge is up.
    pub fn start_tool_rs485(
        &self,
        config: &SerialConfig,
        tcp_port: u16,
    ) -> Option<SerialCommunication> {
        if self.script_command.start_tool_rs485(config, tcp_port) {
            Some(SerialCommunication::new(&self.config.robot_ip, tcp_port))
        } else {
            None
        }
    }

    pub fn end_tool_rs485(&self) -> bool {
        self.script_command.end_tool_rs485()
    }

    /// Open the controller board RS485 tunnel.
    pub fn start_board_rs485(
        &self,
        config: &SerialConfig,
        tcp_port: u16,
    ) -> Option<SerialCommunication> {
        if self.script_command.start_board_rs485(config, tcp_port) {
            Some(SerialCommunication::new(&self.config.robot_ip, tcp_port))
        } else {
            None
        }
    }

    pub fn end_board_rs485(&self) -> bool {
        self.script_command.end_board_rs485()
    }
}
