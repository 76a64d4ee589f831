//! ECD (External Control Driver) Library
//!
//! Pure Rust driver for external control of an industrial robot arm over
//! the vendor's TCP interfaces: realtime setpoint streaming, buffered
//! trajectories, freedrive, force control, RS485 tunneling and the
//! primary-port broadcast (kinematics, robot exceptions).
//!
//! The robot-side control script polls the host; the [`Driver`] façade
//! binds the host endpoints, composes that script and multiplexes the
//! host's commands onto the channels.

pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod kinematics;
pub mod primary;
pub mod reverse;
pub mod robot_exception;
pub mod script_command;
pub mod script_composer;
pub mod script_sender;
pub mod serial;
pub mod tcp_server;
pub mod trajectory;

pub use config::DriverConfig;
pub use control::{Vector6d, Vector6i32};
pub use driver::Driver;
pub use error::{EcdError, Result};
pub use kinematics::KinematicsInfo;
pub use primary::{PrimaryPackage, PrimaryPortClient, PRIMARY_PORT, SECONDARY_PORT};
pub use reverse::{ControlMode, FreedriveAction, ReverseInterface, TrajectoryControlAction};
pub use robot_exception::{
    ErrorData, ErrorLevel, ExceptionSource, RobotError, RobotException, RobotRuntimeException,
    RobotUnknownException,
};
pub use script_command::{ForceMode, ScriptCommandInterface, SerialResult, ToolVoltage};
pub use script_composer::{ScriptComposer, ScriptValue};
pub use script_sender::ScriptSender;
pub use serial::{BaudRate, Parity, SerialCommunication, SerialConfig, StopBits};
pub use tcp_server::{Reactor, TcpServer};
pub use trajectory::{TrajectoryInterface, TrajectoryMotionResult};
