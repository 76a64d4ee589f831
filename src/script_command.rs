//! Script command interface: low-rate request channel
//!
//! Directives the robot-side script executes outside the realtime loop:
//! force mode, payload, tool voltage and the RS485 tunnels. Serial
//! commands are acknowledged by the robot with a single int32 result on
//! the same socket; the acknowledgement is correlated here with a
//! one-shot receive callback armed before the command is written.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::control::{encode_frame, scale, Vector6d, Vector6i32, COMMON_ZOOM_RATIO};
use crate::serial::SerialConfig;
use crate::tcp_server::{Reactor, TcpServer};
use crate::Result;

/// Slots per script command frame.
pub const SCRIPT_COMMAND_DATA_SIZE: usize = 26;

const SERIAL_RESULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
#[repr(i32)]
enum Cmd {
    ZeroFtSensor = 0,
    SetPayload = 1,
    SetToolVoltage = 2,
    StartForceMode = 3,
    EndForceMode = 4,
    StartToolRs485 = 5,
    EndToolRs485 = 6,
    StartBoardRs485 = 7,
    EndBoardRs485 = 8,
}

/// Supply voltage of the tool connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ToolVoltage {
    Off = 0,
    V12 = 12,
    V24 = 24,
}

/// Force mode flavor understood by the robot controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ForceMode {
    Point = 1,
    Simple = 2,
    Motion = 3,
}

/// Robot acknowledgement for serial tunnel commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialResult {
    Fail,
    Start,
    End,
}

impl SerialResult {
    fn from_wire(raw: i32) -> SerialResult {
        match raw {
            1 => SerialResult::Start,
            2 => SerialResult::End,
            _ => SerialResult::Fail,
        }
    }
}

/// Host endpoint for script directives (default port 50004).
pub struct ScriptCommandInterface {
    server: TcpServer,
    // At most one correlated serial command may be outstanding.
    serial_gate: Mutex<()>,
}

impl ScriptCommandInterface {
    pub fn new(reactor: Arc<Reactor>, port: u16) -> Result<Self> {
        let server = TcpServer::new(reactor, port, 4)?;
        server.start_listen();
        Ok(Self {
            server,
            serial_gate: Mutex::new(()),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.server.local_port()
    }

    pub fn is_robot_connected(&self) -> bool {
        self.server.is_client_connected()
    }

    pub fn release(&self) {
        self.server.release_client();
    }

    /// Tare the force/torque sensor.
    pub fn zero_ft_sensor(&self) -> bool {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = Cmd::ZeroFtSensor as i32;
        self.send(&frame)
    }

    /// Declare payload mass (kg) and center of gravity (m).
    pub fn set_payload(&self, mass: f64, cog: &[f64; 3]) -> bool {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = Cmd::SetPayload as i32;
        frame[1] = scale(mass, COMMON_ZOOM_RATIO);
        for (slot, value) in frame[2..5].iter_mut().zip(cog.iter()) {
            *slot = scale(*value, COMMON_ZOOM_RATIO);
        }
        self.send(&frame)
    }

    pub fn set_tool_voltage(&self, voltage: ToolVoltage) -> bool {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = Cmd::SetToolVoltage as i32;
        frame[1] = scale(voltage as i32 as f64, COMMON_ZOOM_RATIO);
        self.send(&frame)
    }

    /// Enter force control. Layout: command, task frame, selection vector,
    /// wrench, mode, limits; one slot each except the 6-vectors.
    pub fn start_force_mode(
        &self,
        task_frame: &Vector6d,
        selection_vector: &Vector6i32,
        wrench: &Vector6d,
        mode: ForceMode,
        limits: &Vector6d,
    ) -> bool {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = Cmd::StartForceMode as i32;
        for (slot, value) in frame[1..7].iter_mut().zip(task_frame.iter()) {
            *slot = scale(*value, COMMON_ZOOM_RATIO);
        }
        frame[7..13].copy_from_slice(selection_vector);
        for (slot, value) in frame[13..19].iter_mut().zip(wrench.iter()) {
            *slot = scale(*value, COMMON_ZOOM_RATIO);
        }
        frame[19] = mode as i32;
        for (slot, value) in frame[20..26].iter_mut().zip(limits.iter()) {
            *slot = scale(*value, COMMON_ZOOM_RATIO);
        }
        self.send(&frame)
    }

    pub fn end_force_mode(&self) -> bool {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = Cmd::EndForceMode as i32;
        self.send(&frame)
    }

    /// Tunnel the tool RS485 line to `tcp_port` on the robot. Blocks until
    /// the robot acknowledges or 5 s elapse.
    pub fn start_tool_rs485(&self, config: &SerialConfig, tcp_port: u16) -> bool {
        let frame = Self::serial_frame(Cmd::StartToolRs485, Some((config, tcp_port)));
        self.serial_command(&frame, SerialResult::Start, SERIAL_RESULT_TIMEOUT)
    }

    pub fn end_tool_rs485(&self) -> bool {
        let frame = Self::serial_frame(Cmd::EndToolRs485, None);
        self.serial_command(&frame, SerialResult::End, SERIAL_RESULT_TIMEOUT)
    }

    /// Tunnel the controller board RS485 line to `tcp_port` on the robot.
    pub fn start_board_rs485(&self, config: &SerialConfig, tcp_port: u16) -> bool {
        let frame = Self::serial_frame(Cmd::StartBoardRs485, Some((config, tcp_port)));
        self.serial_command(&frame, SerialResult::Start, SERIAL_RESULT_TIMEOUT)
    }

    pub fn end_board_rs485(&self) -> bool {
        let frame = Self::serial_frame(Cmd::EndBoardRs485, None);
        self.serial_command(&frame, SerialResult::End, SERIAL_RESULT_TIMEOUT)
    }

    fn serial_frame(
        cmd: Cmd,
        config: Option<(&SerialConfig, u16)>,
    ) -> [i32; SCRIPT_COMMAND_DATA_SIZE] {
        let mut frame = [0i32; SCRIPT_COMMAND_DATA_SIZE];
        frame[0] = cmd as i32;
        if let Some((config, tcp_port)) = config {
            frame[1] = config.baud_rate as i32;
            frame[2] = config.parity as i32;
            frame[3] = config.stop_bits as i32;
            frame[4] = tcp_port as i32;
        }
        frame
    }

    fn serial_command(
        &self,
        frame: &[i32; SCRIPT_COMMAND_DATA_SIZE],
        expected: SerialResult,
        timeout: Duration,
    ) -> bool {
        let _outstanding = self.serial_gate.lock().unwrap();
        let (tx, rx) = mpsc::channel();
        self.server.set_receive_callback(move |bytes| {
            if bytes.len() == 4 {
                let raw = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let _ = tx.send(raw);
            }
        });
        if !self.send(frame) {
            self.server.unset_receive_callback();
            return false;
        }
        let outcome = rx.recv_timeout(timeout);
        self.server.unset_receive_callback();
        match outcome {
            Ok(raw) => {
                let result = SerialResult::from_wire(raw);
                if result == expected {
                    true
                } else {
                    error!("Serial command failed, robot answered {:?} ({})", result, raw);
                    false
                }
            }
            Err(_) => {
                error!("Serial command timed out waiting for robot acknowledgement");
                false
            }
        }
    }

    fn send(&self, frame: &[i32; SCRIPT_COMMAND_DATA_SIZE]) -> bool {
        match self.server.write_client(&encode_frame(frame)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Script command write failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn connected_pair() -> (ScriptCommandInterface, TcpStream) {
        let reactor = Reactor::shared().unwrap();
        let interface = ScriptCommandInterface::new(reactor, 0).unwrap();
        let client = TcpStream::connect(("127.0.0.1", interface.local_port())).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        for _ in 0..100 {
            if interface.is_robot_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(interface.is_robot_connected());
        (interface, client)
    }

    fn read_frame(client: &mut TcpStream) -> Vec<i32> {
        let mut bytes = [0u8; SCRIPT_COMMAND_DATA_SIZE * 4];
        client.read_exact(&mut bytes).unwrap();
        bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn test_set_payload_layout() {
        let (interface, mut client) = connected_pair();
        assert!(interface.set_payload(1.5, &[0.01, -0.02, 0.3]));
        let frame = read_frame(&mut client);
        assert_eq!(frame[0], Cmd::SetPayload as i32);
        assert_eq!(frame[1], 1_500_000);
        assert_eq!(frame[2], 10_000);
        assert_eq!(frame[3], -20_000);
        assert_eq!(frame[4], 300_000);
        assert!(frame[5..].iter().all(|&slot| slot == 0));
    }

    #[test]
    fn test_force_mode_layout() {
        let (interface, mut client) = connected_pair();
        let task_frame = [0.1, 0.2, 0.3, 0.0, 0.0, 0.0];
        let selection = [1, 0, 1, 0, 0, 0];
        let wrench = [5.0, 0.0, -5.0, 0.0, 0.0, 0.0];
        let limits = [0.1, 0.1, 0.1, 0.5, 0.5, 0.5];
        assert!(interface.start_force_mode(
            &task_frame,
            &selection,
            &wrench,
            ForceMode::Simple,
            &limits
        ));

        let frame = read_frame(&mut client);
        assert_eq!(frame[0], Cmd::StartForceMode as i32);
        assert_eq!(frame[1], 100_000);
        assert_eq!(frame[7..13], selection);
        assert_eq!(frame[13], 5_000_000);
        assert_eq!(frame[15], -5_000_000);
        assert_eq!(frame[19], ForceMode::Simple as i32);
        assert_eq!(frame[25], 500_000);
    }

    #[test]
    fn test_serial_start_acknowledged() {
        let (interface, mut client) = connected_pair();
        let responder = std::thread::spawn(move || {
            let mut bytes = [0u8; SCRIPT_COMMAND_DATA_SIZE * 4];
            client.read_exact(&mut bytes).unwrap();
            let cmd = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(cmd, Cmd::StartToolRs485 as i32);
            // Acknowledge with START.
            client.write_all(&1i32.to_be_bytes()).unwrap();
        });

        assert!(interface.start_tool_rs485(&SerialConfig::default(), 54321));
        responder.join().unwrap();
    }

    #[test]
    fn test_serial_ack_timeout_and_mismatch() {
        let (interface, mut client) = connected_pair();
        let frame = ScriptCommandInterface::serial_frame(
            Cmd::EndToolRs485,
            None,
        );
        // No acknowledgement at all: times out.
        assert!(!interface.serial_command(&frame, SerialResult::End, Duration::from_millis(200)));
        let mut sink = [0u8; SCRIPT_COMMAND_DATA_SIZE * 4];
        client.read_exact(&mut sink).unwrap();

        // Wrong acknowledgement: rejected.
        let responder = std::thread::spawn(move || {
            let mut bytes = [0u8; SCRIPT_COMMAND_DATA_SIZE * 4];
            client.read_exact(&mut bytes).unwrap();
            client.write_all(&1i32.to_be_bytes()).unwrap();
        });
        assert!(!interface.serial_command(&frame, SerialResult::End, Duration::from_secs(2)));
        responder.join().unwrap();
    }
}
