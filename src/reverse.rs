//! Reverse interface: the realtime command channel
//!
//! The robot-side control script polls this port at 1 kHz; every `write_*`
//! call emits exactly one 28-slot int32 frame. The host must keep issuing
//! frames at least once per declared receive timeout or the robot aborts
//! the active mode; this module does not inject keepalives.

use std::sync::Arc;

use tracing::debug;

use crate::control::{encode_frame, scale, Vector6d, POS_ZOOM_RATIO, TIME_ZOOM_RATIO};
use crate::tcp_server::{Reactor, TcpServer};
use crate::Result;

/// Slots per reverse frame.
pub const REVERSE_DATA_SIZE: usize = 28;

const MODE_SLOT: usize = 24;
const TIMEOUT_SLOT: usize = 25;
const LOOKAHEAD_SLOT: usize = 6;
const GAIN_SLOT: usize = 7;
const TRAJECTORY_DATA_SLOT: usize = 0;

/// Default servoj lookahead time in seconds.
pub const DEFAULT_SERVOJ_LOOKAHEAD_TIME: f64 = 0.1;
/// Default servoj proportional gain.
pub const DEFAULT_SERVOJ_GAIN: i32 = 300;

/// Wire value carried in the mode slot of every reverse frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlMode {
    Stop = -1,
    Idle = 0,
    Servoj = 1,
    Speedj = 2,
    Speedl = 3,
    Pose = 4,
    FreedriveStart = 5,
    FreedriveEnd = 6,
    FreedriveNoop = 7,
    TrajectoryStart = 8,
    TrajectoryCancel = 9,
    TrajectoryNoop = 10,
}

/// Freedrive sub-commands exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreedriveAction {
    Start,
    Noop,
    End,
}

impl FreedriveAction {
    fn mode(self) -> ControlMode {
        match self {
            FreedriveAction::Start => ControlMode::FreedriveStart,
            FreedriveAction::Noop => ControlMode::FreedriveNoop,
            FreedriveAction::End => ControlMode::FreedriveEnd,
        }
    }
}

/// Trajectory sub-commands exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryControlAction {
    Start,
    Noop,
    Cancel,
}

impl TrajectoryControlAction {
    fn mode(self) -> ControlMode {
        match self {
            TrajectoryControlAction::Start => ControlMode::TrajectoryStart,
            TrajectoryControlAction::Noop => ControlMode::TrajectoryNoop,
            TrajectoryControlAction::Cancel => ControlMode::TrajectoryCancel,
        }
    }
}

/// Host endpoint for the 1 kHz realtime command stream (default port 50001).
pub struct ReverseInterface {
    server: TcpServer,
}

impl ReverseInterface {
    pub fn new(reactor: Arc<Reactor>, port: u16) -> Result<Self> {
        let server = TcpServer::new(reactor, port, 4)?;
        server.start_listen();
        Ok(Self { server })
    }

    pub fn local_port(&self) -> u16 {
        self.server.local_port()
    }

    pub fn is_robot_connected(&self) -> bool {
        self.server.is_client_connected()
    }

    /// Close the robot-side connection; the robot re-accepts on restart.
    pub fn release(&self) {
        self.server.release_client();
    }

    /// Joint servo target. `lookahead_time` and `gain` tune the robot-side
    /// servoj smoothing.
    pub fn write_servoj(
        &self,
        positions: &Vector6d,
        timeout_ms: u32,
        lookahead_time: f64,
        gain: i32,
    ) -> bool {
        let mut frame = Self::motion_frame(positions, ControlMode::Servoj, timeout_ms);
        frame[LOOKAHEAD_SLOT] = scale(lookahead_time, TIME_ZOOM_RATIO);
        frame[GAIN_SLOT] = scale(gain as f64, TIME_ZOOM_RATIO);
        self.write_frame(&frame)
    }

    /// Joint velocity target (rad/s).
    pub fn write_speedj(&self, velocities: &Vector6d, timeout_ms: u32) -> bool {
        let frame = Self::motion_frame(velocities, ControlMode::Speedj, timeout_ms);
        self.write_frame(&frame)
    }

    /// Cartesian velocity target (m/s, rad/s).
    pub fn write_speedl(&self, velocities: &Vector6d, timeout_ms: u32) -> bool {
        let frame = Self::motion_frame(velocities, ControlMode::Speedl, timeout_ms);
        self.write_frame(&frame)
    }

    /// Cartesian pose servo target (m, rad).
    pub fn write_servo_pose(&self, pose: &Vector6d, timeout_ms: u32) -> bool {
        let frame = Self::motion_frame(pose, ControlMode::Pose, timeout_ms);
        self.write_frame(&frame)
    }

    /// Keepalive frame; holds the current mode window open.
    pub fn write_idle(&self, timeout_ms: u32) -> bool {
        let frame = Self::control_frame(ControlMode::Idle, timeout_ms);
        self.write_frame(&frame)
    }

    /// Terminate external control. The robot-side script exits its loop.
    pub fn write_stop(&self) -> bool {
        let frame = Self::control_frame(ControlMode::Stop, 0);
        self.write_frame(&frame)
    }

    pub fn write_freedrive(&self, action: FreedriveAction, timeout_ms: u32) -> bool {
        let frame = Self::control_frame(action.mode(), timeout_ms);
        self.write_frame(&frame)
    }

    /// Trajectory window control. For [`TrajectoryControlAction::Start`],
    /// `point_count` declares how many points will follow on the
    /// trajectory channel.
    pub fn write_trajectory_control(
        &self,
        action: TrajectoryControlAction,
        point_count: i32,
        timeout_ms: u32,
    ) -> bool {
        let mut frame = Self::control_frame(action.mode(), timeout_ms);
        frame[TRAJECTORY_DATA_SLOT] = point_count;
        self.write_frame(&frame)
    }

    fn motion_frame(
        targets: &Vector6d,
        mode: ControlMode,
        timeout_ms: u32,
    ) -> [i32; REVERSE_DATA_SIZE] {
        let mut frame = [0i32; REVERSE_DATA_SIZE];
        for (slot, value) in frame.iter_mut().zip(targets.iter()) {
            *slot = scale(*value, POS_ZOOM_RATIO);
        }
        frame[MODE_SLOT] = mode as i32;
        frame[TIMEOUT_SLOT] = timeout_ms as i32;
        frame
    }

    fn control_frame(mode: ControlMode, timeout_ms: u32) -> [i32; REVERSE_DATA_SIZE] {
        let mut frame = [0i32; REVERSE_DATA_SIZE];
        frame[MODE_SLOT] = mode as i32;
        frame[TIMEOUT_SLOT] = timeout_ms as i32;
        frame
    }

    fn write_frame(&self, frame: &[i32; REVERSE_DATA_SIZE]) -> bool {
        match self.server.write_client(&encode_frame(frame)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Reverse write failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    fn decode_frame(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn connected_pair() -> (ReverseInterface, TcpStream) {
        let reactor = Reactor::shared().unwrap();
        let interface = ReverseInterface::new(reactor, 0).unwrap();
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
        let mut bytes = [0u8; REVERSE_DATA_SIZE * 4];
        client.read_exact(&mut bytes).unwrap();
        decode_frame(&bytes)
    }

    #[test]
    fn test_servoj_frame_layout() {
        let (interface, mut client) = connected_pair();
        assert!(interface.write_servoj(
            &[0.0, 0.0, 0.0, 0.0, 0.0, 1.5707963],
            100,
            DEFAULT_SERVOJ_LOOKAHEAD_TIME,
            DEFAULT_SERVOJ_GAIN,
        ));

        let frame = read_frame(&mut client);
        assert_eq!(frame.len(), REVERSE_DATA_SIZE);
        assert_eq!(frame[5], 1_570_796);
        assert_eq!(frame[LOOKAHEAD_SLOT], 100);
        assert_eq!(frame[GAIN_SLOT], 300_000);
        assert_eq!(frame[MODE_SLOT], ControlMode::Servoj as i32);
        assert_eq!(frame[TIMEOUT_SLOT], 100);
    }

    #[test]
    fn test_freedrive_keepalive_sequence() {
        let (interface, mut client) = connected_pair();
        assert!(interface.write_freedrive(FreedriveAction::Start, 100));
        for _ in 0..10 {
            assert!(interface.write_freedrive(FreedriveAction::Noop, 100));
            std::thread::sleep(Duration::from_millis(10));
        }

        let frame = read_frame(&mut client);
        assert_eq!(frame[MODE_SLOT], ControlMode::FreedriveStart as i32);
        assert_eq!(frame[TIMEOUT_SLOT], 100);
        for _ in 0..10 {
            let frame = read_frame(&mut client);
            assert_eq!(frame[MODE_SLOT], ControlMode::FreedriveNoop as i32);
            assert_eq!(frame[TIMEOUT_SLOT], 100);
        }
    }

    #[test]
    fn test_trajectory_start_carries_point_count() {
        let (interface, mut client) = connected_pair();
        assert!(interface.write_trajectory_control(TrajectoryControlAction::Start, 3, 200));
        let frame = read_frame(&mut client);
        assert_eq!(frame[TRAJECTORY_DATA_SLOT], 3);
        assert_eq!(frame[MODE_SLOT], ControlMode::TrajectoryStart as i32);
        assert_eq!(frame[TIMEOUT_SLOT], 200);
    }

    #[test]
    fn test_stop_frame_and_negative_targets() {
        let (interface, mut client) = connected_pair();
        assert!(interface.write_speedj(&[-0.25, 0.0, 0.0, 0.0, 0.0, 0.0], 50));
        assert!(interface.write_stop());

        let frame = read_frame(&mut client);
        assert_eq!(frame[0], -250_000);
        assert_eq!(frame[MODE_SLOT], ControlMode::Speedj as i32);
        let frame = read_frame(&mut client);
        assert_eq!(frame[MODE_SLOT], ControlMode::Stop as i32);
        assert_eq!(frame[TIMEOUT_SLOT], 0);
    }

    #[test]
    fn test_write_without_robot_returns_false() {
        let reactor = Reactor::shared().unwrap();
        let interface = ReverseInterface::new(reactor, 0).unwrap();
        assert!(!interface.write_idle(100));
    }
}
