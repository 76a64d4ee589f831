//! Trajectory interface: buffered point stream with result reporting
//!
//! The host declares a trajectory window on the reverse channel, streams
//! the points here, then pumps reverse NOOP frames until the robot pushes
//! back a single int32 result frame.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::control::{encode_frame, scale, Vector6d, POS_ZOOM_RATIO, TIME_ZOOM_RATIO};
use crate::tcp_server::{Reactor, TcpServer};
use crate::Result;

/// Slots per trajectory point frame.
pub const TRAJECTORY_MESSAGE_LEN: usize = 21;

const TIME_SLOT: usize = 18;
const BLEND_SLOT: usize = 19;
const TYPE_SLOT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum TrajectoryMotionType {
    Joint = 0,
    Cartesian = 1,
}

/// Outcome of a buffered trajectory, reported by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryMotionResult {
    Success,
    Canceled,
    Failure,
}

impl TrajectoryMotionResult {
    fn from_wire(raw: i32) -> TrajectoryMotionResult {
        match raw {
            0 => TrajectoryMotionResult::Success,
            1 => TrajectoryMotionResult::Canceled,
            _ => TrajectoryMotionResult::Failure,
        }
    }
}

/// Invoked on the reactor thread for every result frame. Must not block
/// and must not call back into the driver.
pub type TrajectoryResultCallback = Box<dyn Fn(TrajectoryMotionResult) + Send + Sync>;

/// Host endpoint for the trajectory point stream (default port 50003).
pub struct TrajectoryInterface {
    server: TcpServer,
    result_cb: Arc<Mutex<Option<TrajectoryResultCallback>>>,
}

impl TrajectoryInterface {
    pub fn new(reactor: Arc<Reactor>, port: u16) -> Result<Self> {
        let server = TcpServer::new(reactor, port, 4)?;
        let result_cb: Arc<Mutex<Option<TrajectoryResultCallback>>> = Arc::new(Mutex::new(None));
        let dispatch = Arc::clone(&result_cb);
        server.set_receive_callback(move |bytes| {
            if bytes.len() != 4 {
                return;
            }
            let raw = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let result = TrajectoryMotionResult::from_wire(raw);
            if !matches!(raw, 0..=2) {
                warn!("Unknown trajectory result {}, treating as failure", raw);
            }
            if let Some(cb) = dispatch.lock().unwrap().as_ref() {
                cb(result);
            }
        });
        server.start_listen();
        Ok(Self { server, result_cb })
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

    /// Install the long-lived result callback.
    pub fn set_trajectory_result_callback<F>(&self, cb: F)
    where
        F: Fn(TrajectoryMotionResult) + Send + Sync + 'static,
    {
        *self.result_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Stream one trajectory point. `time_s` is the segment duration,
    /// `blend_radius_m` the blend into the next segment; `cartesian`
    /// selects pose targets over joint targets.
    pub fn write_trajectory_point(
        &self,
        positions: &Vector6d,
        time_s: f64,
        blend_radius_m: f64,
        cartesian: bool,
    ) -> bool {
        let mut frame = [0i32; TRAJECTORY_MESSAGE_LEN];
        for (slot, value) in frame.iter_mut().zip(positions.iter()) {
            *slot = scale(*value, POS_ZOOM_RATIO);
        }
        frame[TIME_SLOT] = scale(time_s, TIME_ZOOM_RATIO);
        frame[BLEND_SLOT] = scale(blend_radius_m, POS_ZOOM_RATIO);
        frame[TYPE_SLOT] = if cartesian {
            TrajectoryMotionType::Cartesian as i32
        } else {
            TrajectoryMotionType::Joint as i32
        };

        match self.server.write_client(&encode_frame(&frame)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Trajectory write failed: {}", e);
                false
            }
        }
    }
}
