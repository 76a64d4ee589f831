//! Kinematics sub-package from the robot state broadcast
//!
//! Carries the modified Denavit-Hartenberg parameters of the six joints.
//! The driver only transports them; forward/inverse kinematics live in a
//! pluggable solver on the host side.

use tracing::warn;

use crate::control::Vector6d;
use crate::primary::{PrimaryPackage, SUB_HEAD_LENGTH};

/// Sub-type key of the kinematics package inside a robot state message.
pub const KINEMATICS_INFO_TYPE: u8 = 5;

const DH_VECTOR_BYTES: usize = 6 * 8;
const KINEMATICS_BODY_BYTES: usize = SUB_HEAD_LENGTH + 3 * DH_VECTOR_BYTES;

/// MDH parameters: link lengths `a`, offsets `d` and twists `alpha`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KinematicsInfo {
    pub dh_a: Vector6d,
    pub dh_d: Vector6d,
    pub dh_alpha: Vector6d,
}

fn read_f64(data: &[u8], offset: usize) -> f64 {
    f64::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

impl PrimaryPackage for KinematicsInfo {
    fn package_type(&self) -> u8 {
        KINEMATICS_INFO_TYPE
    }

    fn parse(&mut self, sub_len: u32, data: &[u8]) -> bool {
        if (sub_len as usize) < KINEMATICS_BODY_BYTES || data.len() < KINEMATICS_BODY_BYTES {
            warn!(
                "Kinematics package too short: {} bytes, expected {}",
                data.len(),
                KINEMATICS_BODY_BYTES
            );
            return false;
        }
        let mut offset = SUB_HEAD_LENGTH;
        for slot in self.dh_a.iter_mut() {
            *slot = read_f64(data, offset);
            offset += 8;
        }
        for slot in self.dh_d.iter_mut() {
            *slot = read_f64(data, offset);
            offset += 8;
        }
        for slot in self.dh_alpha.iter_mut() {
            *slot = read_f64(data, offset);
            offset += 8;
        }
        true
    }
}
