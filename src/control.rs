//! Fixed-point encoding shared by the realtime control channels
//!
//! Floating point quantities are transmitted as scaled, rounded int32 in
//! network byte order. A given logical value therefore has exactly one
//! wire representation.

/// Six joint values (rad) or a Cartesian pose (m, rad).
pub type Vector6d = [f64; 6];

/// Six raw int32 values (e.g. a force-mode selection vector).
pub type Vector6i32 = [i32; 6];

/// Scale factor for positions, poses and most command payloads.
pub const POS_ZOOM_RATIO: f64 = 1_000_000.0;

/// Scale factor for time quantities (seconds on the wire as milliseconds).
pub const TIME_ZOOM_RATIO: f64 = 1_000.0;

/// Scale factor for script command payloads.
pub const COMMON_ZOOM_RATIO: f64 = 1_000_000.0;

/// Encode a floating point value into its canonical fixed-point slot.
pub(crate) fn scale(value: f64, zoom: f64) -> i32 {
    (value * zoom).round() as i32
}

/// Serialize a frame of int32 slots into big-endian wire bytes.
pub(crate) fn encode_frame(slots: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(slots.len() * 4);
    for slot in slots {
        bytes.extend_from_slice(&slot.to_be_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_rounds_to_canonical_slot() {
        assert_eq!(scale(1.5707963, POS_ZOOM_RATIO), 1_570_796);
        assert_eq!(scale(-1.5707963, POS_ZOOM_RATIO), -1_570_796);
        assert_eq!(scale(0.1, TIME_ZOOM_RATIO), 100);
        assert_eq!(scale(0.0, POS_ZOOM_RATIO), 0);
    }

    #[test]
    fn test_scaled_round_trip_within_half_tick() {
        for value in [0.0, 0.123456789, -2.718281828, 3.14159265] {
            let decoded = scale(value, POS_ZOOM_RATIO) as f64 / POS_ZOOM_RATIO;
            assert!((decoded - value).abs() <= 0.5 / POS_ZOOM_RATIO);
        }
    }

    #[test]
    fn test_encode_frame_is_big_endian() {
        let bytes = encode_frame(&[1, -1]);
        assert_eq!(bytes, vec![0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]);
    }
}
