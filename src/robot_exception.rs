//! Robot exception decoding
//!
//! Bodies of primary message type 20 carry asynchronous fault reports:
//! either a controller error record or a script runtime exception. Both
//! are delivered verbatim to the host's exception callback; the driver
//! never acts on them itself. Decoding is total: contents that fit
//! neither known record shape are preserved raw, so every well-framed
//! body reaches the callback exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Wire discriminator for an error record.
const ERROR_KIND: u8 = 6;
/// Wire discriminator for a runtime exception record.
const RUNTIME_KIND: u8 = 10;

/// Subsystem that raised the exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExceptionSource {
    Safety,
    Gui,
    Controller,
    Rtsi,
    Joint,
    Tool,
    TeachPendant,
    JointFpga,
    ToolFpga,
    Unknown(u8),
}

impl From<u8> for ExceptionSource {
    fn from(raw: u8) -> Self {
        match raw {
            99 => ExceptionSource::Safety,
            103 => ExceptionSource::Gui,
            104 => ExceptionSource::Controller,
            105 => ExceptionSource::Rtsi,
            120 => ExceptionSource::Joint,
            121 => ExceptionSource::Tool,
            122 => ExceptionSource::TeachPendant,
            200 => ExceptionSource::JointFpga,
            201 => ExceptionSource::ToolFpga,
            other => ExceptionSource::Unknown(other),
        }
    }
}

/// Severity of an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Fatal,
    Unknown(i32),
}

impl From<i32> for ErrorLevel {
    fn from(raw: i32) -> Self {
        match raw {
            0 => ErrorLevel::Info,
            1 => ErrorLevel::Warning,
            2 => ErrorLevel::Error,
            3 => ErrorLevel::Fatal,
            other => ErrorLevel::Unknown(other),
        }
    }
}

/// Typed payload of an error record. `Raw` preserves payloads with an
/// unrecognized data type or too few bytes for the declared one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ErrorData {
    None,
    Unsigned(u32),
    Signed(i32),
    Float(f32),
    Hex(u32),
    Text(String),
    Joint(u32),
    Raw(Vec<u8>),
}

/// A controller error report.
#[derive(Debug, Clone, Serialize)]
pub struct RobotError {
    pub timestamp_ms: u64,
    pub source: ExceptionSource,
    pub code: i32,
    pub sub_code: i32,
    pub level: ErrorLevel,
    pub data: ErrorData,
}

/// A script runtime exception with its source location.
#[derive(Debug, Clone, Serialize)]
pub struct RobotRuntimeException {
    pub timestamp_ms: u64,
    pub source: ExceptionSource,
    pub line: i32,
    pub column: i32,
    pub message: String,
}

/// An exception body that fits neither known record shape: unrecognized
/// kind byte or a record too short for its kind. The undecoded bytes
/// are kept verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct RobotUnknownException {
    pub timestamp_ms: u64,
    pub source: ExceptionSource,
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Any asynchronous robot fault.
#[derive(Debug, Clone, Serialize)]
pub enum RobotException {
    Error(RobotError),
    Runtime(RobotRuntimeException),
    Unknown(RobotUnknownException),
}

impl RobotException {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            RobotException::Error(e) => e.timestamp_ms,
            RobotException::Runtime(e) => e.timestamp_ms,
            RobotException::Unknown(e) => e.timestamp_ms,
        }
    }

    pub fn source(&self) -> ExceptionSource {
        match self {
            RobotException::Error(e) => e.source,
            RobotException::Runtime(e) => e.source,
            RobotException::Unknown(e) => e.source,
        }
    }

    /// Robot timestamp as wall-clock time.
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms() as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

fn read_i32(body: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ])
}

fn read_u32(body: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ])
}

/// Decode one exception body: u64 timestamp (ms), u8 source, u8 kind,
/// then the kind-specific record. Total over arbitrary bytes; a body
/// shorter than the common prefix lands wholesale in the fallback
/// payload.
pub(crate) fn decode(body: &[u8]) -> RobotException {
    if body.len() < 10 {
        return RobotException::Unknown(RobotUnknownException {
            timestamp_ms: 0,
            source: ExceptionSource::Unknown(0),
            kind: 0,
            payload: body.to_vec(),
        });
    }
    let timestamp_ms = u64::from_be_bytes([
        body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
    ]);
    let source = ExceptionSource::from(body[8]);
    let kind = body[9];
    let record = &body[10..];

    match kind {
        ERROR_KIND if record.len() >= 16 => {
            let code = read_i32(record, 0);
            let sub_code = read_i32(record, 4);
            let level = ErrorLevel::from(read_i32(record, 8));
            let data_type = read_u32(record, 12);
            let payload = &record[16..];
            let data = match data_type {
                0 => ErrorData::None,
                1 if payload.len() >= 4 => ErrorData::Unsigned(read_u32(payload, 0)),
                2 if payload.len() >= 4 => ErrorData::Signed(read_i32(payload, 0)),
                3 if payload.len() >= 4 => {
                    ErrorData::Float(f32::from_bits(read_u32(payload, 0)))
                }
                4 if payload.len() >= 4 => ErrorData::Hex(read_u32(payload, 0)),
                5 => ErrorData::Text(String::from_utf8_lossy(payload).into_owned()),
                6 if payload.len() >= 4 => ErrorData::Joint(read_u32(payload, 0)),
                _ => ErrorData::Raw(payload.to_vec()),
            };
            RobotException::Error(RobotError {
                timestamp_ms,
                source,
                code,
                sub_code,
                level,
                data,
            })
        }
        RUNTIME_KIND if record.len() >= 8 => {
            let line = read_i32(record, 0);
            let column = read_i32(record, 4);
            let message = String::from_utf8_lossy(&record[8..]).into_owned();
            RobotException::Runtime(RobotRuntimeException {
                timestamp_ms,
                source,
                line,
                column,
                message,
            })
        }
        _ => RobotException::Unknown(RobotUnknownException {
            timestamp_ms,
            source,
            kind,
            payload: record.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exception_body(source: u8, kind: u8, record: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0000_018F_C2A4_B100u64.to_be_bytes());
        body.push(source);
        body.push(kind);
        body.extend_from_slice(record);
        body
    }

    #[test]
    fn test_decode_runtime_exception() {
        let mut record = Vec::new();
        record.extend_from_slice(&3i32.to_be_bytes());
        record.extend_from_slice(&5i32.to_be_bytes());
        record.extend_from_slice(b"1abcd");
        let body = exception_body(120, RUNTIME_KIND, &record);

        match decode(&body) {
            RobotException::Runtime(e) => {
                assert_eq!(e.timestamp_ms, 0x0000_018F_C2A4_B100);
                assert_eq!(e.source, ExceptionSource::Joint);
                assert_eq!(e.line, 3);
                assert_eq!(e.column, 5);
                assert_eq!(e.message, "1abcd");
            }
            other => panic!("expected runtime exception, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_with_float_payload() {
        let mut record = Vec::new();
        record.extend_from_slice(&517i32.to_be_bytes());
        record.extend_from_slice(&2i32.to_be_bytes());
        record.extend_from_slice(&2i32.to_be_bytes()); // level: Error
        record.extend_from_slice(&3u32.to_be_bytes()); // data type: float
        record.extend_from_slice(&1.25f32.to_bits().to_be_bytes());
        let body = exception_body(104, ERROR_KIND, &record);

        match decode(&body) {
            RobotException::Error(e) => {
                assert_eq!(e.source, ExceptionSource::Controller);
                assert_eq!(e.code, 517);
                assert_eq!(e.sub_code, 2);
                assert_eq!(e.level, ErrorLevel::Error);
                assert_eq!(e.data, ErrorData::Float(1.25));
            }
            other => panic!("expected error record, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_with_text_payload_and_unknown_source() {
        let mut record = Vec::new();
        record.extend_from_slice(&1i32.to_be_bytes());
        record.extend_from_slice(&0i32.to_be_bytes());
        record.extend_from_slice(&3i32.to_be_bytes()); // level: Fatal
        record.extend_from_slice(&5u32.to_be_bytes()); // data type: string
        record.extend_from_slice(b"overheat");
        let body = exception_body(42, ERROR_KIND, &record);

        match decode(&body) {
            RobotException::Error(e) => {
                assert_eq!(e.source, ExceptionSource::Unknown(42));
                assert_eq!(e.level, ErrorLevel::Fatal);
                assert_eq!(e.data, ErrorData::Text("overheat".to_string()));
            }
            other => panic!("expected error record, got {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_data_type_keeps_raw_payload() {
        let mut record = Vec::new();
        record.extend_from_slice(&1i32.to_be_bytes());
        record.extend_from_slice(&0i32.to_be_bytes());
        record.extend_from_slice(&0i32.to_be_bytes());
        record.extend_from_slice(&9u32.to_be_bytes()); // not a known data type
        record.extend_from_slice(&[0xde, 0xad]);
        let body = exception_body(104, ERROR_KIND, &record);

        match decode(&body) {
            RobotException::Error(e) => {
                assert_eq!(e.data, ErrorData::Raw(vec![0xde, 0xad]));
            }
            other => panic!("expected error record, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_typed_payload_keeps_raw_payload() {
        let mut record = Vec::new();
        record.extend_from_slice(&1i32.to_be_bytes());
        record.extend_from_slice(&0i32.to_be_bytes());
        record.extend_from_slice(&0i32.to_be_bytes());
        record.extend_from_slice(&3u32.to_be_bytes()); // float needs 4 bytes
        record.extend_from_slice(&[0x3f, 0x80]); // only 2 arrive
        let body = exception_body(104, ERROR_KIND, &record);

        match decode(&body) {
            RobotException::Error(e) => {
                assert_eq!(e.data, ErrorData::Raw(vec![0x3f, 0x80]));
            }
            other => panic!("expected error record, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_falls_back_verbatim() {
        let body = exception_body(120, 99, &[1, 2, 3]);
        match decode(&body) {
            RobotException::Unknown(e) => {
                assert_eq!(e.timestamp_ms, 0x0000_018F_C2A4_B100);
                assert_eq!(e.source, ExceptionSource::Joint);
                assert_eq!(e.kind, 99);
                assert_eq!(e.payload, vec![1, 2, 3]);
            }
            other => panic!("expected fallback record, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_bodies_still_decode() {
        // Too short for even the timestamp/source/kind prefix.
        match decode(&[7u8; 9]) {
            RobotException::Unknown(e) => {
                assert_eq!(e.kind, 0);
                assert_eq!(e.payload, vec![7u8; 9]);
            }
            other => panic!("expected fallback record, got {:?}", other),
        }
        // Error kind with a record shorter than its fixed part.
        match decode(&exception_body(120, ERROR_KIND, &[0u8; 4])) {
            RobotException::Unknown(e) => {
                assert_eq!(e.source, ExceptionSource::Joint);
                assert_eq!(e.kind, ERROR_KIND);
                assert_eq!(e.payload.len(), 4);
            }
            other => panic!("expected fallback record, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_conversion() {
        let mut record = Vec::new();
        record.extend_from_slice(&1i32.to_be_bytes());
        record.extend_from_slice(&2i32.to_be_bytes());
        record.extend_from_slice(b"x");
        let body = exception_body(122, RUNTIME_KIND, &record);
        let exception = decode(&body);
        assert_eq!(
            exception.timestamp_utc().timestamp_millis() as u64,
            exception.timestamp_ms()
        );
    }
}
