//! RS485 tunnel client
//!
//! Once the robot acknowledges a serial-start command, it exposes the
//! tool or controller RS485 line as a small TCP server. This client is
//! handed to the host by the driver façade after the handshake.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Supported RS485 baud rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum BaudRate {
    Br2400 = 2400,
    Br4800 = 4800,
    Br9600 = 9600,
    Br19200 = 19200,
    Br38400 = 38400,
    Br57600 = 57600,
    Br115200 = 115_200,
    Br460800 = 460_800,
    Br1000000 = 1_000_000,
    Br2000000 = 2_000_000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum StopBits {
    One = 1,
    Two = 2,
}

/// Line settings sent with the serial-start command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub baud_rate: BaudRate,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: BaudRate::Br115200,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// TCP client for the robot-hosted RS485 bridge.
pub struct SerialCommunication {
    ip: String,
    port: u16,
    socket: Mutex<Option<TcpStream>>,
}

impl SerialCommunication {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            socket: Mutex::new(None),
        }
    }

    /// Connect to the bridge. Replaces any existing connection.
    pub fn connect(&self, timeout_ms: u64) -> bool {
        self.disconnect();
        let addr: SocketAddr = match format!("{}:{}", self.ip, self.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Invalid serial bridge address {}:{}: {}", self.ip, self.port, e);
                return false;
            }
        };
        match TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms)) {
            Ok(socket) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on serial socket: {}", e);
                }
                *self.socket.lock().unwrap() = Some(socket);
                true
            }
            Err(e) => {
                error!("Serial connect to {} failed: {}", addr, e);
                false
            }
        }
    }

    pub fn disconnect(&self) {
        if let Some(socket) = self.socket.lock().unwrap().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    /// Write `data` in full to the bridge.
    pub fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.socket.lock().unwrap();
        let socket = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial bridge not connected")
        })?;
        socket.write_all(data)?;
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes, waiting at most `timeout_ms`
    /// (0 blocks until the buffer is full). Returns the bytes read, which
    /// may be fewer than requested when the deadline expires first.
    pub fn read(&self, buf: &mut [u8], timeout_ms: u64) -> std::io::Result<usize> {
        let mut guard = self.socket.lock().unwrap();
        let socket = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "serial bridge not connected")
        })?;

        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        socket.set_read_timeout(deadline.map(|_| Duration::from_millis(timeout_ms.min(50))))?;

        let mut filled = 0;
        while filled < buf.len() {
            match socket.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial bridge closed the connection",
                    ))
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    match deadline {
                        Some(deadline) if Instant::now() >= deadline => break,
                        _ => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Drop for SerialCommunication {
    fn drop(&mut self) {
        self.disconnect();
    }
}
