//! Primary port client
//!
//! Long-lived connection to the robot's broadcast ports (30001 primary,
//! 30002 secondary). A dedicated background thread reads the framed
//! stream, demultiplexes robot-state sub-packages into one-shot pending
//! registrations and dispatches robot exceptions to the host callback.
//! The same socket doubles as the script ingress in headless mode.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::robot_exception::{self, RobotException};

/// Robot state broadcast message type.
pub const ROBOT_STATE_MSG_TYPE: u8 = 16;
/// Robot exception message type.
pub const ROBOT_EXCEPTION_MSG_TYPE: u8 = 20;
/// Default primary port on the robot controller.
pub const PRIMARY_PORT: u16 = 30001;
/// Default secondary (read-only) port on the robot controller.
pub const SECONDARY_PORT: u16 = 30002;

/// Length of the message header: u32 total length plus u8 type.
const HEAD_LENGTH: usize = 5;
/// Length of a sub-package header inside a robot state body.
pub const SUB_HEAD_LENGTH: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const BODY_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll cadence of the read loop when the stream is idle.
const IDLE_RETRY: Duration = Duration::from_millis(10);

/// A sub-package that can be fetched from the robot state broadcast.
///
/// `parse` receives the sub-package bytes starting at its 5-byte
/// sub-header and returns whether the payload was usable.
pub trait PrimaryPackage: Send {
    fn package_type(&self) -> u8;
    fn parse(&mut self, sub_len: u32, data: &[u8]) -> bool;
}

/// Invoked on the primary read thread for every decoded exception.
/// Must not block and must not call back into the client.
pub type RobotExceptionCallback = Box<dyn Fn(RobotException) + Send + Sync>;

struct PendingEntry {
    package: Arc<Mutex<dyn PrimaryPackage>>,
    ready: Sender<()>,
}

struct Shared {
    socket: Mutex<Option<TcpStream>>,
    pending: Mutex<HashMap<u8, PendingEntry>>,
    exception_cb: Mutex<Option<RobotExceptionCallback>>,
    alive: AtomicBool,
}

enum ReadOutcome {
    Complete,
    Idle,
    Interrupted,
    Failed(std::io::Error),
}

/// Client side of the robot broadcast connection.
///
/// After `disconnect()` the controller needs a moment to tear down its
/// side; allow at least 500 ms before the next `connect()`.
pub struct PrimaryPortClient {
    shared: Arc<Shared>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PrimaryPortClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                socket: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                exception_cb: Mutex::new(None),
                alive: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Connect to `ip:port` and spawn the read thread on first success.
    pub fn connect(&self, ip: &str, port: u16) -> bool {
        if !socket_connect(&self.shared, ip, port) {
            return false;
        }
        let mut reader = self.reader.lock().unwrap();
        if reader.is_none() {
            self.shared.alive.store(true, Ordering::SeqCst);
            let shared = Arc::clone(&self.shared);
            let ip = ip.to_string();
            let spawned = thread::Builder::new()
                .name("ecd-primary".into())
                .spawn(move || read_loop(shared, ip, port));
            match spawned {
                Ok(handle) => *reader = Some(handle),
                Err(e) => {
                    error!("Failed to spawn primary reader thread: {}", e);
                    self.shared.alive.store(false, Ordering::SeqCst);
                    self.shared.socket.lock().unwrap().take();
                    return false;
                }
            }
        }
        true
    }

    /// Shut the connection down and join the read thread.
    pub fn disconnect(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(socket) = self.shared.socket.lock().unwrap().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Send a script program to the robot; a newline terminator is
    /// appended. This is the headless-mode script delivery path.
    pub fn send_script(&self, script: &str) -> bool {
        let mut guard = self.shared.socket.lock().unwrap();
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => {
                error!("Not connected to robot primary port");
                return false;
            }
        };
        let mut payload = Vec::with_capacity(script.len() + 1);
        payload.extend_from_slice(script.as_bytes());
        payload.push(b'\n');
        match socket.write_all(&payload) {
            Ok(()) => true,
            Err(e) => {
                error!("Send script to robot failed: {}", e);
                false
            }
        }
    }

    /// Register `package` and block until the parser fills it or
    /// `timeout_ms` elapses. The registration is one-shot either way.
    pub fn get_package(&self, package: Arc<Mutex<dyn PrimaryPackage>>, timeout_ms: u64) -> bool {
        let sub_type = package.lock().unwrap().package_type();
        let (ready, signal) = mpsc::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(sub_type, PendingEntry { package, ready });
        match signal.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(()) => true,
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&sub_type);
                false
            }
        }
    }

    /// Local address of the connected socket, or an empty string.
    pub fn get_local_ip(&self) -> String {
        match self.shared.socket.lock().unwrap().as_ref() {
            Some(socket) => socket
                .local_addr()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    pub fn register_robot_exception_callback<F>(&self, cb: F)
    where
        F: Fn(RobotException) + Send + Sync + 'static,
    {
        *self.shared.exception_cb.lock().unwrap() = Some(Box::new(cb));
    }
}

impl Default for PrimaryPortClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PrimaryPortClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn socket_connect(shared: &Shared, ip: &str, port: u16) -> bool {
    let addr: SocketAddr = match format!("{}:{}", ip, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid robot address {}:{}: {}", ip, port, e);
            return false;
        }
    };
    match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(socket) => {
            if let Err(e) = socket.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY on primary socket: {}", e);
            }
            // The 10 ms read timeout provides the idle-retry cadence of
            // the read loop.
            if let Err(e) = socket.set_read_timeout(Some(IDLE_RETRY)) {
                debug!("Failed to set read timeout on primary socket: {}", e);
            }
            *shared.socket.lock().unwrap() = Some(socket);
            true
        }
        Err(e) => {
            error!("Connect to robot primary port {} failed: {}", addr, e);
            false
        }
    }
}

fn read_loop(shared: Arc<Shared>, ip: String, port: u16) {
    while shared.alive.load(Ordering::SeqCst) {
        if !parse_message(&shared) {
            if !shared.alive.load(Ordering::SeqCst) {
                break;
            }
            debug!("Primary stream reset, reconnecting to {}:{}", ip, port);
            socket_connect(&shared, &ip, port);
        }
        thread::sleep(IDLE_RETRY);
    }
    debug!("Primary port reader exiting");
}

/// Read and dispatch one message. Returns false on any transport or
/// framing failure, which makes the loop reconnect.
fn parse_message(shared: &Shared) -> bool {
    let body;
    let msg_type;
    {
        let mut guard = shared.socket.lock().unwrap();
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => {
                warn!("Not connected to robot primary port");
                return false;
            }
        };

        let mut head = [0u8; HEAD_LENGTH];
        match read_exact_retrying(socket, &mut head, None, &shared.alive) {
            ReadOutcome::Complete => {}
            ReadOutcome::Idle | ReadOutcome::Interrupted => return true,
            ReadOutcome::Failed(e) => {
                error!("Primary port header read failed: {}", e);
                return false;
            }
        }
        let package_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        if package_len <= HEAD_LENGTH {
            error!("Primary port package length invalid: {}", package_len);
            return false;
        }
        msg_type = head[4];

        let mut buf = vec![0u8; package_len - HEAD_LENGTH];
        match read_exact_retrying(socket, &mut buf, Some(BODY_TIMEOUT), &shared.alive) {
            ReadOutcome::Complete => {}
            ReadOutcome::Idle | ReadOutcome::Interrupted => return true,
            ReadOutcome::Failed(e) => {
                error!("Primary port body read failed: {}", e);
                return false;
            }
        }
        body = buf;
    }

    match msg_type {
        ROBOT_STATE_MSG_TYPE => dispatch_robot_state(shared, &body),
        ROBOT_EXCEPTION_MSG_TYPE => dispatch_robot_exception(shared, &body),
        other => debug!("Ignoring primary message type {}", other),
    }
    true
}

/// Fill `buf` completely. Without a deadline, an idle socket (nothing
/// read yet) reports `Idle`; once the first byte arrived the read keeps
/// going so a message is never torn. With a deadline, expiry fails the
/// read.
fn read_exact_retrying(
    socket: &mut TcpStream,
    buf: &mut [u8],
    deadline: Option<Duration>,
    alive: &AtomicBool,
) -> ReadOutcome {
    let start = Instant::now();
    let mut filled = 0;
    while filled < buf.len() {
        if !alive.load(Ordering::SeqCst) {
            return ReadOutcome::Interrupted;
        }
        match socket.read(&mut buf[filled..]) {
            Ok(0) => {
                return ReadOutcome::Failed(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by robot",
                ))
            }
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if filled == 0 && deadline.is_none() {
                    return ReadOutcome::Idle;
                }
                if let Some(deadline) = deadline {
                    if start.elapsed() >= deadline {
                        return ReadOutcome::Failed(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "body read deadline exceeded",
                        ));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
    ReadOutcome::Complete
}

/// Split a robot state body into sub-packages and fill every matching
/// pending registration. Registrations are keyed by sub-type only and
/// removed after the first hit.
fn dispatch_robot_state(shared: &Shared, body: &[u8]) {
    let mut offset = 0;
    while offset + SUB_HEAD_LENGTH <= body.len() {
        let sub_len = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]) as usize;
        if sub_len < SUB_HEAD_LENGTH || offset + sub_len > body.len() {
            warn!("Robot state sub-package length invalid: {}", sub_len);
            return;
        }
        let sub_type = body[offset + 4];
        let entry = shared.pending.lock().unwrap().remove(&sub_type);
        if let Some(entry) = entry {
            let parsed = entry
                .package
                .lock()
                .unwrap()
                .parse(sub_len as u32, &body[offset..offset + sub_len]);
            if parsed {
                let _ = entry.ready.send(());
            }
        }
        offset += sub_len;
    }
}

/// Every well-framed exception body produces exactly one callback;
/// contents that fit no known record shape arrive as the fallback
/// variant.
fn dispatch_robot_exception(shared: &Shared, body: &[u8]) {
    let exception = robot_exception::decode(body);
    if let RobotException::Unknown(unknown) = &exception {
        warn!(
            "Robot exception with unrecognized kind {} ({} bytes)",
            unknown.kind,
            body.len()
        );
    }
    info!(
        "Robot exception from {:?} at {}",
        exception.source(),
        exception.timestamp_utc()
    );
    if let Some(cb) = shared.exception_cb.lock().unwrap().as_ref() {
        cb(exception);
    }
}
