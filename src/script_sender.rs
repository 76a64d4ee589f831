//! Script sender: serves the control script to the robot on request
//!
//! In non-headless mode the robot's external-control task fetches the
//! script itself: it connects, sends the request line and receives the
//! composed script body. The body is immutable once the sender starts;
//! every request, including those after a robot-side restart, is answered
//! with the same bytes.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::tcp_server::Reactor;
use crate::Result;

const PROGRAM_REQUEST: &str = "request_program";

/// Host endpoint answering `request_program` lines (default port 50002).
pub struct ScriptSender {
    reactor: Arc<Reactor>,
    port: u16,
    listener: Mutex<Option<std::net::TcpListener>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScriptSender {
    /// Bind the listener; serving begins once [`start`] supplies the
    /// script body.
    ///
    /// [`start`]: ScriptSender::start
    pub fn new(reactor: Arc<Reactor>, port: u16) -> Result<Self> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            reactor,
            port,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Begin serving `script` to every requester. A second call is a
    /// no-op; the body cannot be swapped once published.
    pub fn start(&self, script: String) {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return,
        };
        let script = Arc::new(script);
        let port = self.port;
        let task = self.reactor.handle().spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Port {}: failed to register listener: {}", port, e);
                    return;
                }
            };
            let mut prior: Option<oneshot::Sender<()>> = None;
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Port {}: script sender accept failed: {}", port, e);
                        continue;
                    }
                };
                debug!("Port {}: script requester {} connected", port, addr);
                // One requester at a time; a new accept replaces the old.
                if let Some(cancel) = prior.take() {
                    let _ = cancel.send(());
                }
                let (cancel_tx, cancel_rx) = oneshot::channel();
                prior = Some(cancel_tx);
                let script = Arc::clone(&script);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel_rx => {}
                        _ = serve_requests(stream, script) => {}
                    }
                });
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
    }
}

impl Drop for ScriptSender {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn serve_requests(stream: TcpStream, script: Arc<String>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match lines.read_line(&mut line).await {
            Ok(0) => {
                debug!("Script requester disconnected");
                return;
            }
            Ok(_) => {
                if line.trim_end() == PROGRAM_REQUEST {
                    info!("Robot requested the external control script");
                    if let Err(e) = write_half.write_all(script.as_bytes()).await {
                        warn!("Failed to send control script: {}", e);
                        return;
                    }
                }
                // Other lines are ignored; the robot only ever sends the
                // request keyword.
            }
            Err(e) => {
                debug!("Script sender read failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    const SCRIPT: &str = "def control():\n  noop()\nend\n";

    fn request_script(port: u16) -> String {
        let mut client = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.write_all(b"request_program\n").unwrap();
        let mut body = vec![0u8; SCRIPT.len()];
        client.read_exact(&mut body).unwrap();
        String::from_utf8(body).unwrap()
    }

    #[test]
    fn test_serves_script_on_request() {
        let reactor = Reactor::shared().unwrap();
        let sender = ScriptSender::new(reactor, 0).unwrap();
        sender.start(SCRIPT.to_string());

        assert_eq!(request_script(sender.local_port()), SCRIPT);
        // A later requester sees the same immutable body.
        assert_eq!(request_script(sender.local_port()), SCRIPT);
    }

    #[test]
    fn test_ignores_other_lines() {
        let reactor = Reactor::shared().unwrap();
        let sender = ScriptSender::new(reactor, 0).unwrap();
        sender.start(SCRIPT.to_string());

        let mut client = StdTcpStream::connect(("127.0.0.1", sender.local_port())).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        client.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 1];
        assert!(client.read(&mut buf).is_err());

        // The same connection can still issue the real request.
        client.write_all(b"request_program\n").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut body = vec![0u8; SCRIPT.len()];
        client.read_exact(&mut body).unwrap();
        assert_eq!(body, SCRIPT.as_bytes());
    }
}
