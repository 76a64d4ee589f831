//! Shared TCP server substrate
//!
//! A single background thread runs the event loop that hosts every
//! host-side listener (reverse, script command, trajectory). Each server
//! accepts at most one peer, the robot; a fresh accept replaces the
//! previous connection, which is how the robot re-binds after its control
//! script restarts.

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Invoked on the reactor thread with exactly `recv_buf_size` bytes per
/// inbound frame. Must not block and must not call back into the server.
pub type ReceiveCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

static SHARED_REACTOR: Mutex<Weak<Reactor>> = Mutex::new(Weak::new());

/// Handle to the process-wide reactor thread.
///
/// Servers hold an `Arc<Reactor>` for their whole lifetime; when the last
/// handle drops, the runtime is shut down and the thread joined.
pub struct Reactor {
    handle: runtime::Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reactor {
    /// Get the shared reactor, spawning its thread on first use.
    pub fn shared() -> io::Result<Arc<Reactor>> {
        let mut slot = SHARED_REACTOR
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(reactor) = slot.upgrade() {
            return Ok(reactor);
        }
        let reactor = Arc::new(Reactor::spawn()?);
        *slot = Arc::downgrade(&reactor);
        Ok(reactor)
    }

    fn spawn() -> io::Result<Reactor> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("ecd-reactor".into())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(rt.handle().clone())).is_err() {
                    return;
                }
                // Parking here keeps the event loop alive between servers;
                // dropping the runtime afterwards cancels all their tasks.
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Reactor thread exiting");
            })?;
        let handle = handle_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "reactor thread died during startup"))??;
        Ok(Reactor {
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn handle(&self) -> &runtime::Handle {
        &self.handle
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

/// The robot-side end of one server port.
///
/// The socket is read via the readiness API so the reactor task and the
/// host's writing thread can share it; `closed` carries the single
/// shutdown permit for the read task.
struct Peer {
    stream: TcpStream,
    closed: Notify,
}

impl Peer {
    fn close(&self) {
        // notify_one stores a permit, so the read task sees the close even
        // if it was not parked in notified() at this instant.
        self.closed.notify_one();
    }
}

struct ServerInner {
    port: u16,
    recv_buf_size: usize,
    peer: Mutex<Option<Arc<Peer>>>,
    receive_cb: Mutex<Option<ReceiveCallback>>,
}

/// One-client TCP server scheduled on the shared reactor.
pub struct TcpServer {
    reactor: Arc<Reactor>,
    inner: Arc<ServerInner>,
    listener: Mutex<Option<std::net::TcpListener>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    write_lock: Mutex<()>,
}

impl TcpServer {
    /// Bind a listener on `port` (0 picks an ephemeral port). The server
    /// does not accept connections until [`start_listen`] is called.
    ///
    /// [`start_listen`]: TcpServer::start_listen
    pub fn new(reactor: Arc<Reactor>, port: u16, recv_buf_size: usize) -> io::Result<TcpServer> {
        // Bound synchronously so construction works from any thread; the
        // accept task adopts the listener once it runs on the reactor.
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();
        Ok(TcpServer {
            reactor,
            inner: Arc::new(ServerInner {
                port: local_port,
                recv_buf_size: recv_buf_size.max(1),
                peer: Mutex::new(None),
                receive_cb: Mutex::new(None),
            }),
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// The actually bound port.
    pub fn local_port(&self) -> u16 {
        self.inner.port
    }

    /// Begin accepting connections. Calling it again is a no-op.
    pub fn start_listen(&self) {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return,
        };
        let inner = Arc::clone(&self.inner);
        let task = self.reactor.handle().spawn(async move {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Port {}: failed to register listener: {}", inner.port, e);
                    return;
                }
            };
            inner.accept_loop(listener).await
        });
        *self.accept_task.lock().unwrap() = Some(task);
    }

    /// Install the frame callback. Replaces any previous callback.
    pub fn set_receive_callback<F>(&self, cb: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.inner.receive_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn unset_receive_callback(&self) {
        *self.inner.receive_cb.lock().unwrap() = None;
    }

    /// Write `data` to the current peer in full.
    ///
    /// Writes from concurrent callers are serialized; a frame is either
    /// delivered completely or the call fails.
    pub fn write_client(&self, data: &[u8]) -> io::Result<usize> {
        let _serialized = self.write_lock.lock().unwrap();
        let peer = match self.inner.peer.lock().unwrap().as_ref() {
            Some(peer) => Arc::clone(peer),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no client connected",
                ))
            }
        };
        let mut written = 0;
        while written < data.len() {
            match peer.stream.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let replaced = self
                        .inner
                        .peer
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map_or(true, |cur| !Arc::ptr_eq(cur, &peer));
                    if replaced {
                        return Err(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "client replaced during write",
                        ));
                    }
                    // The robot drains its side at the control rate, so a
                    // full send buffer clears within a cycle or two.
                    thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    pub fn is_client_connected(&self) -> bool {
        self.inner.peer.lock().unwrap().is_some()
    }

    /// Close the current peer, if any.
    pub fn release_client(&self) {
        if let Some(peer) = self.inner.peer.lock().unwrap().take() {
            peer.close();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.release_client();
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Port {}: client {} connected", self.port, addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Port {}: failed to set TCP_NODELAY: {}", self.port, e);
                    }
                    let peer = Arc::new(Peer {
                        stream,
                        closed: Notify::new(),
                    });
                    {
                        // The prior peer is shut down before the new one
                        // becomes current.
                        let mut slot = self.peer.lock().unwrap();
                        if let Some(prior) = slot.take() {
                            prior.close();
                        }
                        *slot = Some(Arc::clone(&peer));
                    }
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.read_loop(peer).await });
                }
                Err(e) => {
                    warn!("Port {}: accept failed: {}", self.port, e);
                    if let Some(prior) = self.peer.lock().unwrap().take() {
                        prior.close();
                    }
                }
            }
        }
    }

    /// Fill `recv_buf_size` bytes per callback invocation; partial frames
    /// are never delivered. Exits when the peer is closed or replaced.
    async fn read_loop(self: Arc<Self>, peer: Arc<Peer>) {
        let mut buf = vec![0u8; self.recv_buf_size];
        'frames: loop {
            let mut filled = 0;
            while filled < buf.len() {
                tokio::select! {
                    _ = peer.closed.notified() => break 'frames,
                    ready = peer.stream.readable() => {
                        if let Err(e) = ready {
                            self.drop_peer(&peer, &e.to_string());
                            return;
                        }
                        match peer.stream.try_read(&mut buf[filled..]) {
                            Ok(0) => {
                                self.drop_peer(&peer, "connection closed by peer");
                                return;
                            }
                            Ok(n) => filled += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                            Err(e) => {
                                self.drop_peer(&peer, &e.to_string());
                                return;
                            }
                        }
                    }
                }
            }
            if let Some(cb) = self.receive_cb.lock().unwrap().as_ref() {
                cb(&buf);
            }
        }
    }

    fn drop_peer(&self, peer: &Arc<Peer>, reason: &str) {
        let mut slot = self.peer.lock().unwrap();
        if slot.as_ref().map_or(false, |cur| Arc::ptr_eq(cur, peer)) {
            *slot = None;
            debug!("Port {}: peer dropped: {}", self.port, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    fn connect(port: u16) -> StdTcpStream {
        let client = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_nodelay(true).unwrap();
        client
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 1s");
    }

    #[test]
    fn test_single_client_receive() {
        let reactor = Reactor::shared().unwrap();
        let server = TcpServer::new(reactor, 0, 4).unwrap();
        let (tx, rx) = mpsc::channel();
        server.set_receive_callback(move |bytes| {
            let _ = tx.send(bytes.to_vec());
        });
        server.start_listen();

        let mut client = connect(server.local_port());
        wait_for(|| server.is_client_connected());

        client.write_all(&0x12345678i32.to_be_bytes()).unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame, 0x12345678i32.to_be_bytes());
    }

    #[test]
    fn test_second_accept_replaces_first_peer() {
        let reactor = Reactor::shared().unwrap();
        let server = TcpServer::new(reactor, 0, 4).unwrap();
        server.start_listen();

        let mut first = connect(server.local_port());
        wait_for(|| server.is_client_connected());

        let mut second = connect(server.local_port());
        // The first client is shut down once the replacement lands.
        first.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut eof = [0u8; 1];
        assert_eq!(first.read(&mut eof).unwrap(), 0);
        assert!(server.is_client_connected());

        // Writes now reach only the second client.
        let frame = [0u8; 112];
        assert_eq!(server.write_client(&frame).unwrap(), frame.len());
        let mut received = [1u8; 112];
        second.read_exact(&mut received).unwrap();
        assert_eq!(received, frame);
    }

    #[test]
    fn test_write_without_client_fails() {
        let reactor = Reactor::shared().unwrap();
        let server = TcpServer::new(reactor, 0, 4).unwrap();
        server.start_listen();
        let err = server.write_client(&[0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_release_client_closes_peer() {
        let reactor = Reactor::shared().unwrap();
        let server = TcpServer::new(reactor, 0, 4).unwrap();
        server.start_listen();

        let mut client = connect(server.local_port());
        wait_for(|| server.is_client_connected());

        server.release_client();
        assert!(!server.is_client_connected());
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut eof = [0u8; 1];
        assert_eq!(client.read(&mut eof).unwrap(), 0);
    }

    #[test]
    fn test_reactor_lifecycle_leaves_no_thread() {
        let reactor = Arc::new(Reactor::spawn().unwrap());
        let probe = Arc::downgrade(&reactor);
        let server = TcpServer::new(Arc::clone(&reactor), 0, 4).unwrap();
        server.start_listen();
        let port = server.local_port();

        drop(server);
        drop(reactor);
        assert!(probe.upgrade().is_none());

        // The listener is gone with the runtime.
        assert!(StdTcpStream::connect_timeout(
            &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_millis(200),
        )
        .is_err());
    }
}
