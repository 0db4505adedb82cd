use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::framing::{LineFramer, RawFrame, TransportProtocol, sender_key};

/// Consecutive failed restarts before a receiver gives up
pub const MAX_RESTART_ATTEMPTS: u32 = 10;

/// Upper bound on the delay between restart attempts
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Frames buffered per port before slow listeners start dropping
const FRAME_CHANNEL_CAPACITY: usize = 1024;

const TCP_READ_BUFFER: usize = 4096;
const UDP_READ_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Absorbing: the restart budget was exhausted
    Destroyed,
}

/// One TCP server plus a dual UDP pair (v4 + v6) for a port, shared by
/// every listener bound to that port.
pub struct PortReceiver {
    port: u16,
    bound_port: Mutex<u16>,
    state: Arc<Mutex<ReceiverState>>,
    frames: broadcast::Sender<Arc<RawFrame>>,
    shutdown: watch::Sender<bool>,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PortReceiver {
    pub fn new(port: u16) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            port,
            bound_port: Mutex::new(port),
            state: Arc::new(Mutex::new(ReceiverState::New)),
            frames,
            shutdown,
            started_at: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock().expect("receiver state lock poisoned")
    }

    fn set_state(&self, next: ReceiverState) {
        let mut state = self.state.lock().expect("receiver state lock poisoned");
        // DESTROYED is absorbing
        if *state != ReceiverState::Destroyed {
            *state = next;
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The port the sockets actually bound (differs from `port` only
    /// when constructed with port 0).
    pub fn bound_port(&self) -> u16 {
        *self.bound_port.lock().expect("bound port lock poisoned")
    }

    /// New frame subscription; each subscriber sees every frame.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RawFrame>> {
        self.frames.subscribe()
    }

    /// Bind the sockets and spawn the serve loops.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ReceiverState::New | ReceiverState::Stopped => {}
            other => {
                debug!(port = self.port, state = ?other, "receiver start ignored");
                return Ok(());
            }
        }
        self.set_state(ReceiverState::Starting);

        let (tcp, udp4, udp6, port) = match bind_sockets(self.port).await {
            Ok(bound) => bound,
            Err(error) => {
                self.set_state(ReceiverState::New);
                return Err(error);
            }
        };
        *self.bound_port.lock().expect("bound port lock poisoned") = port;

        let mut tasks = self.tasks.lock().expect("receiver tasks lock poisoned");
        tasks.push(tokio::spawn(supervise(
            format!("tcp:{}", port),
            self.state.clone(),
            self.shutdown.subscribe(),
            TcpServer {
                listener: Some(tcp),
                port,
                frames: self.frames.clone(),
                shutdown: self.shutdown.subscribe(),
                started_at: self.started_at,
            },
        )));
        tasks.push(tokio::spawn(supervise(
            format!("udp4:{}", port),
            self.state.clone(),
            self.shutdown.subscribe(),
            UdpServer {
                socket: Some(udp4),
                port,
                v6: false,
                frames: self.frames.clone(),
                shutdown: self.shutdown.subscribe(),
                started_at: self.started_at,
            },
        )));
        tasks.push(tokio::spawn(supervise(
            format!("udp6:{}", port),
            self.state.clone(),
            self.shutdown.subscribe(),
            UdpServer {
                socket: Some(udp6),
                port,
                v6: true,
                frames: self.frames.clone(),
                shutdown: self.shutdown.subscribe(),
                started_at: self.started_at,
            },
        )));
        drop(tasks);

        self.set_state(ReceiverState::Running);
        info!(port, "receiver started");
        Ok(())
    }

    /// Close the sockets. A receiver that never started still ends in
    /// STOPPED.
    pub async fn stop(&self) {
        match self.state() {
            ReceiverState::Stopped | ReceiverState::Destroyed => return,
            ReceiverState::New => {
                self.set_state(ReceiverState::Stopped);
                return;
            }
            _ => {}
        }
        self.set_state(ReceiverState::Stopping);
        let _ = self.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("receiver tasks lock poisoned"));
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                warn!(port = self.port, "receiver task did not stop in time");
                handle.abort();
            }
        }
        self.set_state(ReceiverState::Stopped);
        info!(port = self.port, "receiver stopped");
    }
}

async fn bind_sockets(port: u16) -> Result<(TcpListener, UdpSocket, UdpSocket, u16)> {
    let tcp = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("tcp bind failed on port {}", port))?;
    let bound = tcp.local_addr()?.port();
    let udp4 = UdpSocket::bind(("0.0.0.0", bound))
        .await
        .with_context(|| format!("udp4 bind failed on port {}", bound))?;
    let udp6 = bind_udp6(bound).with_context(|| format!("udp6 bind failed on port {}", bound))?;
    Ok((tcp, udp4, udp6, bound))
}

/// Bind an IPv6-only UDP socket so it can share the port with the v4
/// socket.
fn bind_udp6(port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    let address: SocketAddr = format!("[::]:{}", port).parse()?;
    socket.bind(&address.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// A serve loop that can be (re)bound after a failure
trait Server: Send + 'static {
    fn rebind(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
    fn serve(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Run a serve loop, restarting on error with a bounded budget. The
/// budget resets once a restart manages to bind again; exhausting it
/// marks the whole receiver DESTROYED.
async fn supervise<S: Server>(
    name: String,
    state: Arc<Mutex<ReceiverState>>,
    mut shutdown: watch::Receiver<bool>,
    mut server: S,
) {
    let mut attempts: u32 = 0;
    loop {
        match server.serve().await {
            Ok(()) => return, // clean shutdown
            Err(error) => {
                if *shutdown.borrow() {
                    return;
                }
                attempts += 1;
                warn!(%name, %error, attempts, "receiver socket error, restarting");
            }
        }

        loop {
            if attempts >= MAX_RESTART_ATTEMPTS {
                *state.lock().expect("receiver state lock poisoned") = ReceiverState::Destroyed;
                error!(%name, "receiver exhausted its restart budget");
                return;
            }

            let delay = RESTART_DELAY.min(Duration::from_millis(500 * u64::from(attempts)));
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match server.rebind().await {
                Ok(()) => {
                    attempts = 0;
                    break;
                }
                Err(error) => {
                    attempts += 1;
                    warn!(%name, %error, attempts, "receiver rebind failed");
                }
            }
        }
    }
}

struct TcpServer {
    listener: Option<TcpListener>,
    port: u16,
    frames: broadcast::Sender<Arc<RawFrame>>,
    shutdown: watch::Receiver<bool>,
    started_at: Instant,
}

impl Server for TcpServer {
    async fn rebind(&mut self) -> Result<()> {
        self.listener = Some(TcpListener::bind(("0.0.0.0", self.port)).await?);
        Ok(())
    }

    async fn serve(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("tcp server has no bound listener")?;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let frames = self.frames.clone();
                    let shutdown = self.shutdown.clone();
                    let started_at = self.started_at;
                    tokio::spawn(serve_tcp_connection(stream, peer, frames, shutdown, started_at));
                }
            }
        }
    }
}

async fn serve_tcp_connection(
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    frames: broadcast::Sender<Arc<RawFrame>>,
    mut shutdown: watch::Receiver<bool>,
    started_at: Instant,
) {
    let key = sender_key(TransportProtocol::Tcp, &peer);
    let mut framer = LineFramer::new();
    let mut buffer = vec![0u8; TCP_READ_BUFFER];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            read = stream.read(&mut buffer) => {
                match read {
                    // Connection closed: the buffered remainder is discarded
                    Ok(0) => break,
                    Ok(n) => {
                        for line in framer.push(&key, &buffer[..n]) {
                            emit_frame(&frames, &key, TransportProtocol::Tcp, line, started_at);
                        }
                    }
                    Err(error) => {
                        debug!(sender_key = %key, %error, "tcp read error");
                        break;
                    }
                }
            }
        }
    }
    framer.discard();
}

struct UdpServer {
    socket: Option<UdpSocket>,
    port: u16,
    v6: bool,
    frames: broadcast::Sender<Arc<RawFrame>>,
    shutdown: watch::Receiver<bool>,
    started_at: Instant,
}

impl Server for UdpServer {
    async fn rebind(&mut self) -> Result<()> {
        self.socket = Some(if self.v6 {
            bind_udp6(self.port)?
        } else {
            UdpSocket::bind(("0.0.0.0", self.port)).await?
        });
        Ok(())
    }

    async fn serve(&mut self) -> Result<()> {
        let socket = self.socket.take().context("udp server has no bound socket")?;
        let mut framers: HashMap<String, LineFramer> = HashMap::new();
        let mut buffer = vec![0u8; UDP_READ_BUFFER];

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                received = socket.recv_from(&mut buffer) => {
                    let (n, peer) = received?;
                    let key = sender_key(TransportProtocol::Udp, &peer);
                    let framer = framers.entry(key.clone()).or_default();
                    let mut lines = framer.push(&key, &buffer[..n]);
                    // Datagrams are normally whole messages; a missing
                    // trailing newline still terminates the frame.
                    if framer.buffered() > 0 {
                        lines.extend(framer.push(&key, b"\n"));
                    }
                    for line in lines {
                        emit_frame(&self.frames, &key, TransportProtocol::Udp, line, self.started_at);
                    }
                }
            }
        }
    }
}

fn emit_frame(
    frames: &broadcast::Sender<Arc<RawFrame>>,
    key: &str,
    protocol: TransportProtocol,
    line: String,
    started_at: Instant,
) {
    let frame = Arc::new(RawFrame {
        data: line,
        sender_key: key.to_string(),
        protocol,
        timestamp: Utc::now(),
        hrtime: started_at.elapsed().as_nanos(),
    });
    // No subscribers is fine; frames are simply dropped
    let _ = frames.send(frame);
}

struct PortEntry {
    receiver: Arc<PortReceiver>,
    refs: usize,
}

/// Owns all port receivers. Listeners acquire and release ports; the
/// sockets for a port close only when its last listener releases it.
#[derive(Default)]
pub struct ReceiverManager {
    ports: Mutex<HashMap<u16, PortEntry>>,
}

impl ReceiverManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the receiver for a port, creating and starting it when
    /// this is the first listener. Reusing a live port never touches
    /// its sockets.
    pub async fn acquire(&self, port: u16) -> Result<Arc<PortReceiver>> {
        let receiver = {
            let mut ports = self.ports.lock().expect("receiver manager lock poisoned");
            if let Some(entry) = ports.get_mut(&port) {
                entry.refs += 1;
                return Ok(entry.receiver.clone());
            }
            let receiver = Arc::new(PortReceiver::new(port));
            ports.insert(
                port,
                PortEntry {
                    receiver: receiver.clone(),
                    refs: 1,
                },
            );
            receiver
        };

        if let Err(error) = receiver.start().await {
            self.ports
                .lock()
                .expect("receiver manager lock poisoned")
                .remove(&port);
            return Err(error);
        }
        Ok(receiver)
    }

    /// Release one listener's hold on a port; the last release closes
    /// the sockets.
    pub async fn release(&self, port: u16) {
        let closing = {
            let mut ports = self.ports.lock().expect("receiver manager lock poisoned");
            match ports.get_mut(&port) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        ports.remove(&port).map(|entry| entry.receiver)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(receiver) = closing {
            receiver.stop().await;
        }
    }

    pub fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .lock()
            .expect("receiver manager lock poisoned")
            .keys()
            .copied()
            .collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_never_started_receiver_stops_to_stopped() {
        let receiver = PortReceiver::new(0);
        assert_eq!(receiver.state(), ReceiverState::New);
        receiver.stop().await;
        assert_eq!(receiver.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_tcp_frames_reach_subscribers() {
        let receiver = PortReceiver::new(0);
        receiver.start().await.unwrap();
        let port = receiver.bound_port();
        let mut rx = receiver.subscribe();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream.write_all(b"first\nsecond\n").await.unwrap();
        stream.flush().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.data, "first");
        assert!(frame.sender_key.starts_with("tcp-127.0.0.1-"));
        assert_eq!(frame.protocol, TransportProtocol::Tcp);

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.data, "second");

        receiver.stop().await;
        assert_eq!(receiver.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_udp_datagram_framed() {
        let receiver = PortReceiver::new(0);
        receiver.start().await.unwrap();
        let port = receiver.bound_port();
        let mut rx = receiver.subscribe();

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        socket
            .send_to(b"virtual_name=\"vs1\"", ("127.0.0.1", port))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.data, "virtual_name=\"vs1\"");
        assert_eq!(frame.protocol, TransportProtocol::Udp);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_manager_shares_and_closes_ports() {
        let manager = ReceiverManager::new();
        let first = manager.acquire(0).await.unwrap();
        let port = first.bound_port();

        // Second listener on the same (requested) port shares sockets
        let second = manager.acquire(0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_ports(), vec![0]);

        manager.release(0).await;
        assert_eq!(first.state(), ReceiverState::Running);

        manager.release(0).await;
        assert_eq!(first.state(), ReceiverState::Stopped);
        assert!(manager.active_ports().is_empty());
        let _ = port;
    }
}
