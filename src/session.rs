//! Proxy session: socket ownership, hostname resolution, and the reactor
//! worker that drives both delivery channels.
//!
//! One session runs one dedicated worker thread with a current-thread tokio
//! runtime. All packet I/O and all channel-state mutation happen on that
//! worker; API callers reach it only through thread-safe slots (config,
//! sticky result, shutdown flag) and the inject mailbox.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::BufferPool;
use crate::channel::{ChannelStats, DeliveryChannel};
use crate::config::{ChannelConfig, ProxyConfig};
use crate::error::{Error, Result, TransportError};
use crate::types::{Direction, ResultCode, StickyResult};

/// Heartbeat interval; bounds how long the worker sleeps with nothing due.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// First hostname-resolution retry delay; doubles per attempt.
const RESOLVE_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Resolution attempts before `resolve_failed` becomes sticky.
const RESOLVE_MAX_ATTEMPTS: u32 = 8;

/// Capacity of the API-to-worker inject mailbox.
const INJECT_MAILBOX: usize = 256;

/// A synthetic ingress datagram posted from the API.
#[derive(Debug)]
pub struct InjectCommand {
    pub source_port: u16,
    pub payload: Vec<u8>,
}

/// State shared between the worker and API callers.
#[derive(Debug)]
pub struct SessionShared {
    pub channel_config: Arc<Mutex<ChannelConfig>>,
    pub last_result: StickyResult,
    pub terminated: AtomicBool,
    pub shutdown: Notify,
    pub local_addr: SocketAddr,
    pub c2s_stats: Arc<ChannelStats>,
    pub s2c_stats: Arc<ChannelStats>,
    pub max_datagram_bytes: usize,
}

/// Handle to a running session worker.
pub struct SessionHandle {
    pub shared: Arc<SessionShared>,
    pub inject_tx: mpsc::Sender<InjectCommand>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Bind the listen socket and start the worker thread.
    ///
    /// Bind failures are synchronous; hostname resolution starts asynchronously
    /// on the worker.
    pub fn spawn(
        proxy_config: &ProxyConfig,
        channel_config: ChannelConfig,
        server_host: String,
        server_port: u16,
    ) -> Result<Self> {
        let socket = bind_udp_socket(proxy_config)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        let shared = Arc::new(SessionShared {
            channel_config: Arc::new(Mutex::new(channel_config)),
            last_result: StickyResult::new(),
            terminated: AtomicBool::new(false),
            shutdown: Notify::new(),
            local_addr,
            c2s_stats: Arc::new(ChannelStats::default()),
            s2c_stats: Arc::new(ChannelStats::default()),
            max_datagram_bytes: proxy_config.max_datagram_bytes,
        });

        let (inject_tx, inject_rx) = mpsc::channel(INJECT_MAILBOX);

        let worker_shared = Arc::clone(&shared);
        let pool_buffers = proxy_config.pool_buffers;
        let worker = std::thread::Builder::new()
            .name(format!("mau-proxy-{}", local_addr.port()))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("failed to build worker runtime: {e}");
                        worker_shared.last_result.set(ResultCode::SendFailed);
                        return;
                    }
                };

                runtime.block_on(async move {
                    match Worker::new(
                        socket,
                        worker_shared.clone(),
                        inject_rx,
                        server_host,
                        server_port,
                        pool_buffers,
                    ) {
                        Ok(mut worker) => worker.run().await,
                        Err(e) => {
                            error!("failed to start session worker: {e}");
                            worker_shared.last_result.set(e.result_code());
                        }
                    }
                });
            })
            .map_err(|e| Error::Internal(format!("failed to spawn worker thread: {e}")))?;

        Ok(Self {
            shared,
            inject_tx,
            worker: Some(worker),
        })
    }

    /// Request shutdown and join the worker. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.shutdown.notify_one();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("session worker panicked during shutdown");
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create the listen socket with the configured kernel buffer sizes.
fn bind_udp_socket(config: &ProxyConfig) -> Result<std::net::UdpSocket> {
    let ip = config
        .bind_address
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, config.udp_listen_port);

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set send buffer: {e}")))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;

    socket.bind(&addr.into()).map_err(|e| TransportError::BindFailed {
        addr,
        reason: e.to_string(),
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    Ok(socket.into())
}

/// Hostname resolution progress.
enum ResolveState {
    Pending { attempts: u32, retry_at: Instant },
    Done,
    Failed,
}

/// Worker-side session state. Lives entirely on the worker thread.
struct Worker {
    socket: UdpSocket,
    shared: Arc<SessionShared>,
    inject_rx: mpsc::Receiver<InjectCommand>,
    pool: Arc<BufferPool>,
    scratch: Vec<u8>,

    server_hostname: String,
    server_port: u16,
    server_addr: Option<SocketAddr>,
    client_addr: Option<SocketAddr>,
    resolve: ResolveState,
    inject_closed: bool,
    recv_broken: bool,

    c2s: DeliveryChannel,
    s2c: DeliveryChannel,

    start: Instant,
    next_tick: Instant,
}

enum Event {
    Shutdown,
    Inject(Option<InjectCommand>),
    Recv(io::Result<(usize, SocketAddr)>),
    Timer,
}

impl Worker {
    fn new(
        socket: std::net::UdpSocket,
        shared: Arc<SessionShared>,
        inject_rx: mpsc::Receiver<InjectCommand>,
        server_hostname: String,
        server_port: u16,
        pool_buffers: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::from_std(socket)
            .map_err(|e| TransportError::SocketError(e.to_string()))?;

        let pool = BufferPool::new(pool_buffers, shared.max_datagram_bytes);
        let seed = shared.channel_config.lock().rng_seed;

        let c2s = DeliveryChannel::new(
            Direction::C2s,
            Arc::clone(&pool),
            Arc::clone(&shared.channel_config),
            Arc::clone(&shared.c2s_stats),
            seed,
        );
        let s2c = DeliveryChannel::new(
            Direction::S2c,
            Arc::clone(&pool),
            Arc::clone(&shared.channel_config),
            Arc::clone(&shared.s2c_stats),
            seed,
        );

        let start = Instant::now();
        let scratch = vec![0u8; shared.max_datagram_bytes];

        Ok(Self {
            socket,
            shared,
            inject_rx,
            pool,
            scratch,
            server_hostname,
            server_port,
            server_addr: None,
            client_addr: None,
            resolve: ResolveState::Pending {
                attempts: 0,
                retry_at: start,
            },
            inject_closed: false,
            recv_broken: false,
            c2s,
            s2c,
            start,
            next_tick: start + TICK_INTERVAL,
        })
    }

    fn now_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn usec_to_instant(&self, usec: u64) -> Instant {
        self.start + Duration::from_micros(usec)
    }

    /// Earliest instant the worker must wake: channel timers (only for
    /// channels that can actually send), the resolution retry, the ticker.
    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_tick;

        for channel in [&self.c2s, &self.s2c] {
            if channel.delivery_address().is_none() {
                continue;
            }
            if let Some(wake) = channel.next_wake_usec() {
                deadline = deadline.min(self.usec_to_instant(wake));
            }
        }

        if let ResolveState::Pending { retry_at, .. } = &self.resolve {
            deadline = deadline.min(*retry_at);
        }

        deadline
    }

    async fn run(&mut self) {
        info!(
            listen = %self.shared.local_addr,
            server = %format!("{}:{}", self.server_hostname, self.server_port),
            "proxy session started"
        );

        loop {
            if self.shared.terminated.load(Ordering::Acquire) {
                break;
            }

            let deadline = self.next_deadline();
            let event = tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => Event::Shutdown,
                cmd = self.inject_rx.recv(), if !self.inject_closed => Event::Inject(cmd),
                res = self.socket.recv_from(&mut self.scratch), if !self.recv_broken => Event::Recv(res),
                _ = tokio::time::sleep_until(deadline) => Event::Timer,
            };

            match event {
                Event::Shutdown => break,
                Event::Inject(Some(cmd)) => self.on_inject(cmd),
                Event::Inject(None) => {
                    // API handle gone; shutdown follows shortly.
                    self.inject_closed = true;
                }
                Event::Recv(Ok((len, src))) => self.on_ingress(len, src),
                Event::Recv(Err(e)) => self.on_recv_error(&e),
                Event::Timer => {}
            }

            self.service_resolution().await;
            self.service_timers().await;
        }

        self.c2s.shutdown();
        self.s2c.shutdown();

        info!(
            c2s = %self.shared.c2s_stats.snapshot(),
            s2c = %self.shared.s2c_stats.snapshot(),
            pool = %self.pool.stats(),
            "proxy session stopped"
        );
    }

    /// Classify an ingress datagram by source endpoint and hand it to the
    /// matching channel.
    fn on_ingress(&mut self, len: usize, src: SocketAddr) {
        let now = self.now_usec();

        if self.server_addr == Some(src) {
            Self::enqueue(&self.pool, &mut self.s2c, &self.scratch[..len], now);
            return;
        }

        match self.client_addr {
            None => {
                // First non-server endpoint becomes the client for this
                // session.
                self.client_addr = Some(src);
                self.s2c.set_delivery_address(src);
                info!(client = %src, "learned client address");
                Self::enqueue(&self.pool, &mut self.c2s, &self.scratch[..len], now);
            }
            Some(client) if client == src => {
                Self::enqueue(&self.pool, &mut self.c2s, &self.scratch[..len], now);
            }
            Some(_) => {
                warn!(source = %src, "ignored datagram from unrecognized source");
            }
        }
    }

    /// Feed a synthetic datagram through the same dispatch rule, as if it had
    /// arrived from `127.0.0.1:source_port`.
    fn on_inject(&mut self, cmd: InjectCommand) {
        let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), cmd.source_port);
        let now = self.now_usec();

        if self.server_addr.map(|s| s.port()) == Some(cmd.source_port) {
            Self::enqueue(&self.pool, &mut self.s2c, &cmd.payload, now);
            return;
        }

        match self.client_addr {
            None => {
                self.client_addr = Some(src);
                self.s2c.set_delivery_address(src);
                debug!(client = %src, "inject: learned client address");
                Self::enqueue(&self.pool, &mut self.c2s, &cmd.payload, now);
            }
            Some(client) if client == src => {
                Self::enqueue(&self.pool, &mut self.c2s, &cmd.payload, now);
            }
            Some(_) => {
                warn!(source = %src, "inject: ignored unrecognized source port");
            }
        }
    }

    /// Copy a payload into a pooled buffer and run it through the channel.
    /// Pool exhaustion is a silent drop per the resource policy.
    fn enqueue(pool: &Arc<BufferPool>, channel: &mut DeliveryChannel, data: &[u8], now: u64) {
        match pool.try_get_filled(data) {
            Some(payload) => channel.insert(payload, now),
            None => trace!(direction = %channel.direction(), "buffer pool exhausted, ingress dropped"),
        }
    }

    fn on_recv_error(&mut self, e: &io::Error) {
        // Peer ICMP noise (port unreachable) surfaces as recv errors on some
        // platforms; it must not take the session down.
        match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                debug!("recv error (peer unreachable): {e}");
            }
            _ => {
                // Stop posting reads; delivery timers keep draining what is
                // already queued.
                error!("socket receive failed: {e}");
                self.shared.last_result.set(ResultCode::SendFailed);
                self.recv_broken = true;
            }
        }
    }

    /// Drive hostname resolution with bounded exponential backoff.
    async fn service_resolution(&mut self) {
        let ResolveState::Pending { attempts, retry_at } = &self.resolve else {
            return;
        };
        let attempts = *attempts;
        if Instant::now() < *retry_at {
            return;
        }

        let hostname = self.server_hostname.clone();
        let query = (hostname.as_str(), self.server_port);
        let lookup_result = tokio::net::lookup_host(query).await;
        match lookup_result {
            Ok(results) => {
                let mut first = None;
                let mut v4 = None;
                for addr in results {
                    first.get_or_insert(addr);
                    if addr.is_ipv4() {
                        v4.get_or_insert(addr);
                    }
                }
                if let Some(addr) = v4.or(first) {
                    info!(server = %addr, "resolved server address");
                    self.server_addr = Some(addr);
                    self.c2s.set_delivery_address(addr);
                    self.resolve = ResolveState::Done;
                    return;
                }
                self.on_resolve_failure(attempts, "no addresses returned");
            }
            Err(e) => self.on_resolve_failure(attempts, &e.to_string()),
        }
    }

    fn on_resolve_failure(&mut self, attempts: u32, reason: &str) {
        let attempts = attempts + 1;
        if attempts >= RESOLVE_MAX_ATTEMPTS {
            error!(
                host = %self.server_hostname,
                attempts,
                "hostname resolution failed permanently: {reason}"
            );
            self.shared.last_result.set(ResultCode::ResolveFailed);
            self.resolve = ResolveState::Failed;
            return;
        }

        let backoff = RESOLVE_BACKOFF_BASE * 2u32.saturating_pow(attempts - 1);
        warn!(
            host = %self.server_hostname,
            attempts,
            retry_in = ?backoff,
            "hostname resolution failed: {reason}"
        );
        self.resolve = ResolveState::Pending {
            attempts,
            retry_at: Instant::now() + backoff,
        };
    }

    /// Drain every datagram whose target time has arrived, then advance the
    /// heartbeat.
    async fn service_timers(&mut self) {
        let now = self.now_usec();

        Self::drain_channel(&self.socket, &self.shared, &mut self.c2s, now).await;
        Self::drain_channel(&self.socket, &self.shared, &mut self.s2c, now).await;

        let tick_now = Instant::now();
        if tick_now >= self.next_tick {
            self.next_tick = tick_now + TICK_INTERVAL;
        }
    }

    async fn drain_channel(
        socket: &UdpSocket,
        shared: &SessionShared,
        channel: &mut DeliveryChannel,
        now_usec: u64,
    ) {
        // Without a destination the queue keeps buffering (e.g. C2S traffic
        // before resolution completes).
        let Some(addr) = channel.delivery_address() else {
            return;
        };

        let stats = channel.stats();
        for node in channel.pop_due(now_usec) {
            match socket.send_to(node.payload.as_slice(), addr).await {
                Ok(_) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    let transient = matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                    );
                    if transient {
                        warn!(dest = %addr, "transient send failure: {e}");
                    } else {
                        error!(dest = %addr, "send failed: {e}");
                        shared.last_result.set(ResultCode::SendFailed);
                    }
                }
            }
            // Node drops here, returning its buffer to the pool.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let config = ProxyConfig::default();
        let socket = bind_udp_socket(&config).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn bind_conflict_reports_bind_failed() {
        let config = ProxyConfig {
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..ProxyConfig::default()
        };
        let first = bind_udp_socket(&config).unwrap();
        let taken = first.local_addr().unwrap().port();

        let conflicting = ProxyConfig {
            udp_listen_port: taken,
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..ProxyConfig::default()
        };
        let err = bind_udp_socket(&conflicting).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::BindFailed);
    }

    #[tokio::test]
    async fn spawn_and_shutdown_is_idempotent() {
        let mut handle = SessionHandle::spawn(
            &ProxyConfig::default(),
            ChannelConfig::transparent(),
            "127.0.0.1".into(),
            9999,
        )
        .unwrap();

        assert!(!handle.is_terminated());
        handle.shutdown();
        assert!(handle.is_terminated());
        // Second shutdown is a no-op.
        handle.shutdown();
        assert!(handle.is_terminated());
    }
}
