//! Multicast discovery server
//!
//! The server binds a UDP socket, joins a multicast group and gossips its
//! own Pod. Readiness is confirmed by a self-echo handshake: the server
//! multicasts its pod and waits until that exact pod comes back off the
//! network. The source address of the echo is the address peers see for
//! this instance. Closing mirrors the handshake with an unavailable pod.
//!
//! Neither handshake has a timeout; callers that need one wrap `listen` or
//! `close` in `tokio::time::timeout`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, Result};
use crate::event::DiscoveryEvent;
use crate::peer::{PeerRecord, PeerTable};
use crate::pod::{Attributes, Pod};

/// Largest datagram the receive loop accepts
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Receive retry delays while the socket keeps failing
const RECEIVE_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Buffered events per subscriber before a slow subscriber starts lagging
const EVENT_CAPACITY: usize = 256;

/// State shared with the receive loop
struct Shared {
    identifier: String,
    local: Mutex<Pod>,
    peers: RwLock<PeerTable>,
    events: broadcast::Sender<DiscoveryEvent>,
    pending_echo: Mutex<Option<PendingEcho>>,
}

/// An outstanding self-echo handshake
struct PendingEcho {
    available: bool,
    resolve: oneshot::Sender<IpAddr>,
}

/// Socket-level state of one listen/close cycle
#[derive(Default)]
struct Session {
    socket: Option<Arc<UdpSocket>>,
    membership: Option<Ipv4Addr>,
    local_port: Option<u16>,
    local_address: Option<IpAddr>,
    listening: bool,
    // a listen call is between bind and self-echo
    handshaking: bool,
    receiver: Option<JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
}

impl Session {
    fn destination(&self) -> Option<SocketAddr> {
        match (self.membership, self.local_port) {
            (Some(group), Some(port)) => Some(SocketAddr::from((group, port))),
            _ => None,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.announcer.take() {
            task.abort();
        }
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        *self = Session::default();
    }
}

/// Undoes a listen that did not reach its self-echo
///
/// Covers early returns and the caller dropping the `listen` future. The
/// socket is only stored in the session once the handshake completes, so
/// aborting the receive task releases it.
struct Handshake<'a> {
    server: &'a DiscoveryServer,
    receiver: Option<JoinHandle<()>>,
    completed: bool,
}

impl<'a> Handshake<'a> {
    fn new(server: &'a DiscoveryServer) -> Self {
        Self {
            server,
            receiver: None,
            completed: false,
        }
    }

    fn finish(&mut self) -> Option<JoinHandle<()>> {
        self.completed = true;
        self.receiver.take()
    }
}

impl Drop for Handshake<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        self.server.shared.pending_echo().take();
        self.server.session().handshaking = false;
        debug!(identifier = %self.server.shared.identifier, "Listen abandoned before self-echo");
    }
}

/// Builder for a DiscoveryServer
pub struct DiscoveryServerBuilder {
    identifier: String,
    attributes: Attributes,
    interface: Ipv4Addr,
    announce_interval: Option<Duration>,
    multicast_ttl: u32,
}

impl DiscoveryServerBuilder {
    /// Attributes advertised in every announcement
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Local interface used to join the multicast group
    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Re-announce availability at this interval once listening
    pub fn announce_interval(mut self, interval: Option<Duration>) -> Self {
        self.announce_interval = interval;
        self
    }

    pub fn multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn build(self) -> DiscoveryServer {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (hold, _) = watch::channel(false);

        DiscoveryServer {
            shared: Arc::new(Shared {
                identifier: self.identifier.clone(),
                local: Mutex::new(Pod::new(self.identifier.clone(), false, self.attributes)),
                peers: RwLock::new(PeerTable::new(self.identifier)),
                events,
                pending_echo: Mutex::new(None),
            }),
            session: Mutex::new(Session::default()),
            interface: self.interface,
            announce_interval: self.announce_interval,
            multicast_ttl: self.multicast_ttl,
            referenced: AtomicBool::new(true),
            hold,
        }
    }
}

/// Tracks peer availability on a multicast group
pub struct DiscoveryServer {
    shared: Arc<Shared>,
    session: Mutex<Session>,
    interface: Ipv4Addr,
    announce_interval: Option<Duration>,
    multicast_ttl: u32,
    referenced: AtomicBool,
    hold: watch::Sender<bool>,
}

impl DiscoveryServer {
    /// Create a server with default settings
    ///
    /// The identifier must be unique among every participant on the group.
    pub fn new(identifier: impl Into<String>, attributes: Attributes) -> Self {
        Self::builder(identifier).attributes(attributes).build()
    }

    pub fn builder(identifier: impl Into<String>) -> DiscoveryServerBuilder {
        DiscoveryServerBuilder {
            identifier: identifier.into(),
            attributes: Attributes::new(),
            interface: Ipv4Addr::UNSPECIFIED,
            announce_interval: None,
            multicast_ttl: 1,
        }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Bind, join the group and complete the self-echo handshake
    ///
    /// Dropping the returned future before it resolves leaves the server
    /// idle, and `listen` can be called again.
    pub async fn listen(&self, port: u16, multicast_address: Ipv4Addr) -> Result<()> {
        let validated = self.local().validate();
        if let Err(e) = validated {
            return Err(self.report(e.into()));
        }
        {
            let mut session = self.session();
            if session.listening || session.handshaking {
                return Err(DiscoveryError::AlreadyListening);
            }
            session.handshaking = true;
        }
        let mut handshake = Handshake::new(self);

        let socket = match self.bind(port, multicast_address) {
            Ok(socket) => Arc::new(socket),
            Err(e) => return Err(self.report(e)),
        };
        let local_port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return Err(self.report(e.into())),
        };
        let destination = SocketAddr::from((multicast_address, local_port));

        debug!(
            group = %multicast_address,
            port = local_port,
            "Bound discovery socket, waiting for self-echo"
        );

        let echo = self.expect_echo(true);
        handshake.receiver = Some(tokio::spawn(receive_loop(self.shared.clone(), socket.clone())));

        let payload = self.local_payload(true);
        if let Err(e) = socket.send_to(&payload, destination).await {
            return Err(self.report(e.into()));
        }

        let host = echo.await.map_err(|_| DiscoveryError::EchoAborted)?;

        {
            let mut session = self.session();
            session.handshaking = false;
            session.receiver = handshake.finish();
            session.socket = Some(socket.clone());
            session.membership = Some(multicast_address);
            session.local_port = Some(local_port);
            session.local_address = Some(host);
            session.listening = true;
            if let Some(period) = self.announce_interval {
                session.announcer = Some(tokio::spawn(announce_loop(
                    self.shared.clone(),
                    socket,
                    destination,
                    period,
                )));
            }
        }
        self.update_hold();

        info!(
            identifier = %self.shared.identifier,
            address = %host,
            group = %multicast_address,
            port = local_port,
            "Discovery server listening"
        );
        self.emit(DiscoveryEvent::Listening);
        Ok(())
    }

    /// Announce unavailability, wait for the echo, then leave the group and close the socket
    pub async fn close(&self) -> Result<()> {
        let (socket, destination) = {
            let mut session = self.session();
            if !session.listening {
                return Err(DiscoveryError::NotListening);
            }
            if let Some(task) = session.announcer.take() {
                task.abort();
            }
            match (session.socket.clone(), session.destination()) {
                (Some(socket), Some(destination)) => (socket, destination),
                _ => return Err(DiscoveryError::NotListening),
            }
        };

        let echo = self.expect_echo(false);
        let payload = self.local_payload(false);
        if let Err(e) = socket.send_to(&payload, destination).await {
            return Err(self.report(e.into()));
        }
        echo.await.map_err(|_| DiscoveryError::EchoAborted)?;

        if let IpAddr::V4(group) = destination.ip() {
            if let Err(e) = socket.leave_multicast_v4(group, self.interface) {
                warn!(group = %group, "Failed to leave multicast group: {}", e);
            }
        }
        self.session().teardown();
        self.update_hold();

        info!(identifier = %self.shared.identifier, "Discovery server closed");
        self.emit(DiscoveryEvent::Close);
        Ok(())
    }

    /// Let the socket keep the process alive (the default)
    pub fn ref_socket(&self) {
        self.referenced.store(true, Ordering::SeqCst);
        self.update_hold();
    }

    /// Stop the socket alone from keeping the process alive
    pub fn unref_socket(&self) {
        self.referenced.store(false, Ordering::SeqCst);
        self.update_hold();
    }

    /// Resolves once the socket no longer holds the process: not listening or unreferenced
    pub async fn released(&self) {
        let mut hold = self.hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    pub fn attributes(&self) -> Attributes {
        self.local().attributes().clone()
    }

    /// Update an advertised attribute; carried by the next announcement
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.local().set_attribute(key, value);
    }

    pub fn is_listening(&self) -> bool {
        self.session().listening
    }

    pub fn membership(&self) -> Option<Ipv4Addr> {
        self.session().membership
    }

    pub fn local_port(&self) -> Option<u16> {
        self.session().local_port
    }

    /// Address peers see for this instance, resolved by the self-echo
    pub fn local_address(&self) -> Option<IpAddr> {
        self.session().local_address
    }

    /// Snapshot of every peer seen so far
    pub async fn peers(&self) -> HashMap<String, PeerRecord> {
        self.shared.peers.read().await.snapshot()
    }

    pub async fn peer(&self, identifier: &str) -> Option<PeerRecord> {
        self.shared.peers.read().await.get(identifier).cloned()
    }

    fn bind(&self, port: u16, group: Ipv4Addr) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(self.multicast_ttl)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket
            .join_multicast_v4(&group, &self.interface)
            .map_err(|source| DiscoveryError::Membership {
                group,
                source: Arc::new(source),
            })?;

        Ok(UdpSocket::from_std(socket.into())?)
    }

    fn expect_echo(&self, available: bool) -> oneshot::Receiver<IpAddr> {
        let (resolve, echo) = oneshot::channel();
        *self.shared.pending_echo() = Some(PendingEcho { available, resolve });
        echo
    }

    fn local_payload(&self, available: bool) -> Vec<u8> {
        let mut local = self.local();
        local.set_available(available);
        local.to_bytes()
    }

    fn report(&self, err: DiscoveryError) -> DiscoveryError {
        warn!(identifier = %self.shared.identifier, "Discovery socket error: {}", err);
        self.emit(DiscoveryEvent::Error(err.clone()));
        err
    }

    fn emit(&self, event: DiscoveryEvent) {
        self.shared.emit(event);
    }

    fn update_hold(&self) {
        let held = self.referenced.load(Ordering::SeqCst) && self.session().listening;
        self.hold.send_replace(held);
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local(&self) -> MutexGuard<'_, Pod> {
        self.shared.local.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.session().teardown();
    }
}

impl Shared {
    async fn handle_datagram(&self, payload: &[u8], source: SocketAddr) {
        let pod = match Pod::from_bytes(payload) {
            Ok(pod) => pod,
            Err(e) => {
                warn!(source = %source, "Dropping malformed datagram: {}", e);
                return;
            }
        };

        if pod.identifier() == self.identifier {
            self.resolve_echo(&pod, source.ip());
            return;
        }

        let host = source.ip().to_string();
        let event = self.peers.write().await.observe(pod, &host);
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn resolve_echo(&self, pod: &Pod, address: IpAddr) {
        let mut pending = self.pending_echo();
        match pending.take() {
            Some(echo) if echo.available == pod.available() => {
                debug!(address = %address, available = pod.available(), "Observed self-echo");
                let _ = echo.resolve.send(address);
            }
            other => {
                *pending = other;
                debug!("Ignoring own announcement");
            }
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        debug!(event = event.name(), "Emitting discovery event");
        let _ = self.events.send(event);
    }

    fn pending_echo(&self) -> MutexGuard<'_, Option<PendingEcho>> {
        self.pending_echo.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn announcement(&self) -> Vec<u8> {
        self.local.lock().unwrap_or_else(|e| e.into_inner()).to_bytes()
    }
}

async fn receive_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut failures: u32 = 0;
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, source)) => {
                failures = 0;
                shared.handle_datagram(&buf[..len], source).await;
            }
            Err(e) => {
                // Only the first failure of a streak is published
                if failures == 0 {
                    warn!("Discovery receive error: {}", e);
                    shared.emit(DiscoveryEvent::Error(e.into()));
                } else {
                    debug!(failures, "Discovery receive still failing: {}", e);
                }
                failures = failures.saturating_add(1);
                tokio::time::sleep(receive_backoff(failures)).await;
            }
        }
    }
}

/// Delay before the next receive after `failures` consecutive errors
fn receive_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    RECEIVE_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(RECEIVE_BACKOFF_MAX)
}

async fn announce_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately and the handshake already announced.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&shared.announcement(), destination).await {
            warn!("Keepalive announcement failed: {}", e);
        }
    }
}
