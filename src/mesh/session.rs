/**
 * mesh/session.rs
 *
 * Authenticated, encrypted, keep-alive maintained link over a Datagram.
 *
 * SessionCore is the state machine with time passed in. MeshSession runs
 * it in a control task next to a receive task that alone owns the replay
 * window and last-seen timestamp.
 */

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::mesh::crypto::{FrameCipher, NetworkKey};
use crate::mesh::frame::{FrameError, FrameType, Hello, RawFrame, FRAME_OVERHEAD};
use crate::mesh::link::Datagram;
use crate::mesh::replay::ReplayWindow;
use crate::nat_traversal::hole_punching::{ProbeAuth, ProbePacket};
use crate::nat_traversal::types::PeerDescriptor;

const INBOUND_QUEUE: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keepalive_interval: Duration,
    /// Silence before Established becomes Degraded
    pub degraded_after: Duration,
    /// Silence before the session closes
    pub close_after: Duration,
    pub hello_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_invalid_hellos: u32,
    /// Largest datagram put on the link, frame overhead included
    pub max_datagram: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            degraded_after: Duration::from_secs(30),
            close_after: Duration::from_secs(90),
            hello_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            max_invalid_hellos: 8,
            max_datagram: 1400,
        }
    }
}

impl SessionConfig {
    pub fn max_payload(&self) -> usize {
        self.max_datagram.saturating_sub(FRAME_OVERHEAD)
    }

    fn tick(&self) -> Duration {
        self.hello_interval
            .min(self.keepalive_interval / 2)
            .min(self.degraded_after / 4)
            .min(Duration::from_millis(250))
            .max(Duration::from_millis(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Degraded,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    PeerClosed,
    HandshakeFailed(String),
    LivenessTimeout,
    LinkFailed(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no authenticated traffic from peer, session timed out")]
    LivenessTimeout,

    #[error("session closed by peer")]
    PeerClosed,

    #[error("session closed")]
    Closed,

    #[error("session not established yet")]
    NotEstablished,

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("link failed: {0}")]
    LinkFailed(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CloseReason> for SessionError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Local => SessionError::Closed,
            CloseReason::PeerClosed => SessionError::PeerClosed,
            CloseReason::HandshakeFailed(why) => SessionError::HandshakeFailed(why),
            CloseReason::LivenessTimeout => SessionError::LivenessTimeout,
            CloseReason::LinkFailed(why) => SessionError::LinkFailed(why),
        }
    }
}

/// Work the core asks its driver to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendHello { ack: bool },
    SendKeepAlive,
    StateChanged(SessionState),
}

/// Session state machine
#[derive(Debug)]
pub struct SessionCore {
    config: SessionConfig,
    state: SessionState,
    started: Instant,
    last_rx: Option<Instant>,
    last_tx: Option<Instant>,
    last_hello: Option<Instant>,
    peer_authenticated: bool,
    local_send_ok: bool,
    invalid_hellos: u32,
    close_reason: Option<CloseReason>,
}

impl SessionCore {
    pub fn new(config: SessionConfig, now: Instant) -> Self {
        Self {
            config,
            state: SessionState::Handshaking,
            started: now,
            last_rx: None,
            last_tx: None,
            last_hello: None,
            peer_authenticated: false,
            local_send_ok: false,
            invalid_hellos: 0,
            close_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn last_rx(&self) -> Option<Instant> {
        self.last_rx
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.state {
            SessionState::Handshaking => {
                if now.saturating_duration_since(self.started) >= self.config.handshake_timeout {
                    self.close_with(
                        CloseReason::HandshakeFailed("handshake deadline passed".into()),
                        &mut actions,
                    );
                    return actions;
                }

                let due = self
                    .last_hello
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.hello_interval);
                if due {
                    self.last_hello = Some(now);
                    actions.push(Action::SendHello {
                        ack: self.peer_authenticated,
                    });
                }
            }
            SessionState::Established | SessionState::Degraded => {
                let silence = now.saturating_duration_since(self.last_rx.unwrap_or(self.started));

                if self.state == SessionState::Established && silence >= self.config.degraded_after {
                    self.transition(SessionState::Degraded, &mut actions);
                }
                if self.state == SessionState::Degraded && silence >= self.config.close_after {
                    self.close_with(CloseReason::LivenessTimeout, &mut actions);
                    return actions;
                }

                let keepalive_due = self
                    .last_tx
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.keepalive_interval);
                if keepalive_due {
                    actions.push(Action::SendKeepAlive);
                }
            }
            SessionState::Closed => {}
        }

        actions
    }

    /// A frame left the local socket
    pub fn on_sent(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Closed {
            return actions;
        }
        self.last_tx = Some(now);
        self.local_send_ok = true;
        self.try_establish(&mut actions);
        actions
    }

    /// An authenticated frame arrived from the peer
    pub fn on_authenticated(&mut self, frame: FrameType, hello: Option<&Hello>, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == SessionState::Closed {
            return actions;
        }

        self.last_rx = Some(now);
        self.peer_authenticated = true;

        match frame {
            FrameType::Close => {
                self.close_with(CloseReason::PeerClosed, &mut actions);
                return actions;
            }
            FrameType::Hello => {
                if hello.is_some_and(|h| !h.ack) {
                    actions.push(Action::SendHello { ack: true });
                }
            }
            FrameType::Data | FrameType::KeepAlive => {}
        }

        if self.state == SessionState::Degraded {
            self.transition(SessionState::Established, &mut actions);
        }
        self.try_establish(&mut actions);
        actions
    }

    /// A hello that failed authentication or carried stale nonces
    pub fn on_invalid_hello(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Handshaking {
            return actions;
        }

        self.invalid_hellos += 1;
        if self.invalid_hellos > self.config.max_invalid_hellos {
            let reason = format!("{} invalid hellos", self.invalid_hellos);
            self.close_with(CloseReason::HandshakeFailed(reason), &mut actions);
        }
        actions
    }

    pub fn close(&mut self, reason: CloseReason) -> Vec<Action> {
        let mut actions = Vec::new();
        self.close_with(reason, &mut actions);
        actions
    }

    fn try_establish(&mut self, actions: &mut Vec<Action>) {
        if self.state == SessionState::Handshaking && self.peer_authenticated && self.local_send_ok {
            self.transition(SessionState::Established, actions);
        }
    }

    fn close_with(&mut self, reason: CloseReason, actions: &mut Vec<Action>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.close_reason = Some(reason);
        self.transition(SessionState::Closed, actions);
    }

    fn transition(&mut self, to: SessionState, actions: &mut Vec<Action>) {
        if self.state != to {
            self.state = to;
            actions.push(Action::StateChanged(to));
        }
    }
}

/// Published by the control task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub close_reason: Option<CloseReason>,
    pub remote_virtual_ip: Option<Ipv4Addr>,
    pub frames_out: u64,
    pub bytes_out: u64,
}

/// Published by the receive task
#[derive(Debug, Clone, Default)]
pub struct RxSnapshot {
    pub last_rx: Option<Instant>,
    pub highest_seq: Option<u64>,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub replays_rejected: u64,
    pub auth_failures: u64,
    pub malformed: u64,
    pub inbound_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub replays_rejected: u64,
    pub auth_failures: u64,
    pub malformed: u64,
    pub inbound_dropped: u64,
}

enum Command {
    Send(Bytes, oneshot::Sender<Result<(), SessionError>>),
    Close(oneshot::Sender<()>),
}

enum RxEvent {
    Authenticated {
        frame: FrameType,
        hello: Option<Hello>,
    },
    InvalidHello(&'static str),
    LinkFailed(String),
}

struct RxTask {
    link: Arc<dyn Datagram>,
    cipher: Arc<FrameCipher>,
    probes: ProbeAuth,
    window: ReplayWindow,
    local_nonce: u64,
    remote_nonce: u64,
    remote_peer_id: String,
    snapshot: RxSnapshot,
    snapshot_tx: watch::Sender<RxSnapshot>,
    status: watch::Receiver<SessionStatus>,
    events: mpsc::Sender<RxEvent>,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl RxTask {
    async fn run(mut self) {
        let mut buffer = vec![0u8; 65_536];

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.link.recv(&mut buffer) => r,
            };

            match received {
                Ok(len) => self.handle(&buffer[..len]).await,
                Err(e) => {
                    warn!(error = %e, "session link receive failed");
                    let _ = self.events.send(RxEvent::LinkFailed(e.to_string())).await;
                    break;
                }
            }
        }
        trace!("session receive task stopped");
    }

    async fn handle(&mut self, data: &[u8]) {
        // Late punch probes from a peer that has not confirmed yet
        if ProbePacket::is_probe(data) {
            if let Some(reply) = self.probes.answer(data) {
                if let Err(e) = self.link.send(&reply).await {
                    debug!(error = %e, "failed to answer punch probe");
                }
            }
            return;
        }

        let event = self.authenticate(data);
        self.snapshot_tx.send_replace(self.snapshot.clone());

        if let Some(event) = event {
            let _ = self.events.send(event).await;
        }
    }

    fn authenticate(&mut self, data: &[u8]) -> Option<RxEvent> {
        let frame = match RawFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.snapshot.malformed += 1;
                debug!(error = %e, len = data.len(), "dropping malformed frame");
                return None;
            }
        };
        let frame_type = frame.header.frame_type;

        let ext_seq = match self.window.check(frame.header.seq) {
            Ok(ext) => ext,
            Err(e) => {
                self.snapshot.replays_rejected += 1;
                debug!(error = %e, "dropping replayed frame");
                return None;
            }
        };

        let plaintext = match self.cipher.open(&frame, ext_seq) {
            Ok(p) => p,
            Err(e) => {
                self.snapshot.auth_failures += 1;
                debug!(error = %e, ?frame_type, "dropping unauthenticated frame");
                return (frame_type == FrameType::Hello)
                    .then_some(RxEvent::InvalidHello("authentication failed"));
            }
        };

        self.window.commit(ext_seq);
        self.snapshot.last_rx = Some(Instant::now());
        self.snapshot.highest_seq = self.window.highest();
        self.snapshot.frames_in += 1;
        self.snapshot.bytes_in += data.len() as u64;

        match frame_type {
            FrameType::Hello => Some(match self.check_hello(&plaintext) {
                Ok(hello) => RxEvent::Authenticated {
                    frame: frame_type,
                    hello: Some(hello),
                },
                Err(reason) => RxEvent::InvalidHello(reason),
            }),
            FrameType::Data => {
                self.deliver(plaintext);
                Some(RxEvent::Authenticated {
                    frame: frame_type,
                    hello: None,
                })
            }
            FrameType::KeepAlive | FrameType::Close => Some(RxEvent::Authenticated {
                frame: frame_type,
                hello: None,
            }),
        }
    }

    fn check_hello(&self, plaintext: &[u8]) -> Result<Hello, &'static str> {
        let hello = Hello::from_bytes(plaintext).map_err(|_| "malformed hello")?;
        if hello.peer_id != self.remote_peer_id {
            return Err("unexpected peer id");
        }
        if hello.sender_nonce != self.remote_nonce || hello.receiver_nonce != self.local_nonce {
            return Err("stale session nonce");
        }
        Ok(hello)
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        let closed = self.status.borrow().state == SessionState::Closed;
        if closed {
            return;
        }
        if self.inbound.try_send(Bytes::from(payload)).is_err() {
            self.snapshot.inbound_dropped += 1;
            debug!("inbound queue full, dropping data frame");
        }
    }
}

struct ControlTask {
    link: Arc<dyn Datagram>,
    cipher: Arc<FrameCipher>,
    core: SessionCore,
    config: SessionConfig,
    local: PeerDescriptor,
    remote: PeerDescriptor,
    tx_seq: u64,
    frames_out: u64,
    bytes_out: u64,
    remote_virtual_ip: Option<Ipv4Addr>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<RxEvent>,
    status: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

impl ControlTask {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut closing = None;

            let actions = tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => self.core.on_tick(Instant::now()),

                event = self.events.recv() => match event {
                    Some(RxEvent::Authenticated { frame, hello }) => {
                        if let Some(h) = &hello {
                            self.remote_virtual_ip = Some(h.virtual_ip);
                        }
                        self.core.on_authenticated(frame, hello.as_ref(), Instant::now())
                    }
                    Some(RxEvent::InvalidHello(reason)) => {
                        debug!(peer = %self.remote.peer_id, reason, "invalid hello");
                        self.core.on_invalid_hello()
                    }
                    Some(RxEvent::LinkFailed(why)) => self.core.close(CloseReason::LinkFailed(why)),
                    None => self.core.close(CloseReason::LinkFailed("receive task stopped".into())),
                },

                command = self.commands.recv() => match command {
                    Some(Command::Send(payload, reply)) => {
                        let result = self.send_data(&payload).await;
                        let actions = match result {
                            Ok(()) => self.core.on_sent(Instant::now()),
                            Err(_) => Vec::new(),
                        };
                        let _ = reply.send(result);
                        actions
                    }
                    Some(Command::Close(done)) => {
                        if self.core.state() != SessionState::Closed {
                            if let Err(e) = self.transmit(FrameType::Close, &[]).await {
                                debug!(error = %e, "failed to send close frame");
                            }
                        }
                        closing = Some(done);
                        self.core.close(CloseReason::Local)
                    }
                    None => self.core.close(CloseReason::Local),
                },
            };

            self.execute(actions).await;
            self.publish();

            if let Some(done) = closing {
                let _ = done.send(());
            }
            if self.core.state() == SessionState::Closed {
                break;
            }
        }

        self.cancel.cancel();
        self.publish();
        trace!("session control task stopped");
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendHello { ack } => {
                    let hello = Hello {
                        peer_id: self.local.peer_id.clone(),
                        virtual_ip: self.local.virtual_ip,
                        sender_nonce: self.local.nonce,
                        receiver_nonce: self.remote.nonce,
                        ack,
                    };
                    match self.transmit(FrameType::Hello, &hello.to_bytes()).await {
                        Ok(()) => queue.extend(self.core.on_sent(Instant::now())),
                        Err(e) => debug!(error = %e, "hello send failed"),
                    }
                }
                Action::SendKeepAlive => match self.transmit(FrameType::KeepAlive, &[]).await {
                    Ok(()) => queue.extend(self.core.on_sent(Instant::now())),
                    Err(e) => debug!(error = %e, "keep-alive send failed"),
                },
                Action::StateChanged(state) => match state {
                    SessionState::Closed => info!(
                        peer = %self.remote.peer_id,
                        reason = ?self.core.close_reason(),
                        "session closed"
                    ),
                    _ => info!(
                        peer = %self.remote.peer_id,
                        link = self.link.kind(),
                        state = ?state,
                        "session state changed"
                    ),
                },
            }
        }
    }

    async fn send_data(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        match self.core.state() {
            SessionState::Closed => {
                return Err(self
                    .core
                    .close_reason()
                    .cloned()
                    .map_or(SessionError::Closed, SessionError::from))
            }
            SessionState::Handshaking => return Err(SessionError::NotEstablished),
            SessionState::Established | SessionState::Degraded => {}
        }

        let max = self.config.max_payload();
        if payload.len() > max {
            return Err(SessionError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        self.transmit(FrameType::Data, payload).await
    }

    async fn transmit(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<(), SessionError> {
        let frame = self.cipher.seal(frame_type, self.tx_seq, payload)?;
        self.tx_seq += 1;

        self.link.send(&frame).await?;
        self.frames_out += 1;
        self.bytes_out += frame.len() as u64;
        Ok(())
    }

    fn publish(&self) {
        let next = SessionStatus {
            state: self.core.state(),
            close_reason: self.core.close_reason().cloned(),
            remote_virtual_ip: self.remote_virtual_ip,
            frames_out: self.frames_out,
            bytes_out: self.bytes_out,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Handle to a running session
#[derive(Debug)]
pub struct MeshSession {
    local: PeerDescriptor,
    remote: PeerDescriptor,
    link_kind: &'static str,
    max_payload: usize,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    rx_snapshot: watch::Receiver<RxSnapshot>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MeshSession {
    /// Start the handshake over `link`. The session owns the link from
    /// here on.
    pub fn start(
        link: Box<dyn Datagram>,
        key: &NetworkKey,
        local: PeerDescriptor,
        remote: PeerDescriptor,
        config: SessionConfig,
    ) -> Self {
        let link: Arc<dyn Datagram> = Arc::from(link);
        let cipher = Arc::new(FrameCipher::new(key, local.nonce, remote.nonce));
        let cancel = CancellationToken::new();

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Handshaking,
            close_reason: None,
            remote_virtual_ip: None,
            frames_out: 0,
            bytes_out: 0,
        });
        let (snapshot_tx, snapshot_rx) = watch::channel(RxSnapshot::default());

        info!(
            peer = %remote.peer_id,
            link = link.kind(),
            remote_addr = %link.peer_addr(),
            "starting mesh session"
        );

        let rx = RxTask {
            link: link.clone(),
            cipher: cipher.clone(),
            probes: ProbeAuth::new(key, local.nonce, remote.nonce),
            window: ReplayWindow::new(),
            local_nonce: local.nonce,
            remote_nonce: remote.nonce,
            remote_peer_id: remote.peer_id.clone(),
            snapshot: RxSnapshot::default(),
            snapshot_tx,
            status: status_rx.clone(),
            events: event_tx,
            inbound: inbound_tx,
            cancel: cancel.clone(),
        };

        let control = ControlTask {
            link: link.clone(),
            cipher,
            core: SessionCore::new(config.clone(), Instant::now()),
            config: config.clone(),
            local: local.clone(),
            remote: remote.clone(),
            tx_seq: 0,
            frames_out: 0,
            bytes_out: 0,
            remote_virtual_ip: None,
            commands: command_rx,
            events: event_rx,
            status: status_tx,
            cancel: cancel.clone(),
        };

        let link_kind = link.kind();
        let tasks = vec![tokio::spawn(rx.run()), tokio::spawn(control.run())];

        Self {
            local,
            remote,
            link_kind,
            max_payload: config.max_payload(),
            commands: command_tx,
            status: status_rx,
            rx_snapshot: snapshot_rx,
            inbound: Mutex::new(inbound_rx),
            tasks: Mutex::new(tasks),
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn remote(&self) -> &PeerDescriptor {
        &self.remote
    }

    /// The peer's virtual address, as announced in its hello
    pub fn remote_virtual_ip(&self) -> Ipv4Addr {
        self.status
            .borrow()
            .remote_virtual_ip
            .unwrap_or(self.remote.virtual_ip)
    }

    pub fn link_kind(&self) -> &'static str {
        self.link_kind
    }

    /// Largest payload accepted by [`send`](Self::send)
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn closed_error(&self) -> SessionError {
        self.status
            .borrow()
            .close_reason
            .clone()
            .map_or(SessionError::Closed, SessionError::from)
    }

    /// Wait for the handshake to finish
    pub async fn wait_established(&self) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        let state = status
            .wait_for(|s| s.state != SessionState::Handshaking)
            .await
            .map_err(|_| SessionError::Closed)?
            .state;

        match state {
            SessionState::Closed => Err(self.closed_error()),
            _ => Ok(()),
        }
    }

    /// Wait for the session to close and return why
    pub async fn wait_closed(&self) -> Option<CloseReason> {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.state == SessionState::Closed).await;
        let reason = status.borrow().close_reason.clone();
        reason
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(payload, reply_tx))
            .await
            .map_err(|_| self.closed_error())?;
        reply_rx.await.map_err(|_| self.closed_error())?
    }

    /// Next inbound Data payload, in arrival order. `None` once the
    /// session has closed and the queue is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    pub fn stats(&self) -> SessionStats {
        let rx = self.rx_snapshot.borrow().clone();
        let status = self.status.borrow();
        SessionStats {
            frames_in: rx.frames_in,
            frames_out: status.frames_out,
            bytes_in: rx.bytes_in,
            bytes_out: status.bytes_out,
            replays_rejected: rx.replays_rejected,
            auth_failures: rx.auth_failures,
            malformed: rx.malformed,
            inbound_dropped: rx.inbound_dropped,
        }
    }

    /// Last time an authenticated frame arrived
    pub fn last_rx(&self) -> Option<Instant> {
        self.rx_snapshot.borrow().last_rx
    }

    /// Send a Close frame, stop both tasks and wait for them. The link is
    /// released when this returns.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).await.is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, done_rx).await;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("session task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
