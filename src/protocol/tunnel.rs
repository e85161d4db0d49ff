//! The tunnel session: connection management, sequencing and supervision.
//!
//! A session runs four cooperating actors:
//!
//! - the **dispatcher** owns the socket's inbound frame stream and routes
//!   each frame: tunneled cEMI to the consumer, acks to the waiting sender,
//!   state responses to the heartbeat probe, disconnects to the supervisor;
//! - the **sender** ([`Tunnel::send`]) transmits one tunneling request at a
//!   time under the sequence lock and retransmits until acknowledged;
//! - the **heartbeat probe** checks gateway liveness at the heartbeat
//!   interval with a CONNECTIONSTATE_REQUEST;
//! - the **supervisor** reacts to heartbeat failure or a gateway disconnect
//!   with one bounded reconnect attempt before giving up.
//!
//! ```text
//!   Connecting → Connected → (Disconnected | HeartbeatFailed | Cancelled | InboundClosed)
//!              ↖ Reconnecting ↙
//! ```
//!
//! Sequence rules: the k-th acknowledged outbound request carries sequence
//! `k mod 256`; an inbound request is delivered when its sequence matches
//! the expected counter, acknowledged without delivery when it trails by
//! one (a duplicate), and dropped otherwise. Frames for a foreign channel
//! are always rejected.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::net::socket::{self, FrameSender};
use crate::net::transport::{Transport, UdpTransport};
use crate::protocol::cemi::CemiFrame;
use crate::protocol::constants::{CONN_STATE_NORMAL, E_NO_ERROR, E_NO_MORE_CONNECTIONS};
use crate::protocol::frame::Hpai;
use crate::protocol::services::{
    ConnectRequest, ConnectionStateRequest, DisconnectRequest, DisconnectResponse, Frame,
    TunnelingAck, TunnelingRequest,
};

/// Default interval between retransmissions of an unanswered request.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Default idle period after which a liveness probe is triggered.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum wait for any single response exchange.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// cEMI frames buffered for the consumer. When the consumer lags this far
/// behind, further inbound frames are dropped so the dispatcher stays
/// responsive.
const INBOUND_QUEUE: usize = 32;

/// Timing configuration of a tunnel session.
///
/// Zero durations are replaced by the defaults when the session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Interval between retransmissions of an unanswered request.
    pub resend_interval: Duration,
    /// Idle period after which a liveness probe is triggered.
    pub heartbeat_interval: Duration,
    /// Maximum wait for any single response exchange, including the initial
    /// connect and each heartbeat.
    pub response_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl TunnelConfig {
    /// Replace unusable zero durations with the defaults.
    fn sanitized(mut self) -> Self {
        if self.resend_interval.is_zero() {
            self.resend_interval = DEFAULT_RESEND_INTERVAL;
        }
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        if self.response_timeout.is_zero() {
            self.response_timeout = DEFAULT_RESPONSE_TIMEOUT;
        }
        self
    }
}

/// Why the dispatcher loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    HeartbeatFailed,
    InboundClosed,
    Disconnected,
    CleanClose,
}

/// Channel id and control endpoint of the current connection.
///
/// Immutable while the session is established; replaced as a whole by a
/// reconnect.
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    channel: u8,
    control: Hpai,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self { channel: 0, control: Hpai::UNSPECIFIED }
    }
}

/// Sending halves of the dispatcher's routing channels.
///
/// Owned by the supervisor task; dropping them on exit closes the consumer
/// stream and unblocks a waiting heartbeat probe.
struct DispatchChannels {
    state: mpsc::Sender<u8>,
    delivery: mpsc::Sender<CemiFrame>,
}

/// Shared state of one tunnel session.
struct TunnelConnection<T> {
    socket: FrameSender<T>,
    config: TunnelConfig,
    endpoint: StdMutex<Endpoint>,
    /// Outbound sequence counter. The lock is held for the entire duration
    /// of a send, so no two sends can carry the same sequence number.
    send_seq: AsyncMutex<u8>,
    /// Ack channel of the send currently in flight, if any.
    ///
    /// Each send installs a fresh channel here and keeps the receiving end;
    /// the dispatcher offers acks into it and drops them when nobody is
    /// waiting. An ack is never retained for a later send.
    ack_claim: StdMutex<Option<mpsc::Sender<TunnelingAck>>>,
    state_rx: AsyncMutex<mpsc::Receiver<u8>>,
    /// Cancelled by the supervisor on exit so pending senders fail fast
    /// instead of sitting out their full timeout against a dead session.
    terminated: CancellationToken,
}

/// A resend timer whose first tick fires one period from now.
fn resend_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

impl<T: Transport> TunnelConnection<T> {
    fn endpoint(&self) -> Endpoint {
        match self.endpoint.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_endpoint(&self, endpoint: Endpoint) {
        let mut guard = match self.endpoint.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = endpoint;
    }

    fn check_channel(&self, channel: u8) -> bool {
        self.endpoint().channel == channel
    }

    /// Publish the ack channel of the send that is now in flight.
    fn set_ack_claim(&self, claim: mpsc::Sender<TunnelingAck>) {
        let mut guard = match self.ack_claim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(claim);
    }

    /// Offer an ack to the sender currently waiting for one.
    ///
    /// Returns false when no send is in flight, the claimed channel has been
    /// abandoned (the sender timed out or was cancelled), or its one-slot
    /// buffer is already occupied. The ack is dropped in every such case.
    fn offer_ack(&self, ack: TunnelingAck) -> bool {
        let guard = match self.ack_claim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(claim) => claim.try_send(ack).is_ok(),
            None => false,
        }
    }

    /// Drive CONNECT_REQUEST → CONNECT_RESPONSE, resending at the resend
    /// interval. A busy gateway does not stop the exchange; any other
    /// non-ok status denies it. The caller bounds the overall wait.
    async fn request_conn(
        &self,
        frames: &mut mpsc::Receiver<Frame>,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let request = Frame::ConnectRequest(ConnectRequest::tunnel());
        self.socket.send(&request).await?;

        let mut resend = resend_timer(self.config.resend_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),

                _ = resend.tick() => self.socket.send(&request).await?,

                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return Err(TunnelError::InboundClosed);
                    };
                    let Frame::ConnectResponse(response) = frame else {
                        continue;
                    };
                    match response.status {
                        E_NO_ERROR => {
                            // Sequence numbers restart with the new channel.
                            *self.send_seq.lock().await = 0;

                            self.set_endpoint(Endpoint {
                                channel: response.channel,
                                control: response.control,
                            });
                            debug!("tunnel connected on channel {}", response.channel);
                            return Ok(());
                        }
                        E_NO_MORE_CONNECTIONS => {
                            debug!("gateway busy, continuing to ask");
                        }
                        status => return Err(TunnelError::ConnectRejected(status)),
                    }
                }
            }
        }
    }

    /// Send one tunneling request and wait for its acknowledgement,
    /// retransmitting at the resend interval.
    ///
    /// The sequence lock spans the entire exchange. Acks with a different
    /// sequence number are ignored; the matching ack advances the counter
    /// whether or not its status reports success. A timed-out send leaves
    /// the counter untouched, and because the ack channel below is created
    /// per send, an ack the gateway delivers after the timeout can never
    /// complete a later send that reuses the same sequence number.
    async fn request_tunnel(
        &self,
        payload: CemiFrame,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let mut seq_guard = self.send_seq.lock().await;
        let seq = *seq_guard;
        let channel = self.endpoint().channel;

        // Fresh rendezvous for this send. When this future is dropped the
        // receiver closes, so the dispatcher's offers start failing the
        // moment nobody waits for them.
        let (ack_tx, mut ack_rx) = mpsc::channel(1);
        self.set_ack_claim(ack_tx);

        let request = Frame::TunnelingRequest(TunnelingRequest { channel, seq, payload });
        self.socket.send(&request).await?;

        let mut resend = resend_timer(self.config.resend_interval);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),

                _ = self.terminated.cancelled() => return Err(TunnelError::Disconnected),

                ack = ack_rx.recv() => {
                    let Some(ack) = ack else {
                        return Err(TunnelError::Disconnected);
                    };
                    if ack.seq != seq {
                        trace!("ignoring ack for sequence {} (ours is {seq})", ack.seq);
                        continue;
                    }

                    *seq_guard = seq.wrapping_add(1);
                    return if ack.status == E_NO_ERROR {
                        Ok(())
                    } else {
                        Err(TunnelError::TunnelRejected(ack.status))
                    };
                }

                _ = resend.tick() => self.socket.send(&request).await?,
            }
        }
    }

    /// Ask the gateway for the connection state, resending until an answer
    /// arrives. The caller bounds the overall wait.
    async fn request_conn_state(
        &self,
        state_rx: &mut mpsc::Receiver<u8>,
        cancel: &CancellationToken,
    ) -> Result<u8, TunnelError> {
        // A state buffered for an earlier probe must not answer this one.
        while state_rx.try_recv().is_ok() {}

        let request = Frame::ConnectionStateRequest(ConnectionStateRequest {
            channel: self.endpoint().channel,
            control: Hpai::UNSPECIFIED,
        });
        self.socket.send(&request).await?;

        let mut resend = resend_timer(self.config.resend_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),

                _ = resend.tick() => self.socket.send(&request).await?,

                state = state_rx.recv() => {
                    return state.ok_or(TunnelError::Disconnected);
                }
            }
        }
    }

    /// One heartbeat probe, spawned per interval tick.
    ///
    /// Skips the tick when the previous probe still holds the state
    /// receiver. Anything but a normal state within the response timeout
    /// raises heartbeat failure to the supervisor.
    async fn perform_heartbeat(
        self: Arc<Self>,
        cancel: CancellationToken,
        failed: mpsc::Sender<()>,
    ) {
        let Ok(mut state_rx) = self.state_rx.try_lock() else {
            return;
        };

        let outcome = time::timeout(
            self.config.response_timeout,
            self.request_conn_state(&mut state_rx, &cancel),
        )
        .await;

        match outcome {
            Ok(Ok(CONN_STATE_NORMAL)) => trace!("heartbeat ok"),
            Ok(Ok(state)) => {
                warn!("heartbeat reported connection state {state:#04x}");
                let _ = failed.try_send(());
            }
            Ok(Err(TunnelError::Cancelled)) => {}
            Ok(Err(err)) => {
                warn!("heartbeat failed: {err}");
                let _ = failed.try_send(());
            }
            Err(_) => {
                warn!("heartbeat timed out");
                let _ = failed.try_send(());
            }
        }
    }

    /// Best-effort DISCONNECT_REQUEST for a clean close.
    async fn request_disc(&self) -> Result<(), TunnelError> {
        let endpoint = self.endpoint();
        self.socket
            .send(&Frame::DisconnectRequest(DisconnectRequest {
                channel: endpoint.channel,
                control: endpoint.control,
            }))
            .await
    }

    /// Handle an inbound TUNNELING_REQUEST.
    ///
    /// The expected sequence delivers and advances; its predecessor is a
    /// duplicate and is acknowledged without delivery; anything else is
    /// dropped without acknowledgement.
    async fn handle_tunnel_request(
        &self,
        request: TunnelingRequest,
        expected_seq: &mut u8,
        channels: &DispatchChannels,
    ) {
        if !self.check_channel(request.channel) {
            warn!("dropping tunneling request for foreign channel {}", request.channel);
            return;
        }

        if request.seq == *expected_seq {
            *expected_seq = expected_seq.wrapping_add(1);
            match channels.delivery.try_send(request.payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("inbound queue full, dropping cEMI frame");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        } else if request.seq == expected_seq.wrapping_sub(1) {
            debug!("acknowledging duplicate tunneling request {}", request.seq);
        } else {
            warn!(
                "dropping out-of-sequence tunneling request {} (expected {})",
                request.seq, expected_seq
            );
            return;
        }

        let ack = Frame::TunnelingAck(TunnelingAck {
            channel: request.channel,
            seq: request.seq,
            status: E_NO_ERROR,
        });
        if let Err(err) = self.socket.send(&ack).await {
            debug!("tunneling ack not sent: {err}");
        }
    }

    /// Route one inbound frame. Returns the session end it caused, if any.
    async fn dispatch(
        &self,
        frame: Frame,
        expected_seq: &mut u8,
        channels: &DispatchChannels,
    ) -> Option<SessionEnd> {
        match frame {
            Frame::DisconnectRequest(request) => {
                if !self.check_channel(request.channel) {
                    warn!("dropping disconnect request for foreign channel {}", request.channel);
                    return None;
                }
                let response = Frame::DisconnectResponse(DisconnectResponse {
                    channel: request.channel,
                    status: E_NO_ERROR,
                });
                if let Err(err) = self.socket.send(&response).await {
                    debug!("disconnect response not sent: {err}");
                }
                Some(SessionEnd::Disconnected)
            }

            Frame::DisconnectResponse(response) => {
                if !self.check_channel(response.channel) {
                    warn!("dropping disconnect response for foreign channel {}", response.channel);
                    return None;
                }
                Some(SessionEnd::CleanClose)
            }

            Frame::TunnelingRequest(request) => {
                self.handle_tunnel_request(request, expected_seq, channels).await;
                None
            }

            Frame::TunnelingAck(ack) => {
                if !self.check_channel(ack.channel) {
                    warn!("dropping ack for foreign channel {}", ack.channel);
                    return None;
                }
                // Rendezvous with the sender whose request is in flight. An
                // ack nobody is waiting for is useless and is dropped, never
                // retained for a later send.
                if !self.offer_ack(ack) {
                    trace!("dropping unclaimed ack for sequence {}", ack.seq);
                }
                None
            }

            Frame::ConnectionStateResponse(response) => {
                if !self.check_channel(response.channel) {
                    warn!(
                        "dropping connection state response for foreign channel {}",
                        response.channel
                    );
                    return None;
                }
                let tx = channels.state.clone();
                let patience = self.config.resend_interval;
                tokio::spawn(async move {
                    let _ = tx.send_timeout(response.status, patience).await;
                });
                None
            }

            other => {
                debug!("ignoring unexpected {:?} frame", other.service_type());
                None
            }
        }
    }

    /// The dispatcher loop: consume inbound frames and heartbeat ticks until
    /// something ends the session.
    async fn process(
        conn: &Arc<Self>,
        frames: &mut mpsc::Receiver<Frame>,
        channels: &DispatchChannels,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (failed_tx, mut failed_rx) = mpsc::channel(1);
        // Inbound sequencing restarts with each (re)connected channel.
        let mut expected_seq: u8 = 0;

        let mut heartbeat = interval_at(
            Instant::now() + conn.config.heartbeat_interval,
            conn.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,

                _ = failed_rx.recv() => return SessionEnd::HeartbeatFailed,

                _ = heartbeat.tick() => {
                    tokio::spawn(
                        Arc::clone(conn).perform_heartbeat(cancel.clone(), failed_tx.clone()),
                    );
                }

                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::InboundClosed;
                    };
                    if let Some(end) = conn.dispatch(frame, &mut expected_seq, channels).await {
                        return end;
                    }
                }
            }
        }
    }

    /// The supervisor: run the dispatcher, reconnect once on recoverable
    /// failures, and tear the session down otherwise.
    async fn serve(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<Frame>,
        channels: DispatchChannels,
        cancel: CancellationToken,
    ) {
        loop {
            let end = Self::process(&self, &mut frames, &channels, &cancel).await;
            match end {
                SessionEnd::CleanClose => {
                    debug!("tunnel closed");
                    break;
                }
                SessionEnd::Cancelled => {
                    debug!("tunnel cancelled");
                    break;
                }
                SessionEnd::InboundClosed => {
                    warn!("tunnel terminated: inbound stream closed");
                    break;
                }
                SessionEnd::Disconnected | SessionEnd::HeartbeatFailed => {
                    let cause = match end {
                        SessionEnd::Disconnected => TunnelError::Disconnected,
                        _ => TunnelError::HeartbeatFailed,
                    };
                    info!("connection lost: {cause}; attempting reconnect");
                    let reconnect = time::timeout(
                        self.config.response_timeout,
                        self.request_conn(&mut frames, &cancel),
                    )
                    .await;
                    match reconnect {
                        Ok(Ok(())) => info!("reconnect succeeded"),
                        Ok(Err(err)) => {
                            warn!("reconnect failed: {err}; tunnel terminated: {cause}");
                            break;
                        }
                        Err(_) => {
                            warn!("reconnect timed out; tunnel terminated: {cause}");
                            break;
                        }
                    }
                }
            }
        }
        // Unblock any sender still awaiting an ack, then drop `channels` so
        // the consumer stream ends and a waiting probe observes the closed
        // session.
        self.terminated.cancel();
    }
}

/// Client endpoint of a KNXnet/IP tunnel connection.
///
/// Created by [`Tunnel::open`] (UDP) or [`Tunnel::open_with_transport`]
/// (any [`Transport`]). Dropping the handle cancels the session.
///
/// # Example
///
/// ```no_run
/// use knx_tunnel::{Tunnel, TunnelConfig};
///
/// # async fn run() -> Result<(), knx_tunnel::TunnelError> {
/// let mut tunnel = Tunnel::open("192.168.1.10:3671", TunnelConfig::default()).await?;
/// while let Some(cemi) = tunnel.recv().await {
///     println!("received {cemi:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Tunnel<T: Transport = UdpTransport> {
    conn: Arc<TunnelConnection<T>>,
    inbound: mpsc::Receiver<CemiFrame>,
    cancel: CancellationToken,
}

impl Tunnel<UdpTransport> {
    /// Connect to the gateway at `gateway` (e.g. `"192.168.1.10:3671"`).
    ///
    /// Fills in defaults for zero config durations, performs the handshake
    /// bounded by the response timeout and spawns the supervisor.
    pub async fn open(gateway: &str, config: TunnelConfig) -> Result<Self, TunnelError> {
        let transport = UdpTransport::connect(gateway).await?;
        Self::open_with_transport(transport, config).await
    }
}

impl<T: Transport> Tunnel<T> {
    /// Open a tunnel session over an arbitrary transport.
    pub async fn open_with_transport(transport: T, config: TunnelConfig) -> Result<Self, TunnelError> {
        let config = config.sanitized();
        let cancel = CancellationToken::new();
        let (sender, mut frames) = socket::start(transport, cancel.clone());

        let (state_tx, state_rx) = mpsc::channel(1);
        let (delivery_tx, delivery_rx) = mpsc::channel(INBOUND_QUEUE);

        let conn = Arc::new(TunnelConnection {
            socket: sender,
            config,
            endpoint: StdMutex::new(Endpoint::default()),
            send_seq: AsyncMutex::new(0),
            ack_claim: StdMutex::new(None),
            state_rx: AsyncMutex::new(state_rx),
            terminated: CancellationToken::new(),
        });
        let channels = DispatchChannels { state: state_tx, delivery: delivery_tx };

        match time::timeout(config.response_timeout, conn.request_conn(&mut frames, &cancel)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                cancel.cancel();
                return Err(err);
            }
            Err(_) => {
                cancel.cancel();
                return Err(TunnelError::Timeout);
            }
        }

        tokio::spawn(Arc::clone(&conn).serve(frames, channels, cancel.clone()));

        Ok(Self { conn, inbound: delivery_rx, cancel })
    }

    /// Send one cEMI frame through the tunnel.
    ///
    /// Waits for the gateway's acknowledgement, retransmitting at the resend
    /// interval, for at most the response timeout. Sends are serialized by
    /// the sequence lock; concurrent callers queue.
    pub async fn send(&self, payload: CemiFrame) -> Result<(), TunnelError> {
        match time::timeout(
            self.conn.config.response_timeout,
            self.conn.request_tunnel(payload, &self.cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Receive the next cEMI frame tunneled from the gateway.
    ///
    /// Frames arrive in the gateway's sent order with duplicates suppressed.
    /// Returns `None` once the session has terminated.
    pub async fn recv(&mut self) -> Option<CemiFrame> {
        self.inbound.recv().await
    }

    /// The session's effective configuration, defaults substituted.
    pub fn config(&self) -> &TunnelConfig {
        &self.conn.config
    }

    /// Close the tunnel: best-effort DISCONNECT_REQUEST, then teardown.
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(err) = self.conn.request_disc().await {
            debug!("disconnect request not sent: {err}");
        }
        self.cancel.cancel();
    }
}

impl<T: Transport> Drop for Tunnel<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
