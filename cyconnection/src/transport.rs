//! The reliable device transport.
//!
//! One [`CyncTransport`] owns one device's TCP session: it handshakes,
//! sends commands with at-least-once delivery, deduplicates receptions,
//! heartbeats through its packet router, and reconnects when the session
//! goes quiet.
//!
//! One mutex guards the connection state, the pending-ack journal and the
//! msg-id reverse map together, so a state check and a pending-table
//! mutation are a single critical section. Nothing performs network IO
//! while that lock is held; writes serialize on the writer's own async
//! lock, and reads belong to the router task alone. Lock hold times are
//! instrumented and anything past 10ms is flagged.

use std::{
    net::{Ipv4Addr, SocketAddr},
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use cybase::{
    msgid::MsgIdGenerator,
    packet::{
        codec::{
            self, encode_data_ack, encode_data_packet, encode_handshake, encode_heartbeat_ack,
            encode_hello_ack, encode_info_ack, encode_status_ack,
        },
        Endpoint, MsgId, Packet, PacketType, HEADER_SIZE,
    },
};
use cyevent::{
    events::{EventSink, NoopEventSink, TransportEvent},
    metrics::{names, NoopMetrics},
    Direction, MetricsSink, Observers,
};
use cyinterface::{queue::PutResult, BoundedQueue, StreamFramer};
use cyrecovery::{dedup_key, AckClass, ArcDedupCache, Backoff, PendingJournal};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::watch,
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    config::TransportConfig,
    error::{
        ConnectError, CyncConnectionError, DuplicatePacketError, HandshakeError,
        PacketReceiveError,
    },
    registry::RegistryGuard,
    router::PacketRouter,
    state::ConnectionState,
};

/// How long `shutdown` waits for each background task to observe its
/// cancellation before aborting it.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Read buffer for the handshake and the router.
pub(crate) const READ_BUF_SIZE: usize = 16 * 1024;

/// Outcome of one `send_reliable` call. Failure is a value, not an error:
/// `reason` is `not_connected`, `max_retries` or `packet_too_large`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub correlation_id: Uuid,
    pub reason: Option<&'static str>,
}

impl SendResult {
    fn ok(correlation_id: Uuid) -> Self {
        Self {
            success: true,
            correlation_id,
            reason: None,
        }
    }

    fn failed(correlation_id: Uuid, reason: &'static str) -> Self {
        Self {
            success: false,
            correlation_id,
            reason: Some(reason),
        }
    }
}

/// One non-duplicate reception, as handed to the application. Derefs to
/// its [`Packet`].
#[derive(Debug, Clone, derive_more::Deref)]
pub struct TrackedPacket {
    #[deref]
    pub packet: Packet,
    /// Fresh per reception event; never a dedup key.
    pub correlation_id: Uuid,
    pub recv_time: Instant,
    /// Content-deterministic; never a correlation id.
    pub dedup_key: String,
}

/// Where to find the device and how to authenticate.
///
/// Stored on the first `connect` and reused verbatim by every reconnect;
/// initialized to the empty value of each field, never nullable.
#[derive(Debug, Clone)]
struct Credentials {
    addr: SocketAddr,
    endpoint: Endpoint,
    auth_code: Bytes,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            endpoint: Endpoint::default(),
            auth_code: Bytes::new(),
        }
    }
}

/// Everything the state lock guards.
struct Shared {
    state: ConnectionState,
    journal: PendingJournal,
}

/// Background tasks owned by the transport; cancelled and joined on
/// shutdown and reconnect, never detached.
#[derive(Default)]
struct Tasks {
    cancel: Option<watch::Sender<bool>>,
    router: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

/// The state lock, instrumented. Holding it past 10ms is a warning, past
/// 100ms a deadlock-risk critical event.
struct SharedGuard<'a> {
    guard: MutexGuard<'a, Shared>,
    acquired: std::time::Instant,
    metrics: &'a Arc<dyn MetricsSink>,
}

impl Deref for SharedGuard<'_> {
    type Target = Shared;
    fn deref(&self) -> &Shared {
        &self.guard
    }
}

impl DerefMut for SharedGuard<'_> {
    fn deref_mut(&mut self) -> &mut Shared {
        &mut self.guard
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        self.metrics
            .observe_histogram(names::STATE_LOCK_HOLD_SECONDS, &[], held.as_secs_f64());
        if held > Duration::from_millis(100) {
            tracing::error!(?held, "state lock held dangerously long, deadlock risk");
        } else if held > Duration::from_millis(10) {
            tracing::warn!(?held, "state lock held longer than expected");
        }
    }
}

/// A reliable transport to one Cync device.
pub struct CyncTransport {
    device_id: String,
    /// Distinguishes this instance in the process-wide registry.
    instance: Uuid,
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    observers: Observers,
    msg_ids: MsgIdGenerator,
    backoff: Backoff,
    shared: Mutex<Shared>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inbound: BoundedQueue<Bytes>,
    dedup: ArcDedupCache,
    tasks: Mutex<Tasks>,
    registry_guard: Mutex<Option<RegistryGuard>>,
    credentials: Mutex<Credentials>,
}

impl CyncTransport {
    /// A transport with no telemetry wired, for tests and simple callers.
    pub fn new(device_id: impl Into<String>, config: TransportConfig) -> Arc<Self> {
        Self::with_telemetry(
            device_id,
            config,
            Arc::new(NoopMetrics),
            Arc::new(NoopEventSink),
            Observers::default(),
        )
    }

    pub fn with_telemetry(
        device_id: impl Into<String>,
        config: TransportConfig,
        metrics: Arc<dyn MetricsSink>,
        events: Arc<dyn EventSink>,
        observers: Observers,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let backoff = Backoff::from_config(&config.timeouts);
        let inbound = BoundedQueue::with_metrics(
            device_id.clone(),
            "inbound",
            config.queue_capacity,
            config.queue_policy,
            metrics.clone(),
        );
        let dedup =
            ArcDedupCache::with_metrics(config.dedup_max_size, config.dedup_ttl, metrics.clone());
        Arc::new(Self {
            device_id,
            instance: Uuid::now_v7(),
            config,
            metrics,
            events,
            observers,
            msg_ids: MsgIdGenerator::new(),
            backoff,
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                journal: PendingJournal::new(),
            }),
            writer: tokio::sync::Mutex::new(None),
            inbound,
            dedup,
            tasks: Mutex::new(Tasks::default()),
            registry_guard: Mutex::new(None),
            credentials: Mutex::new(Credentials::default()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_shared().state
    }

    /// Packets decoded and waiting in the inbound queue.
    pub fn inbound_len(&self) -> usize {
        self.inbound.qsize()
    }

    pub fn dedup_cache_len(&self) -> usize {
        self.dedup.len()
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }

    fn lock_shared(&self) -> SharedGuard<'_> {
        SharedGuard {
            guard: self.shared.lock().unwrap(),
            acquired: std::time::Instant::now(),
            metrics: &self.metrics,
        }
    }

    fn device_labels<'a>(&'a self) -> [(&'static str, &'a str); 1] {
        [("device_id", &self.device_id)]
    }

    fn transition(&self, shared: &mut Shared, to: ConnectionState) {
        let from = shared.state;
        if from == to {
            return;
        }
        shared.state = to;
        tracing::info!(device = %self.device_id, %from, %to, "connection state changed");
        for state in ConnectionState::ALL {
            self.metrics.set_gauge(
                names::CONNECTION_STATE,
                &[("device_id", &self.device_id), ("state", state.as_str())],
                u8::from(state == to).into(),
            );
        }
        self.events.emit(&TransportEvent::ConnectionStateChanged {
            device_id: self.device_id.clone(),
            from: from.as_str(),
            to: to.as_str(),
        });
    }

    /// Open the session: dial, handshake (0x23 out, 0x28 back), then start
    /// the packet router. Retries with backoff up to the configured attempt
    /// budget. The handshake uses raw reads and writes on the fresh socket,
    /// not `send_reliable`, which itself requires a connected transport.
    pub async fn connect(
        self: &Arc<Self>,
        addr: SocketAddr,
        endpoint: Endpoint,
        auth_code: &[u8],
    ) -> Result<(), ConnectError> {
        {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Disconnected {
                return Err(CyncConnectionError::ParallelConnection {
                    device_id: self.device_id.clone(),
                }
                .into());
            }
            self.transition(&mut shared, ConnectionState::Connecting);
        }

        let guard = match RegistryGuard::claim(&self.device_id, self.instance) {
            Ok(guard) => guard,
            Err(error) => {
                let mut shared = self.lock_shared();
                self.transition(&mut shared, ConnectionState::Disconnected);
                return Err(error.into());
            }
        };
        *self.registry_guard.lock().unwrap() = Some(guard);
        *self.credentials.lock().unwrap() = Credentials {
            addr,
            endpoint,
            auth_code: Bytes::copy_from_slice(auth_code),
        };
        self.inbound.reopen();

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(error) => {
                *self.registry_guard.lock().unwrap() = None;
                let mut shared = self.lock_shared();
                self.transition(&mut shared, ConnectionState::Disconnected);
                Err(error.into())
            }
        }
    }

    /// Dial and handshake with the stored credentials, then install the
    /// session. Shared by `connect` and `reconnect`.
    async fn establish(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let credentials = self.credentials.lock().unwrap().clone();
        let mut last_failure = String::from("no attempt made");

        for attempt in 0..self.config.connect_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            match self.try_handshake(&credentials).await {
                Ok((read_half, write_half, framer)) => {
                    self.metrics.incr_counter(
                        names::HANDSHAKE_TOTAL,
                        &[("device_id", &self.device_id), ("outcome", "success")],
                        1,
                    );
                    *self.writer.lock().await = Some(write_half);
                    let shut_down_meanwhile = {
                        let mut shared = self.lock_shared();
                        if shared.state == ConnectionState::Disconnected {
                            true
                        } else {
                            self.transition(&mut shared, ConnectionState::Connected);
                            false
                        }
                    };
                    if shut_down_meanwhile {
                        *self.writer.lock().await = None;
                        return Err(HandshakeError {
                            device_id: self.device_id.clone(),
                            reason: "transport shut down during handshake".into(),
                            attempts: attempt + 1,
                        });
                    }
                    self.spawn_tasks(read_half, framer);
                    self.observers.notify_established(&self.device_id);
                    self.events.emit(&TransportEvent::HandshakeCompleted {
                        device_id: self.device_id.clone(),
                        endpoint: credentials.endpoint.to_vec(),
                    });
                    return Ok(());
                }
                Err(reason) => {
                    self.metrics.incr_counter(
                        names::HANDSHAKE_TOTAL,
                        &[("device_id", &self.device_id), ("outcome", "failure")],
                        1,
                    );
                    tracing::warn!(
                        device = %self.device_id,
                        attempt,
                        %reason,
                        "handshake attempt failed",
                    );
                    last_failure = reason;
                }
            }
        }

        Err(HandshakeError {
            device_id: self.device_id.clone(),
            reason: last_failure,
            attempts: self.config.connect_attempts.max(1),
        })
    }

    /// One dial-plus-handshake attempt. On success the framer keeps any
    /// bytes the device sent past the 0x28, so the router starts exactly
    /// where the handshake stopped reading.
    async fn try_handshake(
        &self,
        credentials: &Credentials,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, StreamFramer), String> {
        let stream = TcpStream::connect(credentials.addr)
            .await
            .map_err(|error| format!("dial {} failed: {error}", credentials.addr))?;
        let (mut read_half, mut write_half) = stream.into_split();
        let hello = encode_handshake(&credentials.endpoint, &credentials.auth_code);

        let exchange = async {
            write_half
                .write_all(&hello)
                .await
                .map_err(|error| format!("hello write failed: {error}"))?;
            self.observers
                .notify_packet(Direction::Outbound, &hello, &self.device_id);

            let mut framer = StreamFramer::with_metrics(self.metrics.clone());
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = read_half
                    .read(&mut buf)
                    .await
                    .map_err(|error| format!("read during handshake failed: {error}"))?;
                if n == 0 {
                    return Err(String::from("peer closed during handshake"));
                }
                let mut acked = false;
                for frame in framer.feed(&buf[..n]) {
                    self.observers
                        .notify_packet(Direction::Inbound, &frame, &self.device_id);
                    match codec::decode_packet(&frame) {
                        Ok(packet) if packet.packet_type() == PacketType::HandshakeAck => {
                            acked = true;
                        }
                        Ok(_) => {
                            // device spoke before our hello was acked; keep
                            // the packet for the application
                            _ = self.inbound.try_put(frame);
                        }
                        Err(error) => self.count_decode_error(&error, frame.first().copied()),
                    }
                }
                if acked {
                    return Ok(framer);
                }
            }
        };

        match tokio::time::timeout(self.config.timeouts.handshake(), exchange).await {
            Ok(Ok(framer)) => Ok((read_half, write_half, framer)),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!(
                "no handshake ack within {:?}",
                self.config.timeouts.handshake()
            )),
        }
    }

    fn spawn_tasks(self: &Arc<Self>, read_half: OwnedReadHalf, framer: StreamFramer) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let router = PacketRouter::new(self.clone(), read_half, framer, cancel_rx.clone());
        let sweeper = Self::run_sweeper(self.clone(), cancel_rx);
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.cancel = Some(cancel_tx);
            tasks.router = Some(tokio::spawn(router.run()));
            tasks.sweeper = Some(tokio::spawn(sweeper));
        }
        // a shutdown racing the tail of the handshake has already swept the
        // task slots; a task stored after that must not outlive it
        if self.lock_shared().state == ConnectionState::Disconnected {
            if let Some(cancel) = self.tasks.lock().unwrap().cancel.take() {
                _ = cancel.send(true);
            }
        }
    }

    pub(crate) fn store_reconnect_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().reconnect = Some(handle);
    }

    /// Tear the session down and dial again with the stored credentials.
    /// Runs as its own task, spawned by the router on heartbeat timeouts
    /// and read failures.
    pub(crate) async fn reconnect(self: Arc<Self>, reason: &'static str) {
        {
            let mut shared = self.lock_shared();
            if shared.state != ConnectionState::Connected {
                tracing::debug!(device = %self.device_id, reason, state = %shared.state,
                    "reconnect skipped");
                return;
            }
            self.transition(&mut shared, ConnectionState::Reconnecting);
            let cancelled = shared.journal.clear();
            if cancelled > 0 {
                tracing::debug!(device = %self.device_id, cancelled, "in-flight sends cancelled");
            }
        }
        self.metrics.incr_counter(
            names::RECONNECTION_TOTAL,
            &[("device_id", &self.device_id), ("reason", reason)],
            1,
        );
        self.events.emit(&TransportEvent::ReconnectTriggered {
            device_id: self.device_id.clone(),
            reason: reason.to_owned(),
        });

        self.stop_tasks(false).await;
        *self.writer.lock().await = None;

        match self.establish().await {
            Ok(()) => {
                tracing::info!(device = %self.device_id, reason, "reconnected");
            }
            Err(error) => {
                tracing::warn!(device = %self.device_id, %error, "reconnect abandoned");
                {
                    let mut shared = self.lock_shared();
                    self.transition(&mut shared, ConnectionState::Disconnected);
                }
                *self.registry_guard.lock().unwrap() = None;
                self.observers.notify_closed(&self.device_id);
            }
        }
    }

    /// Stop the session for good. Idempotent; joins every background task
    /// with a bounded timeout and releases the device's registry slot.
    pub async fn shutdown(&self) {
        let was_disconnected = {
            let mut shared = self.lock_shared();
            let was = shared.state == ConnectionState::Disconnected;
            self.transition(&mut shared, ConnectionState::Disconnected);
            shared.journal.clear();
            was
        };
        self.stop_tasks(true).await;
        *self.writer.lock().await = None;
        self.inbound.close();
        *self.registry_guard.lock().unwrap() = None;
        if !was_disconnected {
            self.observers.notify_closed(&self.device_id);
            tracing::info!(device = %self.device_id, "transport shut down");
        }
    }

    async fn stop_tasks(&self, include_reconnect: bool) {
        let (cancel, router, sweeper, reconnect) = {
            let mut tasks = self.tasks.lock().unwrap();
            (
                tasks.cancel.take(),
                tasks.router.take(),
                tasks.sweeper.take(),
                include_reconnect.then(|| tasks.reconnect.take()).flatten(),
            )
        };
        if let Some(cancel) = cancel {
            _ = cancel.send(true);
        }
        let named = [
            ("router", router),
            ("sweeper", sweeper),
            ("reconnect", reconnect),
        ];
        for (name, handle) in named {
            let Some(mut handle) = handle else { continue };
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(task = name, "task ignored cancellation for 5s, aborting");
                handle.abort();
            }
        }
    }

    /// Send `payload` as a 0x73 data command with the configured retry
    /// budget and ack deadline.
    pub async fn send_reliable(&self, payload: &[u8]) -> SendResult {
        self.send_reliable_with(
            payload,
            None,
            self.config.timeouts.ack_wait(),
            self.config.max_retries,
        )
        .await
    }

    /// As [`send_reliable`](Self::send_reliable), with everything
    /// overridable: a fixed msg id instead of the sequential one, a
    /// literal ack deadline, a different attempt budget.
    pub async fn send_reliable_with(
        &self,
        payload: &[u8],
        msg_id: Option<MsgId>,
        timeout: Duration,
        max_retries: u32,
    ) -> SendResult {
        if payload.len() > codec::MAX_DATA_PAYLOAD {
            let error = cyinterface::PacketFramingError::PacketTooLarge {
                size: payload.len(),
            };
            tracing::warn!(device = %self.device_id, %error, "refusing oversized send");
            let correlation_id = Uuid::now_v7();
            self.abandon(correlation_id, error.reason());
            return SendResult::failed(correlation_id, error.reason());
        }
        let msg_id = msg_id.unwrap_or_else(|| self.msg_ids.next_id());
        let endpoint = self.credentials.lock().unwrap().endpoint;
        let mut correlation_id = Uuid::now_v7();

        for attempt in 0..max_retries.max(1) {
            if attempt > 0 {
                let attempt_number = attempt.to_string();
                self.metrics.incr_counter(
                    names::RETRY_ATTEMPTS_TOTAL,
                    &[
                        ("device_id", &self.device_id),
                        ("attempt_number", &attempt_number),
                    ],
                    1,
                );
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                correlation_id = Uuid::now_v7();
            }

            // State check, pending-table insert and encode share one
            // critical section; the write below happens outside it.
            let (signal, frame) = {
                let mut shared = self.lock_shared();
                if shared.state != ConnectionState::Connected {
                    return SendResult::failed(correlation_id, "not_connected");
                }
                let signal = shared
                    .journal
                    .insert(AckClass::Data, msg_id, correlation_id, attempt);
                let frame = encode_data_packet(&endpoint, msg_id, payload);
                (signal, frame)
            };

            let sent_at = Instant::now();
            if !self.write_frame(&frame, self.config.timeouts.send_io()).await {
                self.metrics.incr_counter(
                    names::PACKET_SENT_TOTAL,
                    &[("device_id", &self.device_id), ("outcome", "write_failed")],
                    1,
                );
                self.lock_shared().journal.remove(&correlation_id);
                continue;
            }
            self.observers
                .notify_packet(Direction::Outbound, &frame, &self.device_id);
            self.metrics.incr_counter(
                names::PACKET_SENT_TOTAL,
                &[("device_id", &self.device_id), ("outcome", "success")],
                1,
            );
            self.events.emit(&TransportEvent::PacketSent {
                device_id: self.device_id.clone(),
                correlation_id: correlation_id.to_string(),
                packet_type: PacketType::Data as u8,
                msg_id: msg_id.to_vec(),
                attempt,
            });

            match tokio::time::timeout(timeout, signal).await {
                Ok(Ok(())) => {
                    self.metrics.observe_histogram(
                        names::PACKET_LATENCY_SECONDS,
                        &self.device_labels(),
                        sent_at.elapsed().as_secs_f64(),
                    );
                    return SendResult::ok(correlation_id);
                }
                Ok(Err(_)) => {
                    // notifier dropped: the sweep or a disconnect cancelled
                    // us; the state check on the next attempt settles it
                    tracing::debug!(device = %self.device_id, %correlation_id,
                        "pending send cancelled");
                    continue;
                }
                Err(_) => {
                    let timeout_err = crate::error::AckTimeoutError {
                        msg_id,
                        timeout,
                        retries: attempt,
                    };
                    tracing::debug!(device = %self.device_id, %timeout_err, "ack wait timed out");
                    self.metrics.incr_counter(
                        names::ACK_TIMEOUT_TOTAL,
                        &self.device_labels(),
                        1,
                    );
                    self.metrics.incr_counter(
                        names::PACKET_RETRANSMIT_TOTAL,
                        &[("device_id", &self.device_id), ("reason", "ack_timeout")],
                        1,
                    );
                    self.lock_shared().journal.remove(&correlation_id);
                    continue;
                }
            }
        }

        self.abandon(correlation_id, "max_retries");
        SendResult::failed(correlation_id, "max_retries")
    }

    fn abandon(&self, correlation_id: Uuid, reason: &'static str) {
        self.metrics.incr_counter(
            names::MESSAGE_ABANDONED_TOTAL,
            &[("device_id", &self.device_id), ("reason", reason)],
            1,
        );
        self.events.emit(&TransportEvent::MessageAbandoned {
            device_id: self.device_id.clone(),
            correlation_id: correlation_id.to_string(),
            reason,
        });
        tracing::warn!(device = %self.device_id, %correlation_id, reason, "message abandoned");
    }

    /// The next packet the device sent that is not a duplicate. Duplicates
    /// are re-acked (the peer may be retrying because our ack was lost) and
    /// surfaced as [`DuplicatePacketError`] so callers can tell them from
    /// novel traffic.
    pub async fn recv_reliable(&self) -> Result<TrackedPacket, PacketReceiveError> {
        // a transport that never connected would otherwise wait forever
        if !self.inbound.is_closed()
            && self.inbound.qsize() == 0
            && self.state() == ConnectionState::Disconnected
            && self.registry_guard.lock().unwrap().is_none()
        {
            return Err(CyncConnectionError::NotConnected {
                device_id: self.device_id.clone(),
            }
            .into());
        }
        let frame = self
            .inbound
            .recv()
            .await
            .map_err(|_| PacketReceiveError::Closed)?;
        let packet = match codec::decode_packet(&frame) {
            Ok(packet) => packet,
            Err(error) => {
                self.count_decode_error(&error, frame.first().copied());
                return Err(error.into());
            }
        };

        let key = self.fingerprint(&packet);
        if self.dedup.contains(&key) {
            self.send_ack(&packet).await;
            self.metrics
                .incr_counter(names::IDEMPOTENT_DROP_TOTAL, &self.device_labels(), 1);
            self.metrics.incr_counter(
                names::PACKET_RECV_TOTAL,
                &[("device_id", &self.device_id), ("outcome", "duplicate")],
                1,
            );
            let correlation_id = self
                .dedup
                .entry(&key)
                .map(|entry| entry.correlation_id)
                .unwrap_or_default();
            return Err(DuplicatePacketError {
                dedup_key: key,
                correlation_id,
            }
            .into());
        }

        let correlation_id = Uuid::now_v7();
        self.dedup.add(key.clone(), correlation_id);
        self.send_ack(&packet).await;
        self.metrics.incr_counter(
            names::PACKET_RECV_TOTAL,
            &[("device_id", &self.device_id), ("outcome", "accepted")],
            1,
        );
        self.events.emit(&TransportEvent::PacketReceived {
            device_id: self.device_id.clone(),
            correlation_id: correlation_id.to_string(),
            packet_type: packet.packet_type() as u8,
            dedup_key: key.clone(),
        });
        Ok(TrackedPacket {
            packet,
            correlation_id,
            recv_time: Instant::now(),
            dedup_key: key,
        })
    }

    /// The Full Fingerprint of a reception: type, endpoint, msg id and a
    /// truncated payload digest. Unframed types hash their body bytes.
    fn fingerprint(&self, packet: &Packet) -> String {
        let endpoint = packet
            .endpoint()
            .map(|endpoint| endpoint.as_slice())
            .unwrap_or(&[]);
        let msg_id = packet.msg_id().unwrap_or_default();
        let raw = packet.raw();
        let content: &[u8] = match packet.payload() {
            Some(payload) => payload,
            None => &raw[HEADER_SIZE.min(raw.len())..],
        };
        dedup_key(packet.packet_type() as u8, endpoint, &msg_id, content)
    }

    pub(crate) async fn send_ack(&self, packet: &Packet) {
        let Some(ack) = Self::ack_for(packet) else {
            return;
        };
        if self.write_frame(&ack, self.config.timeouts.send_io()).await {
            self.observers
                .notify_packet(Direction::Outbound, &ack, &self.device_id);
            self.metrics.incr_counter(
                names::PACKET_SENT_TOTAL,
                &[("device_id", &self.device_id), ("outcome", "ack")],
                1,
            );
        } else {
            tracing::warn!(device = %self.device_id, packet_type = ?packet.packet_type(),
                "failed to send ack");
            self.metrics.incr_counter(
                names::PACKET_SENT_TOTAL,
                &[("device_id", &self.device_id), ("outcome", "ack_failed")],
                1,
            );
        }
    }

    fn ack_for(packet: &Packet) -> Option<Bytes> {
        let endpoint = packet.endpoint().copied().unwrap_or_default();
        let msg_id = packet.msg_id().unwrap_or_default();
        match packet.packet_type() {
            PacketType::Data => Some(encode_data_ack(&endpoint, msg_id)),
            PacketType::Status => Some(encode_status_ack(&endpoint, msg_id)),
            PacketType::DeviceInfo => Some(encode_info_ack(&endpoint)),
            PacketType::Handshake => Some(encode_hello_ack(&endpoint)),
            PacketType::Heartbeat => Some(encode_heartbeat_ack()),
            _ => None,
        }
    }

    /// Write one frame with the network deadline. Never called with the
    /// state lock held.
    pub(crate) async fn write_frame(&self, frame: &[u8], deadline: Duration) -> bool {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return false;
        };
        match tokio::time::timeout(deadline, stream.write_all(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::warn!(device = %self.device_id, %error, "write failed");
                false
            }
            Err(_) => {
                tracing::warn!(device = %self.device_id, ?deadline, "write timed out");
                false
            }
        }
    }

    /// Resolve a received ack against the pending journal: 0x7B by msg id,
    /// the id-less classes FIFO. Stale acks are counted and ignored.
    pub(crate) fn resolve_ack(
        &self,
        class: AckClass,
        msg_id: Option<MsgId>,
        ack_type: &'static str,
    ) {
        let resolved = {
            let mut shared = self.lock_shared();
            match msg_id {
                Some(msg_id) => shared.journal.resolve_msg_id(msg_id),
                None => shared.journal.resolve_fifo(class),
            }
        };
        let outcome = if resolved.is_some() { "matched" } else { "stale" };
        self.metrics.incr_counter(
            names::ACK_RECEIVED_TOTAL,
            &[
                ("device_id", &self.device_id),
                ("ack_type", ack_type),
                ("outcome", outcome),
            ],
            1,
        );
        if resolved.is_none() {
            tracing::debug!(device = %self.device_id, ack_type, "stale ack ignored");
        }
    }

    pub(crate) async fn enqueue_inbound(&self, frame: Bytes) -> PutResult {
        let result = self
            .inbound
            .put(frame, self.config.queue_put_timeout)
            .await;
        let outcome = match (result.success, result.dropped) {
            (true, false) => "queued",
            (true, true) => "queued_evicting",
            (false, _) => "queue_full",
        };
        self.metrics.incr_counter(
            names::PACKET_RECV_TOTAL,
            &[("device_id", &self.device_id), ("outcome", outcome)],
            1,
        );
        if !result.success {
            tracing::warn!(device = %self.device_id, reason = ?result.reason,
                "inbound packet not enqueued");
        }
        result
    }

    pub(crate) fn count_decode_error(
        &self,
        error: &cybase::PacketDecodeError,
        first_byte: Option<u8>,
    ) {
        let packet_type = first_byte
            .map(|byte| format!("{byte:#04x}"))
            .unwrap_or_else(|| String::from("none"));
        self.metrics.incr_counter(
            names::DECODE_ERRORS_TOTAL,
            &[("reason", error.reason()), ("packet_type", &packet_type)],
            1,
        );
        tracing::debug!(device = %self.device_id, %error, "dropping undecodable packet");
    }

    /// The pending-table safety net: reaps entries no per-attempt timeout
    /// cleaned up, and expires old dedup entries, once per sweep interval.
    async fn run_sweeper(transport: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let period = transport.config.timeouts.cleanup_sweep();
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::debug!(device = %transport.device_id, "sweeper cancelled");
                        return;
                    }
                }
                _ = tokio::time::sleep(period) => {
                    let reaped = transport.lock_shared().journal.sweep_older_than(period);
                    for (correlation_id, retries) in reaped {
                        tracing::warn!(device = %transport.device_id, %correlation_id, retries,
                            "pending send reaped by cleanup sweep");
                        transport.abandon(correlation_id, "cleanup_sweep");
                    }
                    let expired = transport.dedup.cleanup_expired();
                    if expired > 0 {
                        tracing::debug!(device = %transport.device_id, expired,
                            "dedup entries expired");
                    }
                }
            }
        }
    }
}

impl Drop for CyncTransport {
    fn drop(&mut self) {
        // Tasks hold an Arc to the transport, so by the time this runs they
        // are gone; this only covers a transport dropped before connect or
        // after shutdown.
        if let Some(cancel) = self.tasks.lock().unwrap().cancel.take() {
            _ = cancel.send(true);
        }
    }
}
