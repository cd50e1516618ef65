//! The simulator's TCP server.

use std::{
    collections::{HashSet, VecDeque},
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use cybase::packet::{
    codec::{
        decode_packet, encode_data_ack, encode_heartbeat_ack, encode_hello_ack, encode_info_ack,
        encode_status_ack, encode_status_broadcast,
    },
    Endpoint, MsgId, Packet, PacketType,
};
use cyinterface::StreamFramer;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::OwnedWriteHalf,
        TcpListener, TcpStream,
    },
    task::JoinHandle,
};

use crate::{
    chaos::{corrupt, ChaosConfig, ChaosDice},
    device::DeviceState,
    port::{PortAllocator, PortLease},
};

const READ_BUF_SIZE: usize = 16 * 1024;
/// Msg ids remembered per connection for retransmission detection.
const SEEN_MSG_IDS: usize = 128;

/// A listening simulated device.
///
/// The device state persists across connections, as a real bulb's does
/// across reconnects. Chaos applies to every response except the 0x28
/// handshake ack, so connection setup stays deterministic while the data
/// plane misbehaves.
pub struct DeviceSimulator {
    addr: SocketAddr,
    shared: Arc<SimShared>,
    accept_task: JoinHandle<()>,
    _lease: Option<PortLease>,
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct SimShared {
    state: Mutex<DeviceState>,
    chaos: Mutex<ChaosConfig>,
    respond_to_heartbeats: AtomicBool,
    connections: AtomicU64,
    writers: Mutex<Vec<SharedWriter>>,
}

impl DeviceSimulator {
    /// Start with inert chaos: every request promptly acked.
    pub async fn start() -> io::Result<Self> {
        Self::start_with(ChaosConfig::default()).await
    }

    pub async fn start_with(chaos: ChaosConfig) -> io::Result<Self> {
        let (lease, listener) = match PortAllocator::default().reserve_listener() {
            Ok((lease, listener)) => (Some(lease), TcpListener::from_std(listener)?),
            Err(error) => {
                tracing::debug!(%error, "port range busy, falling back to an OS-assigned port");
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                (None, listener)
            }
        };
        let addr = listener.local_addr()?;
        let shared = Arc::new(SimShared {
            state: Mutex::new(DeviceState::default()),
            chaos: Mutex::new(chaos),
            respond_to_heartbeats: AtomicBool::new(true),
            connections: AtomicU64::new(0),
            writers: Mutex::new(Vec::new()),
        });
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        tracing::debug!(%addr, "device simulator listening");
        Ok(Self {
            addr,
            shared,
            accept_task,
            _lease: lease,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Snapshot of the simulated device.
    pub fn state(&self) -> DeviceState {
        *self.shared.state.lock().unwrap()
    }

    /// Swap the chaos knobs at runtime; takes effect on the next response.
    pub fn set_chaos(&self, chaos: ChaosConfig) {
        *self.shared.chaos.lock().unwrap() = chaos;
    }

    /// Make the device go quiet on 0xD3 probes (or resume answering them),
    /// for driving heartbeat-timeout reconnects.
    pub fn respond_to_heartbeats(&self, respond: bool) {
        self.shared
            .respond_to_heartbeats
            .store(respond, Ordering::Relaxed);
    }

    /// How many connections the simulator has accepted.
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Push an unsolicited 0x83 status broadcast to every live connection,
    /// as a real bulb does when its state changes locally. Returns how many
    /// connections the frame was written to.
    pub async fn broadcast_status(
        &self,
        endpoint: &Endpoint,
        msg_id: MsgId,
        payload: &[u8],
    ) -> usize {
        let frame = encode_status_broadcast(endpoint, msg_id, payload);
        let writers: Vec<SharedWriter> = self.shared.writers.lock().unwrap().clone();
        let mut delivered = 0;
        for writer in writers {
            let mut writer = writer.lock().await;
            if writer.write_all(&frame).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Drop for DeviceSimulator {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<SimShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                shared.connections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%peer, "device simulator accepted a connection");
                tokio::spawn(serve(shared.clone(), stream));
            }
            Err(error) => {
                tracing::warn!(%error, "device simulator accept failed");
                return;
            }
        }
    }
}

/// Retransmission detection: a bounded set of recently seen msg ids.
struct SeenMsgIds {
    order: VecDeque<MsgId>,
    set: HashSet<MsgId>,
    capacity: usize,
}

impl SeenMsgIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true when `msg_id` is new.
    fn insert(&mut self, msg_id: MsgId) -> bool {
        if !self.set.insert(msg_id) {
            return false;
        }
        self.order.push_back(msg_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

async fn serve(shared: Arc<SimShared>, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    shared.writers.lock().unwrap().push(writer.clone());
    let mut framer = StreamFramer::new();
    let mut dice = ChaosDice::default();
    let mut seen = SeenMsgIds::new(SEEN_MSG_IDS);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                tracing::debug!("device simulator connection closed");
                shared
                    .writers
                    .lock()
                    .unwrap()
                    .retain(|other| !Arc::ptr_eq(other, &writer));
                return;
            }
            Ok(n) => n,
        };
        for frame in framer.feed(&buf[..n]) {
            let packet = match decode_packet(&frame) {
                Ok(packet) => packet,
                Err(error) => {
                    tracing::trace!(%error, "simulator ignoring undecodable bytes");
                    continue;
                }
            };
            let Some((response, chaos_eligible)) = shared.respond(&packet, &mut seen) else {
                continue;
            };

            if !chaos_eligible {
                let mut writer = writer.lock().await;
                _ = writer.write_all(&response).await;
                continue;
            }

            let (plan, corrupt_bytes) = {
                let chaos = shared.chaos.lock().unwrap();
                (dice.plan(&chaos), chaos.corrupt_bytes)
            };
            if plan.drop {
                tracing::debug!(packet_type = ?packet.packet_type(), "chaos dropped a response");
                continue;
            }
            let copies = if plan.duplicate { 2 } else { 1 };
            for _ in 0..copies {
                let writer = writer.clone();
                let mut bytes = response.to_vec();
                if plan.corrupt {
                    corrupt(&mut bytes, corrupt_bytes);
                }
                let delay = plan.delay;
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut writer = writer.lock().await;
                    _ = writer.write_all(&bytes).await;
                });
            }
        }
    }
}

impl SimShared {
    /// The protocol reflex: request type in, ack out. The bool marks the
    /// response chaos-eligible.
    fn respond(&self, packet: &Packet, seen: &mut SeenMsgIds) -> Option<(Bytes, bool)> {
        match packet.packet_type() {
            PacketType::Handshake => {
                let endpoint = packet.endpoint()?;
                Some((encode_hello_ack(endpoint), false))
            }
            PacketType::DeviceInfo => Some((encode_info_ack(packet.endpoint()?), true)),
            PacketType::Data => {
                let endpoint = packet.endpoint()?;
                let msg_id = packet.msg_id()?;
                if seen.insert(msg_id) {
                    let applied = self
                        .state
                        .lock()
                        .unwrap()
                        .apply_command(packet.payload()?);
                    if !applied {
                        tracing::debug!("simulator received an unknown command opcode");
                    }
                } else {
                    tracing::debug!(?msg_id, "retransmitted command, acking without reapplying");
                }
                Some((encode_data_ack(endpoint, msg_id), true))
            }
            PacketType::Status => {
                Some((encode_status_ack(packet.endpoint()?, packet.msg_id()?), true))
            }
            PacketType::Heartbeat => self
                .respond_to_heartbeats
                .load(Ordering::Relaxed)
                .then(|| (encode_heartbeat_ack(), true)),
            _ => None,
        }
    }
}
