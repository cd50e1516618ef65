//! The background packet router.
//!
//! One router per connected transport. It is the sole reader of the
//! connection: it feeds the framer, decodes, and routes by type. Acks
//! resolve pending sends, heartbeat acks clear the keepalive flag, and
//! everything else lands in the inbound queue `recv_reliable` drains.
//! A quiet heartbeat or a failed read makes the router hand the transport
//! to a reconnect task and exit; a cancelled router just logs and exits.

use std::sync::Arc;

use bytes::Bytes;
use cybase::packet::{codec::encode_heartbeat, PacketType};
use cyevent::{metrics::names, Direction};
use cyinterface::StreamFramer;
use cyrecovery::AckClass;
use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, sync::watch, time::Instant};

use crate::{
    error::CyncConnectionError,
    transport::{CyncTransport, READ_BUF_SIZE},
};

pub(crate) struct PacketRouter {
    transport: Arc<CyncTransport>,
    reader: OwnedReadHalf,
    framer: StreamFramer,
    cancel: watch::Receiver<bool>,
}

impl PacketRouter {
    pub(crate) fn new(
        transport: Arc<CyncTransport>,
        reader: OwnedReadHalf,
        framer: StreamFramer,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            reader,
            framer,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let timeouts = self.transport.config().timeouts;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + timeouts.heartbeat_interval(),
            timeouts.heartbeat_interval(),
        );
        // set while a heartbeat is unacknowledged
        let mut heartbeat_deadline: Option<Instant> = None;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let current_deadline = heartbeat_deadline;
            let awaiting_ack = async move {
                match current_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        tracing::debug!(device = %self.transport.device_id(),
                            "packet router cancelled");
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.send_heartbeat(&mut heartbeat_deadline).await {
                        return;
                    }
                }
                () = awaiting_ack => {
                    self.transport.metrics().incr_counter(
                        names::HEARTBEAT_TOTAL,
                        &[("device_id", self.transport.device_id()), ("outcome", "timeout")],
                        1,
                    );
                    tracing::warn!(device = %self.transport.device_id(),
                        "heartbeat unacknowledged, reconnecting");
                    self.trigger_reconnect("heartbeat_timeout");
                    return;
                }
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!(device = %self.transport.device_id(), "peer closed");
                        self.trigger_reconnect("connection_closed");
                        return;
                    }
                    Ok(n) => {
                        for frame in self.framer.feed(&buf[..n]) {
                            self.route(frame, &mut heartbeat_deadline).await;
                        }
                    }
                    Err(source) => {
                        let error = CyncConnectionError::ReadFailed {
                            device_id: self.transport.device_id().to_owned(),
                            source,
                        };
                        tracing::warn!(%error, "connection read failed");
                        self.trigger_reconnect(error.reason());
                        return;
                    }
                }
            }
        }
    }

    async fn send_heartbeat(&self, heartbeat_deadline: &mut Option<Instant>) -> bool {
        let timeouts = self.transport.config().timeouts;
        let frame = encode_heartbeat();
        if self
            .transport
            .write_frame(&frame, timeouts.send_io())
            .await
        {
            self.transport
                .observers()
                .notify_packet(Direction::Outbound, &frame, self.transport.device_id());
            self.transport.metrics().incr_counter(
                names::HEARTBEAT_TOTAL,
                &[("device_id", self.transport.device_id()), ("outcome", "sent")],
                1,
            );
            if heartbeat_deadline.is_none() {
                *heartbeat_deadline = Some(Instant::now() + timeouts.heartbeat_ack());
            }
            true
        } else {
            self.transport.metrics().incr_counter(
                names::HEARTBEAT_TOTAL,
                &[("device_id", self.transport.device_id()), ("outcome", "send_failed")],
                1,
            );
            self.trigger_reconnect("heartbeat_write_failed");
            false
        }
    }

    async fn route(&self, frame: Bytes, heartbeat_deadline: &mut Option<Instant>) {
        self.transport
            .observers()
            .notify_packet(Direction::Inbound, &frame, self.transport.device_id());
        let packet = match cybase::packet::codec::decode_packet(&frame) {
            Ok(packet) => packet,
            Err(error) => {
                // recoverable: count, drop, keep reading the stream
                self.transport
                    .count_decode_error(&error, frame.first().copied());
                return;
            }
        };

        match packet.packet_type() {
            PacketType::HeartbeatAck => {
                *heartbeat_deadline = None;
                self.transport.metrics().incr_counter(
                    names::HEARTBEAT_TOTAL,
                    &[("device_id", self.transport.device_id()), ("outcome", "acked")],
                    1,
                );
            }
            PacketType::DataAck => {
                self.transport
                    .resolve_ack(AckClass::Data, packet.msg_id(), "data");
            }
            PacketType::HandshakeAck => {
                self.transport
                    .resolve_ack(AckClass::Handshake, None, "handshake");
            }
            PacketType::StatusAck => {
                self.transport.resolve_ack(AckClass::Status, None, "status");
            }
            PacketType::InfoAck => {
                // we never send 0x43, so any 0x48 is stale by definition
                self.transport.metrics().incr_counter(
                    names::ACK_RECEIVED_TOTAL,
                    &[
                        ("device_id", self.transport.device_id()),
                        ("ack_type", "info"),
                        ("outcome", "stale"),
                    ],
                    1,
                );
            }
            PacketType::Data
            | PacketType::Status
            | PacketType::DeviceInfo
            | PacketType::Handshake
            | PacketType::Heartbeat => {
                _ = self.transport.enqueue_inbound(frame).await;
            }
        }
    }

    fn trigger_reconnect(&self, reason: &'static str) {
        let transport = self.transport.clone();
        let handle = tokio::spawn(transport.clone().reconnect(reason));
        transport.store_reconnect_task(handle);
    }
}
