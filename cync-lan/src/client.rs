use std::{net::SocketAddr, sync::Arc, time::Duration};

use cybase::{packet::Endpoint, TimeoutConfig};
use cyconnection::{config::TransportConfig, error::ConnectError, CyncTransport, SendResult};
use cyevent::{
    events::{EventSink, NoopEventSink},
    metrics::NoopMetrics,
    MetricsSink, Observers, PacketObserver,
};

/// Send the same command to a group of devices, one `send_reliable` per
/// transport, all in flight concurrently. There is no send queue anywhere:
/// each transport's pending-ack table is the only queuing surface, and
/// this returns one result per transport, in input order.
pub async fn send_group(transports: &[Arc<CyncTransport>], payload: &[u8]) -> Vec<SendResult> {
    futures::future::join_all(
        transports
            .iter()
            .map(|transport| transport.send_reliable(payload)),
    )
    .await
}

/// Assembles reliable transports for a fleet of Cync devices.
///
/// One client holds the shared configuration and telemetry wiring; each
/// [`CyncClient::connect`] produces one connected [`CyncTransport`], and the
/// process-wide registry keeps a device from getting two.
///
/// ## Creating clients
///
/// Use [`CyncClient::builder`] to configure telemetry sinks, passive packet
/// observers, and the timeout calibration before building.
///
/// ## Calibration
///
/// All deadlines derive from one measured input, the fleet's p99 ack
/// round-trip; see [`TimeoutConfig`]. Pass it through
/// [`CyncClientBuilder::with_p99_ack_latency`] rather than scattering
/// literal timeouts.
pub struct CyncClient {
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    observers: Vec<Arc<dyn PacketObserver>>,
}

impl CyncClient {
    pub fn builder() -> CyncClientBuilder {
        CyncClientBuilder {
            config: TransportConfig::default(),
            metrics: Arc::new(NoopMetrics),
            events: Arc::new(NoopEventSink),
            observers: Vec::new(),
        }
    }

    /// Connect a transport to the device at `addr`, identifying as
    /// `endpoint` with `auth_code`.
    ///
    /// Fails with `parallel_connection` when the device already has a live
    /// transport in this process.
    pub async fn connect(
        &self,
        device_id: impl Into<String>,
        addr: SocketAddr,
        endpoint: Endpoint,
        auth_code: &[u8],
    ) -> Result<Arc<CyncTransport>, ConnectError> {
        let transport = CyncTransport::with_telemetry(
            device_id,
            self.config.clone(),
            self.metrics.clone(),
            self.events.clone(),
            Observers::new(self.observers.clone()),
        );
        tracing::debug!(device = %transport.device_id(), %addr, "connecting device transport");
        transport.connect(addr, endpoint, auth_code).await?;
        Ok(transport)
    }
}

/// A builder for [`CyncClient`].
pub struct CyncClientBuilder {
    config: TransportConfig,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    observers: Vec<Arc<dyn PacketObserver>>,
}

impl CyncClientBuilder {
    /// Derive every transport deadline from the measured p99 ack latency.
    pub fn with_p99_ack_latency(mut self, p99: Duration) -> Self {
        self.config = TransportConfig::from_timeouts(TimeoutConfig::from_p99_ack_latency(p99));
        self
    }

    /// Use a fully specified transport configuration instead.
    ///
    /// If you call this after [`Self::with_p99_ack_latency`], only the last
    /// call takes effect.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Where counters, gauges and histograms go.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Where structured transport events go.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Register a passive observer of raw traffic and connection lifecycle.
    /// Observers may be registered multiple times; each transport notifies
    /// all of them, and an observer panic never reaches the transport.
    pub fn with_observer(mut self, observer: Arc<dyn PacketObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> CyncClient {
        CyncClient {
            config: self.config,
            metrics: self.metrics,
            events: self.events,
            observers: self.observers,
        }
    }
}
