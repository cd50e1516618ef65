//! End-to-end tests of the reliable transport against the device simulator.

use std::{collections::HashSet, sync::Arc, time::Duration};

use cybase::{packet::Endpoint, packet::PacketType, TimeoutConfig};
use cyconnection::{
    config::TransportConfig,
    error::{ConnectError, CyncConnectionError, PacketReceiveError},
    state::ConnectionState,
    transport::CyncTransport,
};
use cyevent::metrics::{names, MemoryMetrics};
use cysim::{ChaosConfig, DeviceSimulator};
use tokio::time::Instant;

const ENDPOINT: Endpoint = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5];
const AUTH: &[u8] = b"test-auth-code";
const TOGGLE_ON: [u8; 3] = [0x0D, 0x01, 0x00];

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn fast_config() -> TransportConfig {
    let timeouts = TimeoutConfig::from_p99_ack_latency(Duration::from_millis(40))
        .with_ack_wait(Duration::from_millis(200))
        .with_handshake(Duration::from_millis(500))
        .with_heartbeat(Duration::from_secs(120), Duration::from_secs(10))
        .with_cleanup_sweep(Duration::from_secs(5))
        .with_backoff(
            Duration::from_millis(40),
            Duration::from_millis(160),
            Duration::from_millis(10),
        );
    let mut config = TransportConfig::from_timeouts(timeouts);
    config.max_retries = 4;
    config.connect_attempts = 3;
    config
}

async fn connect(
    device_id: &str,
    sim: &DeviceSimulator,
    config: TransportConfig,
    metrics: Arc<MemoryMetrics>,
) -> Arc<CyncTransport> {
    let transport = CyncTransport::with_telemetry(
        device_id,
        config,
        metrics,
        Arc::new(cyevent::NoopEventSink),
        cyevent::Observers::default(),
    );
    transport
        .connect(sim.addr(), ENDPOINT, AUTH)
        .await
        .expect("connect must succeed");
    transport
}

async fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + deadline;
    while Instant::now() < give_up {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe()
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_toggle() {
    init_tracing();
    let sim = DeviceSimulator::start().await.unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let transport = connect("dev-happy", &sim, fast_config(), metrics.clone()).await;
    assert_eq!(transport.state(), ConnectionState::Connected);

    let started = Instant::now();
    let result = transport
        .send_reliable_with(&TOGGLE_ON, Some([0x00, 0x01]), Duration::from_millis(800), 3)
        .await;
    assert!(result.success, "toggle must be acked: {result:?}");
    assert!(started.elapsed() < Duration::from_millis(800));

    let state = sim.state();
    assert!(state.on);
    assert_eq!(state.toggle_count, 1);

    assert_eq!(
        metrics.counter(
            names::PACKET_SENT_TOTAL,
            &[("device_id", "dev-happy"), ("outcome", "success")],
        ),
        1
    );
    assert_eq!(
        metrics.histogram_count(names::PACKET_LATENCY_SECONDS, &[("device_id", "dev-happy")]),
        1
    );

    transport.shutdown().await;
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicated_ack_is_idempotent() {
    let chaos = ChaosConfig::builder().duplicate_rate(1.0).build().unwrap();
    let sim = DeviceSimulator::start_with(chaos).await.unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let transport = connect("dev-dup-ack", &sim, fast_config(), metrics.clone()).await;

    let result = transport.send_reliable(&TOGGLE_ON).await;
    assert!(result.success);
    assert_eq!(sim.state().toggle_count, 1);

    // the duplicated 0x7B matched nothing and was counted as stale
    let stale = move || {
        metrics.counter(
            names::ACK_RECEIVED_TOTAL,
            &[
                ("device_id", "dev-dup-ack"),
                ("ack_type", "data"),
                ("outcome", "stale"),
            ],
        ) == 1
    };
    assert!(wait_until(Duration::from_secs(2), stale).await);

    transport.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_status_broadcast_is_deduplicated() {
    let sim = DeviceSimulator::start().await.unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let transport = connect("dev-dedup", &sim, fast_config(), metrics.clone()).await;

    assert_eq!(sim.broadcast_status(&ENDPOINT, [9, 9], &[0x01, 0x02]).await, 1);
    let first = transport.recv_reliable().await.unwrap();
    assert_eq!(first.packet.packet_type(), PacketType::Status);
    assert_eq!(first.packet.payload().unwrap().as_ref(), [0x01, 0x02]);

    // the same logical packet again: re-acked, surfaced as a duplicate
    sim.broadcast_status(&ENDPOINT, [9, 9], &[0x01, 0x02]).await;
    match transport.recv_reliable().await {
        Err(PacketReceiveError::Duplicate(duplicate)) => {
            assert_eq!(duplicate.dedup_key, first.dedup_key);
            assert_eq!(duplicate.correlation_id, first.correlation_id);
        }
        other => panic!("expected a duplicate, got {other:?}"),
    }

    assert_eq!(transport.dedup_cache_len(), 1);
    assert_eq!(
        metrics.counter(names::IDEMPOTENT_DROP_TOTAL, &[("device_id", "dev-dedup")]),
        1
    );

    // a different payload under the same msg id is novel traffic
    sim.broadcast_status(&ENDPOINT, [9, 9], &[0x03]).await;
    let third = transport.recv_reliable().await.unwrap();
    assert_ne!(third.dedup_key, first.dedup_key);

    transport.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deterministic_drop_pattern_all_sends_recover() {
    // every fifth response starting at the first is lost
    let pattern: HashSet<u64> = (0..100).map(|n| n * 5 + 1).collect();
    let chaos = ChaosConfig::builder().drop_pattern(pattern).build().unwrap();
    let sim = DeviceSimulator::start_with(chaos).await.unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let transport = connect("dev-loss", &sim, fast_config(), metrics.clone()).await;

    for n in 0..100u8 {
        let payload = [0x0E, n % 100, 0x00];
        let result = transport
            .send_reliable_with(&payload, None, Duration::from_millis(150), 4)
            .await;
        assert!(result.success, "send {n} must recover: {result:?}");
    }

    let retries = metrics.counter_sum(names::RETRY_ATTEMPTS_TOTAL);
    assert!(
        (15..=35).contains(&retries),
        "about a fifth of the sends should have retried once, saw {retries}",
    );
    assert_eq!(metrics.counter_sum(names::MESSAGE_ABANDONED_TOTAL), 0);

    transport.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_timeout_triggers_reconnect() {
    init_tracing();
    let sim = DeviceSimulator::start().await.unwrap();
    sim.respond_to_heartbeats(false);

    let timeouts = TimeoutConfig::from_p99_ack_latency(Duration::from_millis(40))
        .with_ack_wait(Duration::from_millis(200))
        .with_handshake(Duration::from_millis(500))
        .with_heartbeat(Duration::from_millis(150), Duration::from_millis(250))
        .with_backoff(
            Duration::from_millis(40),
            Duration::from_millis(160),
            Duration::from_millis(10),
        );
    let config = TransportConfig::from_timeouts(timeouts);
    let metrics = Arc::new(MemoryMetrics::new());
    let transport = connect("dev-heartbeat", &sim, config, metrics.clone()).await;

    let reconnect_counter = {
        let metrics = metrics.clone();
        move || {
            metrics.counter(
                names::RECONNECTION_TOTAL,
                &[("device_id", "dev-heartbeat"), ("reason", "heartbeat_timeout")],
            ) >= 1
        }
    };
    assert!(
        wait_until(Duration::from_secs(5), reconnect_counter).await,
        "a quiet heartbeat must trigger a reconnect",
    );
    // the device comes back; the transport should settle connected again
    sim.respond_to_heartbeats(true);
    assert!(
        wait_until(Duration::from_secs(5), || transport.state()
            == ConnectionState::Connected)
            .await
    );
    assert!(sim.connections() >= 2, "reconnect dials a fresh session");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let result = transport.send_reliable(&TOGGLE_ON).await;
    assert!(result.success, "sends work after the reconnect: {result:?}");
    assert_eq!(
        metrics.counter(
            names::RECONNECTION_TOTAL,
            &[("device_id", "dev-heartbeat"), ("reason", "heartbeat_timeout")],
        ),
        1
    );

    transport.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_connection_refused_and_cycles_legal() {
    let sim = DeviceSimulator::start().await.unwrap();
    let first = CyncTransport::new("dev-registry", fast_config());
    first.connect(sim.addr(), ENDPOINT, AUTH).await.unwrap();

    let second = CyncTransport::new("dev-registry", fast_config());
    match second.connect(sim.addr(), ENDPOINT, AUTH).await {
        Err(ConnectError::Connection(error @ CyncConnectionError::ParallelConnection { .. })) => {
            assert_eq!(error.reason(), "parallel_connection");
        }
        other => panic!("expected parallel_connection, got {other:?}"),
    }

    // the slot frees on shutdown; a second connect cycle is legal
    first.shutdown().await;
    second.connect(sim.addr(), ENDPOINT, AUTH).await.unwrap();
    assert_eq!(second.state(), ConnectionState::Connected);
    second.shutdown().await;

    // a closed transport's receive side reports closure, not silence
    assert!(matches!(
        second.recv_reliable().await,
        Err(PacketReceiveError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn send_without_connect_reports_not_connected() {
    let transport = CyncTransport::new("dev-never-connected", fast_config());
    let result = transport.send_reliable(&TOGGLE_ON).await;
    assert!(!result.success);
    assert_eq!(result.reason, Some("not_connected"));
}

#[tokio::test(flavor = "multi_thread")]
async fn group_commands_fan_out_across_transports() {
    let sim_a = DeviceSimulator::start().await.unwrap();
    let sim_b = DeviceSimulator::start().await.unwrap();
    let metrics = Arc::new(MemoryMetrics::new());
    let a = connect("dev-group-a", &sim_a, fast_config(), metrics.clone()).await;
    let b = connect("dev-group-b", &sim_b, fast_config(), metrics).await;

    // there is no send queue: a group command is concurrent send_reliable
    // calls, one per device transport
    let (result_a, result_b) = tokio::join!(a.send_reliable(&TOGGLE_ON), b.send_reliable(&TOGGLE_ON));
    assert!(result_a.success && result_b.success);
    assert!(sim_a.state().on);
    assert!(sim_b.state().on);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payload_is_refused_without_touching_the_wire() {
    let sim = DeviceSimulator::start().await.unwrap();
    let transport = connect(
        "dev-oversize",
        &sim,
        fast_config(),
        Arc::new(MemoryMetrics::new()),
    )
    .await;

    let oversized = vec![0u8; 5000];
    let result = transport.send_reliable(&oversized).await;
    assert!(!result.success);
    assert_eq!(result.reason, Some("packet_too_large"));

    transport.shutdown().await;
}
