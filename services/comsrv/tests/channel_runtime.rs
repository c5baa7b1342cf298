//! Channel loop behavior against scripted transports

#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use comsrv::channels::{Channel, ChannelManager};
use comsrv::publisher::{MemoryPublisher, PublisherPump};
use comsrv::registry::create_default_registry;
use comsrv::runtime::ReconnectPolicy;
use serde_json::json;
use tokio::sync::mpsc;
use voltage_comlink::transport::{MockHandle, MockTransport};
use voltage_comlink::{
    ChannelConfig, ChannelLogger, ConnectionState, DataPointConfig, DataType, PointCommand,
    PointTable, PointType, Quality,
};
use voltage_protocols::modbus::{encode_rtu, Framing, ModbusBatchConfig, ModbusMaster};

use common::{free_port, holding_telemetry, wait_for};

fn rtu_master(
    channel_id: u32,
    responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
) -> (ModbusMaster, MockHandle) {
    let (transport, handle) = MockTransport::new();
    handle.set_responder(responder);
    let master = ModbusMaster::new(
        ChannelLogger::new(channel_id, "rtu"),
        Framing::Rtu {
            silent_interval: Duration::ZERO,
        },
        Box::new(transport),
        Duration::from_millis(50),
        ModbusBatchConfig::default(),
    );
    (master, handle)
}

/// Answers every FC03 read of one register with 42
fn answer_42(frame: &[u8]) -> Option<Vec<u8>> {
    Some(encode_rtu(frame[0], &[0x03, 0x02, 0x00, 0x2A]))
}

#[tokio::test]
async fn test_corrupt_crc_keeps_last_good_value() {
    let corrupt_next = Arc::new(AtomicBool::new(false));
    let corrupt = Arc::clone(&corrupt_next);
    let (master, _handle) = rtu_master(20, move |frame| {
        let mut reply = answer_42(frame)?;
        if corrupt.swap(false, Ordering::SeqCst) {
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
        }
        Some(reply)
    });
    let points = PointTable::new(vec![holding_telemetry(1, 0, 1.0)]).unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let config = ChannelConfig::new(20, "rtu", "modbus_rtu").with_polling_interval(100);
    let channel = Channel::new(
        config,
        Box::new(master),
        points,
        tx,
        ReconnectPolicy::fixed(Duration::from_millis(10)),
    )
    .unwrap();
    channel.start().await.unwrap();

    let good = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(good.reading.is_valid());
    assert_eq!(good.reading.as_f64(), 42.0);
    let errors_before = channel.status().protocol_errors;

    // one bad checksum on the next cycle
    corrupt_next.store(true, Ordering::SeqCst);
    let degraded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(degraded.reading.quality(), Quality::Invalid);
    assert!(!degraded.reading.is_valid());
    assert_eq!(degraded.reading.as_f64(), 42.0);

    let cached = channel.get_value(1).unwrap();
    assert_eq!(cached.as_f64(), 42.0);
    let status = channel.status();
    assert_eq!(status.protocol_errors, errors_before + 1);
    assert!(status.last_error.is_some());
    assert!(channel.is_connected());

    // the following cycle is clean again
    let recovered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(recovered.reading.is_valid());
    assert_eq!(channel.status().protocol_errors, errors_before + 1);

    channel.stop().await;
}

#[tokio::test]
async fn test_slow_write_reply_stays_out_of_polls() {
    // FC06 replies echo the request
    let (master, handle) = rtu_master(23, |frame| match frame[1] {
        0x03 => answer_42(frame),
        _ => Some(frame.to_vec()),
    });
    handle.set_read_delay(Duration::from_millis(15));
    let points = PointTable::new(vec![
        holding_telemetry(1, 0, 1.0),
        DataPointConfig::new(2, "limit", PointType::Adjustment, DataType::Uint16)
            .with_modbus(1, 6, 5),
    ])
    .unwrap();
    let (tx, mut rx) = mpsc::channel(1024);
    let config = ChannelConfig::new(23, "rtu", "modbus_rtu").with_polling_interval(30);
    let channel = Channel::new(
        config,
        Box::new(master),
        points,
        tx,
        ReconnectPolicy::fixed(Duration::from_millis(10)),
    )
    .unwrap();
    channel.start().await.unwrap();
    assert!(rx.recv().await.unwrap().reading.is_valid());

    // the reply takes longer than the command timeout
    let command = PointCommand::for_point(PointType::Adjustment, 12.0)
        .with_timeout(Duration::from_millis(5));
    let mut accepted = false;
    for _ in 0..40 {
        if channel.execute_point_command(2, command.clone()).await.is_ok() {
            accepted = true;
            break;
        }
    }
    assert!(accepted);
    assert!(handle
        .written()
        .contains(&encode_rtu(1, &[0x06, 0x00, 0x05, 0x00, 0x0C])));

    let cycles = channel.status().poll_cycles;
    assert!(wait_for(Duration::from_secs(2), || channel.status().poll_cycles >= cycles + 3).await);
    assert_eq!(channel.status().protocol_errors, 0);
    assert!(channel.get_value(1).is_some_and(|r| r.is_valid() && r.as_f64() == 42.0));

    channel.stop().await;
}

#[tokio::test]
async fn test_stop_halts_all_io() {
    let (master, handle) = rtu_master(21, answer_42);
    let points = PointTable::new(vec![holding_telemetry(1, 0, 1.0)]).unwrap();
    let (tx, mut rx) = mpsc::channel(1024);
    let config = ChannelConfig::new(21, "rtu", "modbus_rtu").with_polling_interval(5);
    let channel = Channel::new(
        config,
        Box::new(master),
        points,
        tx,
        ReconnectPolicy::fixed(Duration::from_millis(10)),
    )
    .unwrap();
    channel.start().await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.reading.as_f64(), 42.0);
    assert!(wait_for(Duration::from_secs(2), || handle.io_ops() > 10).await);

    channel.stop().await;
    assert!(!channel.is_running());
    assert!(!handle.is_open());
    assert_eq!(channel.status().state, ConnectionState::Stopped);

    let io_after_stop = handle.io_ops();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.io_ops(), io_after_stop);
}

#[tokio::test]
async fn test_link_failure_reopens_transport() {
    let (master, handle) = rtu_master(22, answer_42);
    let points = PointTable::new(vec![holding_telemetry(1, 0, 1.0)]).unwrap();
    let (tx, mut rx) = mpsc::channel(1024);
    let config = ChannelConfig::new(22, "rtu", "modbus_rtu").with_polling_interval(10);
    let channel = Channel::new(
        config,
        Box::new(master),
        points,
        tx,
        ReconnectPolicy::fixed(Duration::from_millis(20)),
    )
    .unwrap();
    channel.start().await.unwrap();
    assert!(rx.recv().await.unwrap().reading.is_valid());

    handle.set_fail_io(true);
    handle.set_fail_open(true);
    let mut saw_comm_failure = false;
    while let Ok(Some(update)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        if update.reading.quality() == Quality::CommFailure {
            // last good value survives with the degraded quality
            assert_eq!(update.reading.as_f64(), 42.0);
            saw_comm_failure = true;
            break;
        }
    }
    assert!(saw_comm_failure);
    assert!(wait_for(Duration::from_secs(2), || channel.status().reconnect_attempts >= 2).await);
    assert!(!channel.is_connected());

    handle.set_fail_io(false);
    handle.set_fail_open(false);
    assert!(wait_for(Duration::from_secs(2), || channel.is_connected()).await);
    assert!(channel.is_running());

    channel.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_channel_does_not_disturb_others() {
    let publisher = Arc::new(MemoryPublisher::new());
    let pump = PublisherPump::spawn(publisher.clone(), 1024);
    let manager = ChannelManager::new(
        Arc::new(create_default_registry()),
        pump.sender(),
        ReconnectPolicy::fixed(Duration::from_millis(30)),
        16,
    );

    // nothing listens on this port
    let dead = ChannelConfig::new(1, "dead", "modbus_tcp")
        .with_param("host", json!("127.0.0.1"))
        .with_param("port", json!(free_port()))
        .with_param("connect_timeout_ms", json!(100));
    manager
        .create_channel(dead, PointTable::new(vec![holding_telemetry(1, 0, 1.0)]).unwrap())
        .unwrap();

    let sim = ChannelConfig::new(2, "sim", "virtual")
        .with_param("ramp_step", json!(1.0))
        .with_polling_interval(10);
    let sim_points = PointTable::new(vec![DataPointConfig::new(
        1,
        "power",
        PointType::Telemetry,
        DataType::Float32,
    )])
    .unwrap();
    manager.create_channel(sim, sim_points).unwrap();
    manager.start_all().await.unwrap();

    let dead_channel = manager.get(1).unwrap();
    let sim_channel = manager.get(2).unwrap();
    assert!(wait_for(Duration::from_secs(3), || dead_channel.status().reconnect_attempts >= 1).await);

    // the healthy channel keeps its cadence while the other one retries
    let cycles_before = sim_channel.status().poll_cycles;
    let attempts_before = dead_channel.status().reconnect_attempts;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(sim_channel.status().poll_cycles >= cycles_before + 10);
    assert!(dead_channel.status().reconnect_attempts > attempts_before);
    assert!(sim_channel.is_connected());
    assert!(publisher.get(2, 1).is_some_and(|u| u.reading.is_valid()));
    assert!(publisher.get(1, 1).is_none());
    assert!(!dead_channel.is_connected());
    assert!(dead_channel.is_running());

    manager.stop_all().await;
    pump.shutdown(Duration::from_secs(1)).await;
}
