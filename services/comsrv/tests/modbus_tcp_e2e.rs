//! Modbus TCP master and slave channels talking over loopback

#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use comsrv::channels::{Channel, ChannelManager};
use comsrv::publisher::{MemoryPublisher, PublisherPump};
use comsrv::registry::create_default_registry;
use comsrv::runtime::ReconnectPolicy;
use serde_json::json;
use voltage_comlink::{
    ChannelConfig, CommandOutcome, DataPointConfig, DataType, DeviceRole, PointTable, PointType,
};
use voltage_protocols::modbus::{ModbusSlave, ModbusTcpParams, RegisterTable};

use common::{approx_eq, free_port, holding_telemetry, wait_for};

const SLAVE_CHANNEL: u32 = 10;
const MASTER_CHANNEL: u32 = 1;

fn tcp_config(id: u32, name: &str, port: u16) -> ChannelConfig {
    ChannelConfig::new(id, name, "modbus_tcp")
        .with_param("host", json!("127.0.0.1"))
        .with_param("port", json!(port))
        .with_param("response_timeout_ms", json!(500))
        .with_polling_interval(50)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_master_polls_and_commands_slave() {
    let port = free_port();
    let publisher = Arc::new(MemoryPublisher::new());
    let pump = PublisherPump::spawn(publisher.clone(), 256);
    let manager = ChannelManager::new(
        Arc::new(create_default_registry()),
        pump.sender(),
        ReconnectPolicy::fixed(Duration::from_millis(50)),
        16,
    );

    // slave with five preloaded holding registers
    let slave_config = tcp_config(SLAVE_CHANNEL, "slave", port)
        .with_role(DeviceRole::Slave)
        .with_param("slave", json!({ "unit_id": 1, "listen_timeout_ms": 50 }));
    let params: ModbusTcpParams = slave_config.typed_params().unwrap();
    let slave = ModbusSlave::tcp(&slave_config, params).unwrap();
    let register_map = slave.register_map();
    register_map
        .write()
        .write_registers(RegisterTable::HoldingRegisters, 1000, &[2300, 2310, 2320, 2330, 2340])
        .unwrap();
    let slave_channel = Channel::new(
        slave_config,
        Box::new(slave),
        PointTable::default(),
        pump.sender(),
        ReconnectPolicy::fixed(Duration::from_millis(50)),
    )
    .unwrap();
    manager.add_channel(slave_channel).unwrap();
    manager.start_channel(SLAVE_CHANNEL).await.unwrap();

    // master reading them with scale 0.1, plus one adjustment point
    let mut points: Vec<DataPointConfig> = (0..5u16)
        .map(|i| holding_telemetry(u32::from(i) + 1, 1000 + i, 0.1))
        .collect();
    points.push(
        DataPointConfig::new(20, "setpoint", PointType::Adjustment, DataType::Uint16)
            .with_modbus(1, 6, 1002),
    );
    manager
        .create_channel(
            tcp_config(MASTER_CHANNEL, "master", port),
            PointTable::new(points).unwrap(),
        )
        .unwrap();
    manager.start_channel(MASTER_CHANNEL).await.unwrap();

    let polled = wait_for(Duration::from_secs(5), || {
        publisher
            .get(MASTER_CHANNEL, 5)
            .is_some_and(|u| u.reading.is_valid())
    })
    .await;
    assert!(polled, "master never published point 5");

    let values = publisher.channel_values(MASTER_CHANNEL);
    let expected = [230.0, 231.0, 232.0, 233.0, 234.0];
    for (point_id, want) in (1..=5u32).zip(expected) {
        let reading = &values
            .iter()
            .find(|(id, _)| *id == point_id)
            .unwrap()
            .1;
        assert!(reading.is_valid());
        assert!(approx_eq(reading.as_f64(), want), "point {}: {}", point_id, reading.as_f64());
    }

    // write through the master, then see the new value polled back
    assert_eq!(
        manager.on_command(MASTER_CHANNEL, 20, 2500.0).await,
        CommandOutcome::Accepted
    );
    let read_back = wait_for(Duration::from_secs(5), || {
        publisher
            .get(MASTER_CHANNEL, 3)
            .is_some_and(|u| approx_eq(u.reading.as_f64(), 250.0))
    })
    .await;
    assert!(read_back, "written value not polled back");
    assert_eq!(
        register_map
            .read()
            .read_registers(RegisterTable::HoldingRegisters, 1002, 1)
            .unwrap(),
        vec![2500]
    );

    let master_status = manager.get(MASTER_CHANNEL).unwrap().status();
    assert!(master_status.connected);
    assert_eq!(master_status.protocol_errors, 0);
    assert!(master_status.poll_cycles > 0);

    manager.stop_all().await;
    pump.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reading_outside_slave_map_is_protocol_error() {
    let port = free_port();
    let publisher = Arc::new(MemoryPublisher::new());
    let pump = PublisherPump::spawn(publisher.clone(), 64);
    let manager = ChannelManager::new(
        Arc::new(create_default_registry()),
        pump.sender(),
        ReconnectPolicy::fixed(Duration::from_millis(50)),
        16,
    );

    let slave_config = tcp_config(SLAVE_CHANNEL, "slave", port)
        .with_role(DeviceRole::Slave)
        .with_param("slave", json!({ "unit_id": 1, "listen_timeout_ms": 50, "map_size": 100 }));
    manager
        .create_channel(slave_config, PointTable::default())
        .unwrap();

    let points = PointTable::new(vec![holding_telemetry(1, 500, 1.0)]).unwrap();
    manager
        .create_channel(tcp_config(MASTER_CHANNEL, "master", port), points)
        .unwrap();
    manager.start_all().await.unwrap();

    let degraded = wait_for(Duration::from_secs(5), || {
        publisher
            .get(MASTER_CHANNEL, 1)
            .is_some_and(|u| !u.reading.is_valid())
    })
    .await;
    assert!(degraded);
    let master = manager.get(MASTER_CHANNEL).unwrap();
    assert!(master.status().protocol_errors >= 1);
    // exceptions do not take the link down
    assert!(master.is_connected());

    manager.stop_all().await;
    pump.shutdown(Duration::from_secs(1)).await;
}
