//! Helpers shared by the integration tests

#![allow(dead_code, clippy::disallowed_methods)]

use std::net::TcpListener;
use std::time::Duration;

use voltage_comlink::{DataPointConfig, DataType, PointType};

/// A local TCP port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn holding_telemetry(id: u32, address: u16, scale: f64) -> DataPointConfig {
    DataPointConfig::new(id, format!("t{}", id), PointType::Telemetry, DataType::Uint16)
        .with_modbus(1, 3, address)
        .with_scaling(scale, 0.0)
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
