//! Protocol factory registry
//!
//! Maps a channel's protocol name to a factory that turns its configuration
//! into a ready-to-run [`ProtocolEngine`].

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use voltage_comlink::{ChannelConfig, DeviceRole, ProtocolEngine};
use voltage_protocols::can::{CanEngine, CanParams};
use voltage_protocols::modbus::{ModbusMaster, ModbusRtuParams, ModbusSlave, ModbusTcpParams};
use voltage_protocols::virt::{VirtualEngine, VirtualParams};

use crate::error::{ComSrvError, Result};

/// Canonical protocol name for the spellings found in configuration files
pub fn normalize_protocol_name(name: &str) -> String {
    let cleaned = name.trim().to_lowercase();
    let normalized = cleaned.replace(['-', ' ', '.'], "_");

    match normalized.as_str() {
        "modbus_tcp" | "modbustcp" => "modbus_tcp".to_string(),
        "modbus_rtu" | "modbusrtu" => "modbus_rtu".to_string(),
        "virtual" | "virt" | "virtual_protocol" => "virtual".to_string(),
        "iec104" | "iec_104" | "iec60870" | "iec_60870" | "iec60870_5_104" | "iec_60870_5_104" => {
            "iec104".to_string()
        },
        "can" | "socketcan" | "can_bus" | "canbus" => "can".to_string(),
        _ => normalized,
    }
}

/// Builds engines for one protocol family
pub trait ProtocolFactory: Send + Sync {
    /// Canonical names this factory serves
    fn protocol_names(&self) -> &'static [&'static str];

    fn create(&self, config: &ChannelConfig) -> Result<Box<dyn ProtocolEngine>>;
}

/// Modbus TCP and RTU, master or slave depending on the channel role
pub struct ModbusFactory;

impl ProtocolFactory for ModbusFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["modbus_tcp", "modbus_rtu"]
    }

    fn create(&self, config: &ChannelConfig) -> Result<Box<dyn ProtocolEngine>> {
        let engine: Box<dyn ProtocolEngine> =
            match (normalize_protocol_name(&config.protocol).as_str(), config.role) {
                ("modbus_tcp", DeviceRole::Master) => {
                    let params: ModbusTcpParams = config.typed_params()?;
                    Box::new(ModbusMaster::tcp(config, params)?)
                },
                ("modbus_tcp", DeviceRole::Slave) => {
                    let params: ModbusTcpParams = config.typed_params()?;
                    Box::new(ModbusSlave::tcp(config, params)?)
                },
                ("modbus_rtu", DeviceRole::Master) => {
                    let params: ModbusRtuParams = config.typed_params()?;
                    Box::new(ModbusMaster::rtu(config, params)?)
                },
                ("modbus_rtu", DeviceRole::Slave) => {
                    let params: ModbusRtuParams = config.typed_params()?;
                    Box::new(ModbusSlave::rtu(config, params)?)
                },
                (other, _) => {
                    return Err(ComSrvError::config(format!(
                        "modbus factory cannot build '{}'",
                        other
                    )))
                },
            };
        Ok(engine)
    }
}

pub struct CanFactory;

impl ProtocolFactory for CanFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["can"]
    }

    fn create(&self, config: &ChannelConfig) -> Result<Box<dyn ProtocolEngine>> {
        if config.role == DeviceRole::Slave {
            return Err(ComSrvError::config(format!(
                "channel {}: CAN channels only run as master",
                config.id
            )));
        }
        let params: CanParams = config.typed_params()?;
        Ok(Box::new(CanEngine::from_channel(config, params)?))
    }
}

pub struct VirtualFactory;

impl ProtocolFactory for VirtualFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["virtual"]
    }

    fn create(&self, config: &ChannelConfig) -> Result<Box<dyn ProtocolEngine>> {
        let params: VirtualParams = config.typed_params()?;
        Ok(Box::new(VirtualEngine::from_channel(config, params)?))
    }
}

/// Protocol name to factory lookup
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: DashMap<String, Arc<dyn ProtocolFactory>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.registered_protocols())
            .finish()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under each of its names, replacing earlier ones
    pub fn register(&self, factory: Arc<dyn ProtocolFactory>) {
        for name in factory.protocol_names() {
            debug!("Registering protocol factory: {}", name);
            self.factories.insert((*name).to_string(), Arc::clone(&factory));
        }
    }

    pub fn is_registered(&self, protocol: &str) -> bool {
        self.factories
            .contains_key(&normalize_protocol_name(protocol))
    }

    pub fn registered_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Build the engine of one channel
    pub fn create(&self, config: &ChannelConfig) -> Result<Box<dyn ProtocolEngine>> {
        let name = normalize_protocol_name(&config.protocol);
        let factory = self
            .factories
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ComSrvError::config(format!(
                    "channel {}: unsupported protocol '{}' (supported: {})",
                    config.id,
                    config.protocol,
                    self.registered_protocols().join(", ")
                ))
            })?;
        factory.create(config)
    }
}

/// Registry with every built-in protocol
pub fn create_default_registry() -> ProtocolRegistry {
    let registry = ProtocolRegistry::new();
    registry.register(Arc::new(ModbusFactory));
    registry.register(Arc::new(CanFactory));
    registry.register(Arc::new(VirtualFactory));
    registry
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_protocol_name() {
        assert_eq!(normalize_protocol_name("Modbus-TCP"), "modbus_tcp");
        assert_eq!(normalize_protocol_name(" modbusrtu "), "modbus_rtu");
        assert_eq!(normalize_protocol_name("virt"), "virtual");
        assert_eq!(normalize_protocol_name("IEC-60870-5-104"), "iec104");
        assert_eq!(normalize_protocol_name("SocketCAN"), "can");
        assert_eq!(normalize_protocol_name("dnp3"), "dnp3");
    }

    #[test]
    fn test_default_registry_protocols() {
        let registry = create_default_registry();
        assert_eq!(
            registry.registered_protocols(),
            vec!["can", "modbus_rtu", "modbus_tcp", "virtual"]
        );
        assert!(registry.is_registered("Modbus TCP"));
        assert!(!registry.is_registered("iec104"));
    }

    #[test]
    fn test_create_modbus_engines_by_role() {
        let registry = create_default_registry();

        let master = ChannelConfig::new(1, "pcs", "modbus_tcp")
            .with_param("host", json!("127.0.0.1"))
            .with_param("port", json!(5020));
        let engine = registry.create(&master).unwrap();
        assert_eq!(engine.role(), DeviceRole::Master);
        assert_eq!(engine.target(), "127.0.0.1:5020");

        let slave = master.clone().with_role(DeviceRole::Slave);
        let engine = registry.create(&slave).unwrap();
        assert_eq!(engine.role(), DeviceRole::Slave);
    }

    #[test]
    fn test_create_virtual_engine() {
        let registry = create_default_registry();
        let config = ChannelConfig::new(7, "sim", "virt").with_param("ramp_step", json!(0.5));
        let engine = registry.create(&config).unwrap();
        assert_eq!(engine.protocol(), "virtual");
    }

    #[test]
    fn test_unsupported_protocol_is_config_error() {
        let registry = create_default_registry();
        let err = registry
            .create(&ChannelConfig::new(3, "grid", "iec104"))
            .err().unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains("unsupported protocol"));
    }

    #[test]
    fn test_bad_parameters_are_config_errors() {
        let registry = create_default_registry();
        // host is required
        let err = registry
            .create(&ChannelConfig::new(4, "meter", "modbus_tcp"))
            .err().unwrap();
        assert!(err.is_config());

        let err = registry
            .create(&ChannelConfig::new(5, "bms", "can").with_role(DeviceRole::Slave))
            .err().unwrap();
        assert!(err.is_config());
    }
}
