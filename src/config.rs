// config.rs
//
// Typed project configuration: ports, devices, and data items. This is the
// runtime's intake format; a project can be built programmatically or
// loaded from TOML.

use serde::{Deserialize, Serialize};

use crate::types::{
    DataOrder, DigitalFormat, Format, MemoryType, StringEncoding, StringLengthType,
};
use crate::Error;

fn default_tcp_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_max_read_bits() -> u16 {
    2000
}

fn default_max_read_registers() -> u16 {
    125
}

fn default_max_write_bits() -> u16 {
    1968
}

fn default_max_write_registers() -> u16 {
    123
}

fn default_period_ms() -> u32 {
    1000
}

/// Serial parity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// How a port reaches its devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Modbus TCP (MBAP framing).
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
        /// Response timeout per transaction, milliseconds.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Modbus RTU over a serial line.
    Rtu {
        /// Serial device path, e.g. `/dev/ttyUSB0` or `COM3`.
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

/// One physical or logical port and the devices behind it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// A remote Modbus unit: addressing limits plus the defaults its items
/// inherit when they don't override them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Modbus unit (slave) id, 1-247. 0 addresses the broadcast.
    pub unit: u8,
    #[serde(default = "default_max_read_bits")]
    pub max_read_coils: u16,
    #[serde(default = "default_max_read_bits")]
    pub max_read_discrete_inputs: u16,
    #[serde(default = "default_max_read_registers")]
    pub max_read_input_registers: u16,
    #[serde(default = "default_max_read_registers")]
    pub max_read_holding_registers: u16,
    #[serde(default = "default_max_write_bits")]
    pub max_write_multiple_coils: u16,
    #[serde(default = "default_max_write_registers")]
    pub max_write_multiple_registers: u16,
    /// Byte order items fall back to. Absent = global default
    /// (most significant byte first, the Modbus standard).
    #[serde(default)]
    pub byte_order: Option<DataOrder>,
    /// Register order items fall back to. Absent = global default
    /// (least significant register first).
    #[serde(default)]
    pub register_order: Option<DataOrder>,
    #[serde(default)]
    pub byte_array_format: Option<DigitalFormat>,
    #[serde(default)]
    pub byte_array_separator: Option<String>,
    #[serde(default)]
    pub string_length_type: Option<StringLengthType>,
    #[serde(default)]
    pub string_encoding: Option<StringEncoding>,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

/// One user-visible data cell bound to a run of memory units.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemConfig {
    #[serde(default)]
    pub name: String,
    pub mem: MemoryType,
    /// 0-based offset into the memory table.
    pub offset: u16,
    pub format: Format,
    /// Declared byte length for `ByteArray` and `String` items; ignored
    /// for fixed-size formats.
    #[serde(default)]
    pub byte_length: Option<u16>,
    /// Read period in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u32,
    #[serde(default)]
    pub byte_order: Option<DataOrder>,
    #[serde(default)]
    pub register_order: Option<DataOrder>,
    #[serde(default)]
    pub byte_array_format: Option<DigitalFormat>,
    #[serde(default)]
    pub byte_array_separator: Option<String>,
    #[serde(default)]
    pub string_length_type: Option<StringLengthType>,
    #[serde(default)]
    pub string_encoding: Option<StringEncoding>,
}

impl ItemConfig {
    /// Element length in memory units of the item's table.
    pub fn length_units(&self) -> u32 {
        self.format
            .length_units(self.mem, self.byte_length.unwrap_or(0))
    }
}

/// A whole project: every port with its devices and items.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

impl ProjectConfig {
    /// Parse a project from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid project TOML: {e}")))
    }
}

pub(crate) fn validate_item(item: &ItemConfig) -> Result<(), Error> {
    let units = item.length_units();
    if units == 0 {
        return Err(Error::Config(format!(
            "item '{}' has zero length",
            item.name
        )));
    }
    if item.offset as u32 + units > 65_536 {
        return Err(Error::Config(format!(
            "item '{}' at offset {} length {} wraps the 16-bit address space",
            item.name, item.offset, units
        )));
    }
    Ok(())
}

pub(crate) fn validate_device(dev: &DeviceConfig) -> Result<(), Error> {
    let caps = [
        ("max_read_coils", dev.max_read_coils),
        ("max_read_discrete_inputs", dev.max_read_discrete_inputs),
        ("max_read_input_registers", dev.max_read_input_registers),
        ("max_read_holding_registers", dev.max_read_holding_registers),
        ("max_write_multiple_coils", dev.max_write_multiple_coils),
        (
            "max_write_multiple_registers",
            dev.max_write_multiple_registers,
        ),
    ];
    for (name, value) in caps {
        if value == 0 {
            return Err(Error::Config(format!(
                "device '{}': {} must be at least 1",
                dev.name, name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_from_toml() {
        let text = r#"
            [[ports]]
            name = "plant-net"

            [ports.transport]
            type = "tcp"
            host = "192.168.0.10"

            [[ports.devices]]
            name = "plc1"
            unit = 1
            max_read_holding_registers = 8

            [[ports.devices.items]]
            name = "flow"
            mem = "holding_registers"
            offset = 100
            format = "float32"
            period_ms = 250
        "#;
        let project = ProjectConfig::from_toml_str(text).unwrap();
        assert_eq!(project.ports.len(), 1);
        let port = &project.ports[0];
        match &port.transport {
            TransportConfig::Tcp { host, port, timeout_ms } => {
                assert_eq!(host, "192.168.0.10");
                assert_eq!(*port, 502);
                assert_eq!(*timeout_ms, 1000);
            }
            other => panic!("unexpected transport {other:?}"),
        }
        let dev = &port.devices[0];
        assert_eq!(dev.unit, 1);
        assert_eq!(dev.max_read_holding_registers, 8);
        assert_eq!(dev.max_read_coils, 2000);
        let item = &dev.items[0];
        assert_eq!(item.format, Format::Float32);
        assert_eq!(item.length_units(), 2);
        assert_eq!(item.period_ms, 250);
    }

    #[test]
    fn test_rtu_defaults() {
        let text = r#"
            [[ports]]
            name = "line-a"

            [ports.transport]
            type = "rtu"
            path = "/dev/ttyUSB0"
        "#;
        let project = ProjectConfig::from_toml_str(text).unwrap();
        match &project.ports[0].transport {
            TransportConfig::Rtu { baud_rate, data_bits, stop_bits, parity, .. } => {
                assert_eq!(*baud_rate, 9600);
                assert_eq!(*data_bits, 8);
                assert_eq!(*stop_bits, 1);
                assert_eq!(*parity, Parity::None);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_item_validation() {
        let mut item = ItemConfig {
            name: "t".into(),
            mem: MemoryType::HoldingRegisters,
            offset: 65_535,
            format: Format::Dec16,
            byte_length: None,
            period_ms: 1000,
            byte_order: None,
            register_order: None,
            byte_array_format: None,
            byte_array_separator: None,
            string_length_type: None,
            string_encoding: None,
        };
        assert!(validate_item(&item).is_ok());
        item.format = Format::Float32;
        assert!(validate_item(&item).is_err());
        item.format = Format::ByteArray;
        item.offset = 0;
        item.byte_length = Some(0);
        // a zero declared length still occupies one byte
        assert!(validate_item(&item).is_ok());
    }
}
