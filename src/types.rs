// types.rs
//
// The Modbus data model: memory tables, addresses, function codes, and
// the display formats a data item can take.

use serde::{Deserialize, Serialize};

/// Milliseconds since the UNIX epoch.
pub type Timestamp = i64;

/// Current time in milliseconds since the UNIX epoch.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// The four Modbus memory tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// 0x table: read-write bits
    Coils,
    /// 1x table: read-only bits
    DiscreteInputs,
    /// 3x table: read-only 16-bit registers
    InputRegisters,
    /// 4x table: read-write 16-bit registers
    HoldingRegisters,
}

impl MemoryType {
    /// Bit-addressed tables (one memory unit = one bit).
    pub fn is_bits(self) -> bool {
        matches!(self, MemoryType::Coils | MemoryType::DiscreteInputs)
    }

    /// Only coils and holding registers accept writes.
    pub fn is_writable(self) -> bool {
        matches!(self, MemoryType::Coils | MemoryType::HoldingRegisters)
    }

    /// Leading digit of the conventional 6-digit address notation.
    pub fn notation_prefix(self) -> char {
        match self {
            MemoryType::Coils => '0',
            MemoryType::DiscreteInputs => '1',
            MemoryType::InputRegisters => '3',
            MemoryType::HoldingRegisters => '4',
        }
    }
}

/// A location in a device's memory: table plus 0-based offset.
///
/// Displayed 1-based in the conventional notation, e.g. holding register 0
/// renders as `400001`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub mem: MemoryType,
    pub offset: u16,
}

impl Address {
    pub fn new(mem: MemoryType, offset: u16) -> Self {
        Address { mem, offset }
    }

    /// Whether `count` memory units starting here fit without wrapping the
    /// 16-bit address space.
    pub fn fits(self, count: u32) -> bool {
        self.offset as u32 + count <= 65_536
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{:05}",
            self.mem.notation_prefix(),
            self.offset as u32 + 1
        )
    }
}

/// The nine client-side function codes this runtime speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    ReadExceptionStatus = 7,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
}

impl FunctionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FunctionCode::ReadCoils),
            2 => Some(FunctionCode::ReadDiscreteInputs),
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            5 => Some(FunctionCode::WriteSingleCoil),
            6 => Some(FunctionCode::WriteSingleRegister),
            7 => Some(FunctionCode::ReadExceptionStatus),
            15 => Some(FunctionCode::WriteMultipleCoils),
            16 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
                | FunctionCode::ReadExceptionStatus
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// The memory table a function operates on. `ReadExceptionStatus`
    /// addresses no table.
    pub fn memory_type(self) -> Option<MemoryType> {
        match self {
            FunctionCode::ReadCoils
            | FunctionCode::WriteSingleCoil
            | FunctionCode::WriteMultipleCoils => Some(MemoryType::Coils),
            FunctionCode::ReadDiscreteInputs => Some(MemoryType::DiscreteInputs),
            FunctionCode::ReadInputRegisters => Some(MemoryType::InputRegisters),
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteSingleRegister
            | FunctionCode::WriteMultipleRegisters => Some(MemoryType::HoldingRegisters),
            FunctionCode::ReadExceptionStatus => None,
        }
    }
}

/// Significance ordering for bytes within a register and for registers
/// within a multi-register value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrder {
    LessSignifiedFirst,
    MostSignifiedFirst,
}

/// Display format of a data item. The format fixes the element length in
/// memory units: 1 bit for `Bool` on a bit table, otherwise the value's
/// byte size rounded up to registers (or spread over bits on a bit table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Bool,
    Bin16,
    Dec16,
    UDec16,
    Hex16,
    Bin32,
    Dec32,
    UDec32,
    Hex32,
    Bin64,
    Dec64,
    UDec64,
    Hex64,
    Float32,
    Double64,
    /// Raw bytes; length comes from the item's declared byte length.
    ByteArray,
    /// Text; length comes from the item's declared byte length.
    String,
}

impl Format {
    /// Size of one element in bytes. `declared` is the item's configured
    /// byte length, meaningful only for `ByteArray` and `String`.
    pub fn byte_size(self, declared: u16) -> u16 {
        match self {
            Format::Bool => 1,
            Format::Bin16 | Format::Dec16 | Format::UDec16 | Format::Hex16 => 2,
            Format::Bin32 | Format::Dec32 | Format::UDec32 | Format::Hex32 | Format::Float32 => 4,
            Format::Bin64 | Format::Dec64 | Format::UDec64 | Format::Hex64 | Format::Double64 => 8,
            Format::ByteArray | Format::String => declared.max(1),
        }
    }

    /// Element length in memory units of the given table: bits on 0x/1x,
    /// registers on 3x/4x.
    pub fn length_units(self, mem: MemoryType, declared: u16) -> u32 {
        let bytes = self.byte_size(declared) as u32;
        if mem.is_bits() {
            if self == Format::Bool {
                1
            } else {
                bytes * 8
            }
        } else {
            (bytes + 1) / 2
        }
    }
}

/// Per-byte rendering of a `ByteArray` item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalFormat {
    Bin,
    Oct,
    Dec,
    UDec,
    Hex,
}

/// How the length of a `String` item is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringLengthType {
    /// Text ends at the first NUL; the rest of the element is padding.
    ZeroTerminated,
    /// The whole declared length is text.
    FullLength,
}

/// Character encoding of a `String` item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    Utf8,
    Utf16,
    Latin1,
}

/// Stable identifier of a data item, valid for the project's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemHandle(pub(crate) u64);

/// Stable identifier of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub(crate) u64);

/// Stable identifier of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(pub(crate) u64);
