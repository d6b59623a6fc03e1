// message.rs
//
// A message is one Modbus transaction in flight: function code, address
// range, payload buffer, and the run-items whose bytes it carries. Read
// messages live forever and rotate on their period; write messages are
// built on demand and dropped after completion; external messages carry a
// completion channel back to the caller.

use std::sync::Arc;

use log::debug;
use tokio::sync::oneshot;

use crate::codec::{bytes_to_words, pack_bits, unpack_bits, words_to_bytes};
use crate::device::DeviceDefaults;
use crate::item::ItemState;
use crate::status::Status;
use crate::transport::ClientPort;
use crate::types::{now, DataOrder, Format, FunctionCode, MemoryType, Timestamp};

// Protocol ceilings per function, independent of any device's own limits.
const MAX_READ_BITS: u16 = 2000;
const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_BITS: u16 = 1968;
const MAX_WRITE_REGISTERS: u16 = 123;

/// Payload of an ad-hoc request or a completed transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Byte(u8),
}

/// An ad-hoc request injected past the planner. The function code is a
/// raw byte so callers can observe how unsupported codes are rejected.
#[derive(Clone, Debug)]
pub struct Request {
    pub function: u8,
    pub offset: u16,
    pub count: u16,
    pub payload: Payload,
}

impl Request {
    pub fn read_coils(offset: u16, count: u16) -> Self {
        Request {
            function: FunctionCode::ReadCoils.as_u8(),
            offset,
            count,
            payload: Payload::None,
        }
    }

    pub fn read_discrete_inputs(offset: u16, count: u16) -> Self {
        Request {
            function: FunctionCode::ReadDiscreteInputs.as_u8(),
            offset,
            count,
            payload: Payload::None,
        }
    }

    pub fn read_holding_registers(offset: u16, count: u16) -> Self {
        Request {
            function: FunctionCode::ReadHoldingRegisters.as_u8(),
            offset,
            count,
            payload: Payload::None,
        }
    }

    pub fn read_input_registers(offset: u16, count: u16) -> Self {
        Request {
            function: FunctionCode::ReadInputRegisters.as_u8(),
            offset,
            count,
            payload: Payload::None,
        }
    }

    pub fn read_exception_status() -> Self {
        Request {
            function: FunctionCode::ReadExceptionStatus.as_u8(),
            offset: 0,
            count: 1,
            payload: Payload::None,
        }
    }

    pub fn write_single_coil(offset: u16, value: bool) -> Self {
        Request {
            function: FunctionCode::WriteSingleCoil.as_u8(),
            offset,
            count: 1,
            payload: Payload::Bits(vec![value]),
        }
    }

    pub fn write_single_register(offset: u16, value: u16) -> Self {
        Request {
            function: FunctionCode::WriteSingleRegister.as_u8(),
            offset,
            count: 1,
            payload: Payload::Words(vec![value]),
        }
    }

    pub fn write_multiple_coils(offset: u16, values: Vec<bool>) -> Self {
        Request {
            function: FunctionCode::WriteMultipleCoils.as_u8(),
            offset,
            count: values.len() as u16,
            payload: Payload::Bits(values),
        }
    }

    pub fn write_multiple_registers(offset: u16, values: Vec<u16>) -> Self {
        Request {
            function: FunctionCode::WriteMultipleRegisters.as_u8(),
            offset,
            count: values.len() as u16,
            payload: Payload::Words(values),
        }
    }
}

/// Terminal outcome of an external message.
#[derive(Clone, Debug)]
pub struct MessageResult {
    pub status: Status,
    pub timestamp: Timestamp,
    /// Reply data for reads that completed with a good status,
    /// `Payload::None` otherwise.
    pub payload: Payload,
}

/// Resolves when the external message reaches a terminal status.
pub struct CompletionHandle {
    rx: oneshot::Receiver<MessageResult>,
}

impl CompletionHandle {
    pub async fn wait(self) -> MessageResult {
        self.rx.await.unwrap_or(MessageResult {
            status: Status::BadAborted,
            timestamp: now(),
            payload: Payload::None,
        })
    }

    /// Non-blocking probe; `Some` once the message is terminal.
    pub fn try_result(&mut self) -> Option<MessageResult> {
        self.rx.try_recv().ok()
    }
}

/// A run-item as carried by a message: the shared item state plus the
/// memory range it occupies. Write carriers additionally hold the staged
/// bytes taken from the item's write-pending slot.
pub(crate) struct RunItem {
    pub state: Arc<ItemState>,
    pub mem: MemoryType,
    pub offset: u16,
    pub count: u16,
    pub period_ms: i64,
    pub write_data: Option<Vec<u8>>,
}

impl RunItem {
    pub fn for_read(state: &Arc<ItemState>) -> Self {
        let s = &state.settings;
        RunItem {
            state: state.clone(),
            mem: s.address.mem,
            offset: s.address.offset,
            count: s.count,
            period_ms: s.period_ms,
            write_data: None,
        }
    }

    pub fn for_write(state: &Arc<ItemState>, bytes: Vec<u8>) -> Self {
        let mut item = Self::for_read(state);
        item.write_data = Some(bytes);
        item
    }

    fn end(&self) -> u32 {
        self.offset as u32 + self.count as u32
    }

    fn orders(&self, defaults: &DeviceDefaults) -> (DataOrder, DataOrder) {
        (
            self.state.settings.byte_order.unwrap_or(defaults.byte_order),
            self.state
                .settings
                .register_order
                .unwrap_or(defaults.register_order),
        )
    }
}

pub(crate) enum MsgBuffer {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Byte(u8),
}

pub(crate) struct RunMessage {
    pub function: FunctionCode,
    pub mem: Option<MemoryType>,
    pub offset: u16,
    pub count: u16,
    /// Per-function count cap from the owning device.
    pub max_count: u16,
    pub period_ms: i64,
    pub timestamp: Timestamp,
    pub status: Status,
    pub buffer: MsgBuffer,
    pub items: Vec<RunItem>,
    /// Write messages shed their items after completion; read messages
    /// keep theirs and are reused forever.
    pub delete_items_on_complete: bool,
    completion: Option<oneshot::Sender<MessageResult>>,
}

impl RunMessage {
    /// Periodic read message seeded with a single item.
    pub fn read(item: RunItem, max_count: u16) -> Self {
        let function = match item.mem {
            MemoryType::Coils => FunctionCode::ReadCoils,
            MemoryType::DiscreteInputs => FunctionCode::ReadDiscreteInputs,
            MemoryType::InputRegisters => FunctionCode::ReadInputRegisters,
            MemoryType::HoldingRegisters => FunctionCode::ReadHoldingRegisters,
        };
        let buffer = if item.mem.is_bits() {
            MsgBuffer::Bits(Vec::new())
        } else {
            MsgBuffer::Words(Vec::new())
        };
        RunMessage {
            function,
            mem: Some(item.mem),
            offset: item.offset,
            count: item.count,
            max_count,
            period_ms: item.period_ms,
            timestamp: 0,
            status: Status::Processing,
            buffer,
            items: vec![item],
            delete_items_on_complete: false,
            completion: None,
        }
    }

    /// One-shot write message seeded with a single dirty item.
    /// Returns `None` for read-only tables.
    pub fn write(item: RunItem, max_count: u16) -> Option<Self> {
        let function = match item.mem {
            MemoryType::Coils => FunctionCode::WriteMultipleCoils,
            MemoryType::HoldingRegisters => FunctionCode::WriteMultipleRegisters,
            _ => return None,
        };
        let buffer = if item.mem.is_bits() {
            MsgBuffer::Bits(Vec::new())
        } else {
            MsgBuffer::Words(Vec::new())
        };
        Some(RunMessage {
            function,
            mem: Some(item.mem),
            offset: item.offset,
            count: item.count,
            max_count,
            period_ms: 0,
            timestamp: 0,
            status: Status::Processing,
            buffer,
            items: vec![item],
            delete_items_on_complete: true,
            completion: None,
        })
    }

    /// Build an external message from a raw request. Unsupported function
    /// codes and malformed payloads are rejected before anything reaches
    /// the transport; the completion channel comes back with the status
    /// the message must resolve with.
    pub fn external(
        req: Request,
        tx: oneshot::Sender<MessageResult>,
    ) -> Result<Self, (Status, oneshot::Sender<MessageResult>)> {
        let function = match FunctionCode::from_u8(req.function) {
            Some(f) => f,
            None => return Err((Status::Bad, tx)),
        };
        let (count, buffer) = match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if req.count == 0 || req.count > MAX_READ_BITS {
                    return Err((Status::Bad, tx));
                }
                (req.count, MsgBuffer::Bits(vec![false; req.count as usize]))
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if req.count == 0 || req.count > MAX_READ_REGISTERS {
                    return Err((Status::Bad, tx));
                }
                (req.count, MsgBuffer::Words(vec![0; req.count as usize]))
            }
            FunctionCode::ReadExceptionStatus => (1, MsgBuffer::Byte(0)),
            FunctionCode::WriteSingleCoil => match req.payload {
                Payload::Bits(ref bits) if !bits.is_empty() => {
                    (1, MsgBuffer::Bits(vec![bits[0]]))
                }
                _ => return Err((Status::Bad, tx)),
            },
            FunctionCode::WriteSingleRegister => match req.payload {
                Payload::Words(ref words) if !words.is_empty() => {
                    (1, MsgBuffer::Words(vec![words[0]]))
                }
                _ => return Err((Status::Bad, tx)),
            },
            FunctionCode::WriteMultipleCoils => match req.payload {
                Payload::Bits(bits)
                    if !bits.is_empty() && bits.len() <= MAX_WRITE_BITS as usize =>
                {
                    (bits.len() as u16, MsgBuffer::Bits(bits))
                }
                _ => return Err((Status::Bad, tx)),
            },
            FunctionCode::WriteMultipleRegisters => match req.payload {
                Payload::Words(words)
                    if !words.is_empty() && words.len() <= MAX_WRITE_REGISTERS as usize =>
                {
                    (words.len() as u16, MsgBuffer::Words(words))
                }
                _ => return Err((Status::Bad, tx)),
            },
        };
        if req.offset as u32 + count as u32 > 65_536 {
            return Err((Status::Bad, tx));
        }
        Ok(RunMessage {
            function,
            mem: function.memory_type(),
            offset: req.offset,
            count,
            max_count: count,
            period_ms: 0,
            timestamp: 0,
            status: Status::Processing,
            buffer,
            items: Vec::new(),
            delete_items_on_complete: false,
            completion: Some(tx),
        })
    }

    pub fn handle_pair() -> (oneshot::Sender<MessageResult>, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, CompletionHandle { rx })
    }

    fn end(&self) -> u32 {
        self.offset as u32 + self.count as u32
    }

    /// First-fit packing: widen the message's range to absorb the item if
    /// the grown range stays under the device cap. Write messages only
    /// merge contiguous or overlapping ranges so no unrelated register is
    /// stored to. Returns the item back on rejection.
    pub fn try_add(&mut self, item: RunItem) -> Result<(), RunItem> {
        if Some(item.mem) != self.mem {
            return Err(item);
        }
        let new_offset = self.offset.min(item.offset);
        let new_end = self.end().max(item.end());
        let new_count = new_end - new_offset as u32;
        if new_count > self.max_count as u32 {
            return Err(item);
        }
        if self.function.is_write()
            && (item.offset as u32 > self.end() || item.end() < self.offset as u32)
        {
            return Err(item);
        }
        self.offset = new_offset;
        self.count = new_count as u16;
        self.period_ms = self.period_ms.min(item.period_ms);
        self.items.push(item);
        Ok(())
    }

    /// Whether this read message's period has elapsed since it was last
    /// sent.
    pub fn is_on_duty(&self, now: Timestamp) -> bool {
        now - self.timestamp >= self.period_ms
    }

    /// Stamp the message and assemble its outgoing payload. Safe to call
    /// again on the same message; the transaction arguments do not change
    /// afterwards.
    pub fn prepare_to_send(&mut self, defaults: &DeviceDefaults) {
        self.status = Status::Processing;
        self.timestamp = now();
        let count = self.count as usize;
        if self.function.is_write() && !self.items.is_empty() {
            match &mut self.buffer {
                MsgBuffer::Bits(bits) => {
                    bits.clear();
                    bits.resize(count, false);
                }
                MsgBuffer::Words(words) => {
                    words.clear();
                    words.resize(count, 0);
                }
                MsgBuffer::Byte(b) => *b = 0,
            }
            // two passes keep the borrow checker happy: gather, then store
            let mut patches: Vec<(usize, MsgBuffer)> = Vec::new();
            for item in &self.items {
                let Some(data) = item.write_data.as_deref() else {
                    continue;
                };
                let start = (item.offset - self.offset) as usize;
                if item.mem.is_bits() {
                    patches.push((
                        start,
                        MsgBuffer::Bits(unpack_bits(data, item.count as usize)),
                    ));
                } else {
                    let (bo, ro) = item.orders(defaults);
                    let mut words = bytes_to_words(data, bo, ro);
                    words.resize(item.count as usize, 0);
                    patches.push((start, MsgBuffer::Words(words)));
                }
            }
            for (start, patch) in patches {
                match (&mut self.buffer, patch) {
                    (MsgBuffer::Bits(dst), MsgBuffer::Bits(src)) => {
                        for (i, bit) in src.into_iter().enumerate() {
                            if let Some(slot) = dst.get_mut(start + i) {
                                *slot = bit;
                            }
                        }
                    }
                    (MsgBuffer::Words(dst), MsgBuffer::Words(src)) => {
                        for (i, word) in src.into_iter().enumerate() {
                            if let Some(slot) = dst.get_mut(start + i) {
                                *slot = word;
                            }
                        }
                    }
                    _ => {}
                }
            }
        } else if self.function.is_read() {
            match &mut self.buffer {
                MsgBuffer::Bits(bits) => {
                    bits.clear();
                    bits.resize(count, false);
                }
                MsgBuffer::Words(words) => {
                    words.clear();
                    words.resize(count, 0);
                }
                MsgBuffer::Byte(b) => *b = 0,
            }
        }
    }

    /// Drive the transaction one step on the port. Returns whatever the
    /// transport reports; arguments are identical across repeated calls.
    pub fn exec(&mut self, unit: u8, port: &mut dyn ClientPort) -> Status {
        let offset = self.offset;
        let count = self.count;
        match (self.function, &mut self.buffer) {
            (FunctionCode::ReadCoils, MsgBuffer::Bits(bits)) => {
                port.read_coils(unit, offset, count, bits)
            }
            (FunctionCode::ReadDiscreteInputs, MsgBuffer::Bits(bits)) => {
                port.read_discrete_inputs(unit, offset, count, bits)
            }
            (FunctionCode::ReadHoldingRegisters, MsgBuffer::Words(words)) => {
                port.read_holding_registers(unit, offset, count, words)
            }
            (FunctionCode::ReadInputRegisters, MsgBuffer::Words(words)) => {
                port.read_input_registers(unit, offset, count, words)
            }
            (FunctionCode::ReadExceptionStatus, MsgBuffer::Byte(byte)) => {
                port.read_exception_status(unit, byte)
            }
            (FunctionCode::WriteSingleCoil, MsgBuffer::Bits(bits)) => {
                port.write_single_coil(unit, offset, bits.first().copied().unwrap_or(false))
            }
            (FunctionCode::WriteSingleRegister, MsgBuffer::Words(words)) => {
                port.write_single_register(unit, offset, words.first().copied().unwrap_or(0))
            }
            (FunctionCode::WriteMultipleCoils, MsgBuffer::Bits(bits)) => {
                port.write_multiple_coils(unit, offset, bits)
            }
            (FunctionCode::WriteMultipleRegisters, MsgBuffer::Words(words)) => {
                port.write_multiple_registers(unit, offset, words)
            }
            _ => Status::Bad,
        }
    }

    /// Stamp the terminal status, hand every covered item its payload
    /// window, and resolve the completion channel if one exists.
    pub fn set_complete(&mut self, status: Status, timestamp: Timestamp, defaults: &DeviceDefaults) {
        self.status = status;
        self.timestamp = timestamp;
        debug!(
            "message {:?} [{}+{}] complete: {}",
            self.function, self.offset, self.count, self.status
        );
        for item in &self.items {
            let bytes = self.extract_item_bytes(item, defaults);
            item.state.update_from_wire(&bytes, status, timestamp);
        }
        if self.delete_items_on_complete {
            self.items.clear();
        }
        if let Some(tx) = self.completion.take() {
            let payload = if status.is_good() {
                match &self.buffer {
                    MsgBuffer::Bits(bits) => Payload::Bits(bits.clone()),
                    MsgBuffer::Words(words) => Payload::Words(words.clone()),
                    MsgBuffer::Byte(byte) => Payload::Byte(*byte),
                }
            } else {
                Payload::None
            };
            let _ = tx.send(MessageResult {
                status,
                timestamp,
                payload,
            });
        }
    }

    /// The payload window belonging to one covered item, converted to the
    /// item's canonical byte layout.
    fn extract_item_bytes(&self, item: &RunItem, defaults: &DeviceDefaults) -> Vec<u8> {
        let start = item.offset.saturating_sub(self.offset) as usize;
        match &self.buffer {
            MsgBuffer::Bits(bits) => {
                let end = (start + item.count as usize).min(bits.len());
                let window = &bits[start.min(bits.len())..end];
                if item.state.settings.format == Format::Bool {
                    vec![u8::from(window.first().copied().unwrap_or(false))]
                } else {
                    let mut bytes = pack_bits(window);
                    bytes.resize(
                        item.state.settings.format.byte_size(item.state.settings.byte_length)
                            as usize,
                        0,
                    );
                    bytes
                }
            }
            MsgBuffer::Words(words) => {
                let end = (start + item.count as usize).min(words.len());
                let window = &words[start.min(words.len())..end];
                if item.state.settings.format == Format::Bool {
                    vec![u8::from(window.first().copied().unwrap_or(0) != 0)]
                } else {
                    let (bo, ro) = item.orders(defaults);
                    let mut bytes = words_to_bytes(window, bo, ro);
                    bytes.truncate(
                        item.state.settings.format.byte_size(item.state.settings.byte_length)
                            as usize,
                    );
                    bytes
                }
            }
            MsgBuffer::Byte(byte) => vec![*byte],
        }
    }
}
