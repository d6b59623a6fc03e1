// device.rs
//
// Per-device scheduling: the run-device holds the cross-thread queues
// (external messages, dirty items), the device runnable owns the message
// lists and the four-state tick machine the port arbiter drives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::codec::RenderOptions;
use crate::config::DeviceConfig;
use crate::item::ItemState;
use crate::message::{RunItem, RunMessage};
use crate::status::Status;
use crate::transport::ClientPort;
use crate::types::{now, DataOrder, MemoryType};

/// Per-function request-size limits of one device.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeviceCaps {
    pub max_read_coils: u16,
    pub max_read_discrete_inputs: u16,
    pub max_read_input_registers: u16,
    pub max_read_holding_registers: u16,
    pub max_write_multiple_coils: u16,
    pub max_write_multiple_registers: u16,
}

impl DeviceCaps {
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        DeviceCaps {
            max_read_coils: cfg.max_read_coils,
            max_read_discrete_inputs: cfg.max_read_discrete_inputs,
            max_read_input_registers: cfg.max_read_input_registers,
            max_read_holding_registers: cfg.max_read_holding_registers,
            max_write_multiple_coils: cfg.max_write_multiple_coils,
            max_write_multiple_registers: cfg.max_write_multiple_registers,
        }
    }

    pub fn max_read(&self, mem: MemoryType) -> u16 {
        match mem {
            MemoryType::Coils => self.max_read_coils,
            MemoryType::DiscreteInputs => self.max_read_discrete_inputs,
            MemoryType::InputRegisters => self.max_read_input_registers,
            MemoryType::HoldingRegisters => self.max_read_holding_registers,
        }
    }

    pub fn max_write(&self, mem: MemoryType) -> Option<u16> {
        match mem {
            MemoryType::Coils => Some(self.max_write_multiple_coils),
            MemoryType::HoldingRegisters => Some(self.max_write_multiple_registers),
            _ => None,
        }
    }
}

/// Fully resolved device-level defaults items cascade to.
#[derive(Clone, Debug)]
pub(crate) struct DeviceDefaults {
    pub byte_order: DataOrder,
    pub register_order: DataOrder,
    pub render: RenderOptions,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        DeviceDefaults {
            // standard Modbus byte order; low register at the low address
            byte_order: DataOrder::MostSignifiedFirst,
            register_order: DataOrder::LessSignifiedFirst,
            render: RenderOptions::default(),
        }
    }
}

impl DeviceDefaults {
    pub fn from_config(cfg: &DeviceConfig) -> Self {
        let base = DeviceDefaults::default();
        DeviceDefaults {
            byte_order: cfg.byte_order.unwrap_or(base.byte_order),
            register_order: cfg.register_order.unwrap_or(base.register_order),
            render: RenderOptions {
                digital_format: cfg
                    .byte_array_format
                    .unwrap_or(base.render.digital_format),
                separator: cfg
                    .byte_array_separator
                    .clone()
                    .unwrap_or_else(|| base.render.separator.clone()),
                string_length_type: cfg
                    .string_length_type
                    .unwrap_or(base.render.string_length_type),
                string_encoding: cfg
                    .string_encoding
                    .unwrap_or(base.render.string_encoding),
            },
        }
    }
}

/// Shared device state. The API side pushes external messages and marks
/// items dirty; the scheduler task is the only consumer.
pub(crate) struct RunDevice {
    pub name: String,
    pub unit: u8,
    pub caps: DeviceCaps,
    pub defaults: DeviceDefaults,
    external: Mutex<VecDeque<RunMessage>>,
    dirty: Mutex<VecDeque<Arc<ItemState>>>,
}

impl RunDevice {
    pub fn new(name: String, unit: u8, caps: DeviceCaps, defaults: DeviceDefaults) -> Self {
        RunDevice {
            name,
            unit,
            caps,
            defaults,
            external: Mutex::new(VecDeque::new()),
            dirty: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_external(&self, msg: RunMessage) {
        match self.external.lock() {
            Ok(mut q) => q.push_back(msg),
            Err(poisoned) => poisoned.into_inner().push_back(msg),
        }
    }

    pub fn pop_external(&self) -> Option<RunMessage> {
        match self.external.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Queue a dirty item for the next planning pass. The caller only
    /// enqueues when the item flipped from clean to dirty, so the queue
    /// never holds the same item twice.
    pub fn mark_dirty(&self, item: Arc<ItemState>) {
        match self.dirty.lock() {
            Ok(mut q) => q.push_back(item),
            Err(poisoned) => poisoned.into_inner().push_back(item),
        }
    }

    pub fn pop_dirty(&self) -> Vec<Arc<ItemState>> {
        let mut q = match self.dirty.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        q.drain(..).collect()
    }

    /// Fail everything still queued, stamping items and resolving
    /// external waiters.
    pub fn drain_queues(&self, status: Status) {
        let ts = now();
        while let Some(mut msg) = self.pop_external() {
            msg.set_complete(status, ts, &self.defaults);
        }
        for item in self.pop_dirty() {
            item.pop_write_pending();
            item.update_from_wire(&[], status, ts);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Pause,
    ExecExternal,
    ExecWrite,
    ExecRead,
}

/// The per-device tick machine. `run` is called repeatedly by the port
/// arbiter; it returns as soon as the transport reports Processing, and
/// performs at most one transport step per call.
pub(crate) struct DeviceRunnable {
    device: Arc<RunDevice>,
    state: RunState,
    read_messages: VecDeque<RunMessage>,
    write_queue: VecDeque<RunMessage>,
    current_external: Option<RunMessage>,
    current_write: Option<RunMessage>,
}

impl DeviceRunnable {
    /// Build the runnable and pack the device's items into its permanent
    /// read rotation, first-fit in arrival order.
    pub fn new(device: Arc<RunDevice>, items: Vec<Arc<ItemState>>) -> Self {
        let mut runnable = DeviceRunnable {
            device,
            state: RunState::Pause,
            read_messages: VecDeque::new(),
            write_queue: VecDeque::new(),
            current_external: None,
            current_write: None,
        };
        runnable.create_read_messages(items);
        runnable
    }

    fn create_read_messages(&mut self, items: Vec<Arc<ItemState>>) {
        for state in items {
            let mut pending = Some(RunItem::for_read(&state));
            for msg in &mut self.read_messages {
                let Some(item) = pending.take() else { break };
                match msg.try_add(item) {
                    Ok(()) => break,
                    Err(back) => pending = Some(back),
                }
            }
            if let Some(item) = pending {
                let cap = self.device.caps.max_read(item.mem);
                self.read_messages.push_back(RunMessage::read(item, cap));
            }
        }
    }

    /// Turn freshly dirty items into write messages, first-fit against
    /// the queued (not yet started) ones.
    fn create_write_messages(&mut self) {
        for state in self.device.pop_dirty() {
            let Some(bytes) = state.pop_write_pending() else {
                continue;
            };
            let mem = state.settings.address.mem;
            let Some(cap) = self.device.caps.max_write(mem) else {
                warn!(
                    "device {}: dropping write to read-only {}",
                    self.device.name, state.settings.address
                );
                state.update_from_wire(&[], Status::Bad, now());
                continue;
            };
            let mut pending = Some(RunItem::for_write(&state, bytes));
            for msg in &mut self.write_queue {
                let Some(item) = pending.take() else { break };
                match msg.try_add(item) {
                    Ok(()) => break,
                    Err(back) => pending = Some(back),
                }
            }
            if let Some(item) = pending {
                if let Some(msg) = RunMessage::write(item, cap) {
                    self.write_queue.push_back(msg);
                }
            }
        }
    }

    /// No message is in flight and nothing has been selected.
    pub fn is_idle(&self) -> bool {
        self.state == RunState::Pause
    }

    /// One cooperative tick. Selection cascades external > write > read;
    /// a fresh selection gets its first transport step in the same tick,
    /// and the tick ends after at most one transport step.
    pub fn run(&mut self, port: &mut dyn ClientPort) {
        self.create_write_messages();
        loop {
            match self.state {
                RunState::Pause => {
                    if let Some(mut msg) = self.device.pop_external() {
                        msg.prepare_to_send(&self.device.defaults);
                        self.current_external = Some(msg);
                        self.state = RunState::ExecExternal;
                        continue;
                    }
                    if let Some(mut msg) = self.write_queue.pop_front() {
                        msg.prepare_to_send(&self.device.defaults);
                        self.current_write = Some(msg);
                        self.state = RunState::ExecWrite;
                        continue;
                    }
                    if self.select_read_on_duty() {
                        self.state = RunState::ExecRead;
                        continue;
                    }
                    return;
                }
                RunState::ExecExternal => {
                    let status = match self.current_external.as_mut() {
                        Some(msg) => msg.exec(self.device.unit, port),
                        None => {
                            self.state = RunState::Pause;
                            continue;
                        }
                    };
                    if status.is_processing() {
                        return;
                    }
                    if status.is_bad() {
                        error!("device {}: {}", self.device.name, port.last_error_text());
                    }
                    if let Some(mut msg) = self.current_external.take() {
                        msg.set_complete(status, now(), &self.device.defaults);
                    }
                    self.state = RunState::Pause;
                    return;
                }
                RunState::ExecWrite => {
                    let status = match self.current_write.as_mut() {
                        Some(msg) => msg.exec(self.device.unit, port),
                        None => {
                            self.state = RunState::Pause;
                            continue;
                        }
                    };
                    if status.is_processing() {
                        return;
                    }
                    if status.is_bad() {
                        error!("device {}: {}", self.device.name, port.last_error_text());
                    }
                    if let Some(mut msg) = self.current_write.take() {
                        msg.set_complete(status, now(), &self.device.defaults);
                    }
                    self.state = RunState::Pause;
                    return;
                }
                RunState::ExecRead => {
                    let status = match self.read_messages.back_mut() {
                        Some(msg) => msg.exec(self.device.unit, port),
                        None => {
                            self.state = RunState::Pause;
                            continue;
                        }
                    };
                    if status.is_processing() {
                        return;
                    }
                    if status.is_bad() {
                        error!("device {}: {}", self.device.name, port.last_error_text());
                    }
                    if let Some(msg) = self.read_messages.back_mut() {
                        msg.set_complete(status, now(), &self.device.defaults);
                    }
                    self.state = RunState::Pause;
                    return;
                }
            }
        }
    }

    /// Find the first read message whose period has elapsed, move it to
    /// the back of the rotation and select it. Moving the just-selected
    /// message to the tail is what makes the rotation fair: newly due
    /// messages overtake ones that were already served.
    fn select_read_on_duty(&mut self) -> bool {
        let current_time = now();
        for i in 0..self.read_messages.len() {
            let due = self
                .read_messages
                .get(i)
                .map_or(false, |m| m.is_on_duty(current_time));
            if !due {
                continue;
            }
            if let Some(msg) = self.read_messages.remove(i) {
                self.read_messages.push_back(msg);
            }
            if let Some(msg) = self.read_messages.back_mut() {
                msg.prepare_to_send(&self.device.defaults);
            }
            return true;
        }
        false
    }

    /// Fail the in-flight message (if any) and everything queued behind
    /// it. Used on shutdown and on fatal port errors.
    pub fn drain(&mut self, status: Status) {
        let ts = now();
        if let Some(mut msg) = self.current_external.take() {
            msg.set_complete(status, ts, &self.device.defaults);
        }
        if let Some(mut msg) = self.current_write.take() {
            msg.set_complete(status, ts, &self.device.defaults);
        }
        while let Some(mut msg) = self.write_queue.pop_front() {
            msg.set_complete(status, ts, &self.device.defaults);
        }
        self.device.drain_queues(status);
        self.state = RunState::Pause;
    }
}
