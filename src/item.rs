// item.rs
//
// Runtime state of one data item: the staging buffer, the write-pending
// slot, and the subscribers that hear about every completed transaction
// covering the item.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use log::trace;

use crate::codec::RenderOptions;
use crate::status::Status;
use crate::types::{
    Address, DataOrder, DigitalFormat, Format, ItemHandle, StringEncoding, StringLengthType,
    Timestamp,
};

/// Snapshot published to subscribers on every transaction completion.
#[derive(Clone, Debug)]
pub struct ItemUpdate {
    pub handle: ItemHandle,
    /// Copy of the staging buffer at completion time. On a bad status this
    /// is the previous (preserved) contents.
    pub bytes: Vec<u8>,
    pub status: Status,
    pub timestamp: Timestamp,
}

pub type SubscriptionId = u64;

type SubscriberFn = Box<dyn Fn(&ItemUpdate) + Send + Sync>;

/// Immutable description of an item, fixed for its whole life.
#[derive(Clone, Debug)]
pub(crate) struct ItemSettings {
    pub name: String,
    pub address: Address,
    pub format: Format,
    /// Declared byte length for `ByteArray`/`String`; 0 otherwise.
    pub byte_length: u16,
    /// Element length in memory units of the item's table.
    pub count: u16,
    pub period_ms: i64,
    pub byte_order: Option<DataOrder>,
    pub register_order: Option<DataOrder>,
    pub byte_array_format: Option<DigitalFormat>,
    pub byte_array_separator: Option<String>,
    pub string_length_type: Option<StringLengthType>,
    pub string_encoding: Option<StringEncoding>,
}

struct ItemValue {
    bytes: Vec<u8>,
    status: Status,
    timestamp: Timestamp,
}

/// Shared per-item runtime state. The scheduler writes through
/// `update_from_wire`; the API side stages writes and subscribes.
pub(crate) struct ItemState {
    pub handle: ItemHandle,
    pub settings: ItemSettings,
    value: Mutex<ItemValue>,
    pending_write: Mutex<Option<Vec<u8>>>,
    subscribers: RwLock<Vec<(SubscriptionId, SubscriberFn)>>,
    next_subscription: AtomicU64,
}

impl ItemState {
    pub fn new(handle: ItemHandle, settings: ItemSettings) -> Self {
        let size = settings.format.byte_size(settings.byte_length) as usize;
        ItemState {
            handle,
            settings,
            value: Mutex::new(ItemValue {
                bytes: vec![0; size],
                status: Status::BadNotConnected,
                timestamp: 0,
            }),
            pending_write: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Store decoded payload bytes and publish to subscribers. A bad
    /// status leaves the staging buffer untouched; status and timestamp
    /// always advance.
    pub fn update_from_wire(&self, bytes: &[u8], status: Status, timestamp: Timestamp) {
        let update = {
            let mut value = match self.value.lock() {
                Ok(v) => v,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !status.is_bad() {
                value.bytes.clear();
                value.bytes.extend_from_slice(bytes);
            }
            value.status = status;
            value.timestamp = timestamp;
            ItemUpdate {
                handle: self.handle,
                bytes: value.bytes.clone(),
                status,
                timestamp,
            }
        };
        trace!(
            "item {}: status {} data {}",
            self.settings.name,
            update.status,
            hex::encode_upper(&update.bytes)
        );
        self.notify(&update);
    }

    /// Stage bytes for writing and mark the item dirty. Returns true when
    /// the item was not dirty before; repeated calls before the planner
    /// picks the write up just overwrite the staged bytes.
    pub fn write_to(&self, bytes: &[u8]) -> bool {
        let mut pending = match self.pending_write.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        let was_clean = pending.is_none();
        *pending = Some(bytes.to_vec());
        was_clean
    }

    /// Take the staged write bytes, clearing the dirty mark.
    pub fn pop_write_pending(&self) -> Option<Vec<u8>> {
        match self.pending_write.lock() {
            Ok(mut p) => p.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Copy of the current value, status and timestamp.
    pub fn snapshot(&self) -> ItemUpdate {
        let value = match self.value.lock() {
            Ok(v) => v,
            Err(poisoned) => poisoned.into_inner(),
        };
        ItemUpdate {
            handle: self.handle,
            bytes: value.bytes.clone(),
            status: value.status,
            timestamp: value.timestamp,
        }
    }

    /// Register a callback for every future update of this item.
    /// Callbacks run on the owning port's scheduler task and must return
    /// quickly; they must not subscribe or unsubscribe from within.
    pub fn subscribe(&self, f: SubscriberFn) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        match self.subscribers.write() {
            Ok(mut subs) => subs.push((id, f)),
            Err(poisoned) => poisoned.into_inner().push((id, f)),
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = match self.subscribers.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn notify(&self, update: &ItemUpdate) {
        let subs = match self.subscribers.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, f) in subs.iter() {
            f(update);
        }
    }

    /// Rendering settings with unset fields left for the device layer to
    /// fill from its own defaults.
    pub fn render_overrides(&self) -> (Option<DigitalFormat>, Option<String>, Option<StringLengthType>, Option<StringEncoding>) {
        (
            self.settings.byte_array_format,
            self.settings.byte_array_separator.clone(),
            self.settings.string_length_type,
            self.settings.string_encoding,
        )
    }
}

/// Resolve the item's rendering settings against device-level defaults.
pub(crate) fn resolve_render_options(state: &ItemState, device: &RenderOptions) -> RenderOptions {
    let (digital, separator, length_type, encoding) = state.render_overrides();
    RenderOptions {
        digital_format: digital.unwrap_or(device.digital_format),
        separator: separator.unwrap_or_else(|| device.separator.clone()),
        string_length_type: length_type.unwrap_or(device.string_length_type),
        string_encoding: encoding.unwrap_or(device.string_encoding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn settings(offset: u16, format: Format) -> ItemSettings {
        let mem = MemoryType::HoldingRegisters;
        ItemSettings {
            name: "test".into(),
            address: Address::new(mem, offset),
            format,
            byte_length: 0,
            count: format.length_units(mem, 0) as u16,
            period_ms: 1000,
            byte_order: None,
            register_order: None,
            byte_array_format: None,
            byte_array_separator: None,
            string_length_type: None,
            string_encoding: None,
        }
    }

    #[test]
    fn test_bad_status_preserves_bytes() {
        let item = ItemState::new(ItemHandle(1), settings(0, Format::UDec16));
        item.update_from_wire(&[0x34, 0x12], Status::Good, 100);
        assert_eq!(item.snapshot().bytes, vec![0x34, 0x12]);

        item.update_from_wire(&[0xFF, 0xFF], Status::BadTimeout, 200);
        let snap = item.snapshot();
        assert_eq!(snap.bytes, vec![0x34, 0x12]);
        assert_eq!(snap.status, Status::BadTimeout);
        assert_eq!(snap.timestamp, 200);
    }

    #[test]
    fn test_write_pending_overwrite() {
        let item = ItemState::new(ItemHandle(1), settings(0, Format::UDec16));
        assert!(item.write_to(&[1, 0]));
        assert!(!item.write_to(&[2, 0]));
        assert_eq!(item.pop_write_pending(), Some(vec![2, 0]));
        assert_eq!(item.pop_write_pending(), None);
        assert!(item.write_to(&[3, 0]));
    }

    #[test]
    fn test_subscribe_dispatch() {
        let item = ItemState::new(ItemHandle(7), settings(0, Format::UDec16));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = item.subscribe(Box::new(move |u| {
            assert_eq!(u.handle, ItemHandle(7));
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        item.update_from_wire(&[0, 0], Status::Good, 1);
        item.update_from_wire(&[0, 0], Status::BadTimeout, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(item.unsubscribe(id));
        assert!(!item.unsubscribe(id));
        item.update_from_wire(&[0, 0], Status::Good, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
