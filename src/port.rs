// port.rs
//
// Per-port cooperative arbiter. One tokio task per port loops over the
// port's devices round-robin; the half-duplex transport means at most one
// device makes forward progress at a time while the others sit in PAUSE
// or keep their in-flight transaction warm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::time::sleep;

use crate::device::DeviceRunnable;
use crate::status::Status;
use crate::transport::ClientPort;

/// Pause between scheduler passes once every device has been visited.
const PASS_PAUSE_MS: u64 = 1;

pub(crate) struct PortRunnable {
    name: String,
    port: Box<dyn ClientPort>,
    devices: Vec<DeviceRunnable>,
    shutdown: Arc<AtomicBool>,
}

impl PortRunnable {
    pub fn new(
        name: String,
        port: Box<dyn ClientPort>,
        devices: Vec<DeviceRunnable>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        PortRunnable {
            name,
            port,
            devices,
            shutdown,
        }
    }

    /// Scheduler loop. Runs until the shutdown flag is set; an in-flight
    /// transaction is driven to its terminal status first (bounded by the
    /// transport timeout), then everything still queued fails aborted.
    pub async fn run(mut self) {
        info!(
            "port {}: scheduler started ({} devices)",
            self.name,
            self.devices.len()
        );
        loop {
            let stopping = self.shutdown.load(Ordering::Relaxed);
            if stopping && self.devices.iter().all(|d| d.is_idle()) {
                break;
            }
            for device in &mut self.devices {
                if stopping && device.is_idle() {
                    continue;
                }
                device.run(&mut *self.port);
            }
            sleep(Duration::from_millis(PASS_PAUSE_MS)).await;
        }
        for device in &mut self.devices {
            device.drain(Status::BadAborted);
        }
        debug!("port {}: scheduler stopped", self.name);
    }
}
