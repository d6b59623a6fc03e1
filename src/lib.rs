//! Client-side Modbus runtime engine.
//!
//! The runtime drives periodic reads, queued writes, and ad-hoc requests
//! against any number of remote devices, multiplexed over shared TCP or
//! RTU ports. Data items declared in the project are packed into
//! minimum-count Modbus requests per device, paced by their periods, and
//! published to subscribers on every completed transaction.
//!
//! Scheduling is cooperative and single-threaded per port: one tokio task
//! owns each port's transport and round-robins its devices. Within a
//! device the priority is strict — ad-hoc messages, then queued writes,
//! then the read rotation — and a port carries at most one transaction in
//! flight, as Modbus requires.
//!
//! ```no_run
//! use mbclient::{ProjectConfig, Runtime};
//!
//! # async fn demo() -> Result<(), mbclient::Error> {
//! let project = ProjectConfig::from_toml_str(
//!     r#"
//!     [[ports]]
//!     name = "plant-net"
//!     [ports.transport]
//!     type = "tcp"
//!     host = "192.168.0.10"
//!     [[ports.devices]]
//!     name = "plc1"
//!     unit = 1
//!     [[ports.devices.items]]
//!     name = "flow"
//!     mem = "holding_registers"
//!     offset = 100
//!     format = "float32"
//!     period_ms = 250
//!     "#,
//! )?;
//! let mut runtime = Runtime::from_config(project)?;
//! let flow = runtime.item_by_name("flow").expect("declared above");
//! runtime.subscribe(flow, |update| {
//!     println!("flow: {:?} ({})", update.bytes, update.status);
//! })?;
//! runtime.start()?;
//! // ...
//! runtime.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
mod device;
mod item;
mod message;
mod port;
mod runtime;
mod status;
pub mod transport;
pub mod types;

pub use config::{
    DeviceConfig, ItemConfig, Parity, PortConfig, ProjectConfig, TransportConfig,
};
pub use item::{ItemUpdate, SubscriptionId};
pub use message::{CompletionHandle, MessageResult, Payload, Request};
pub use runtime::Runtime;
pub use status::Status;
pub use types::{
    Address, DataOrder, DeviceHandle, DigitalFormat, Format, FunctionCode, ItemHandle,
    MemoryType, PortHandle, StringEncoding, StringLengthType, Timestamp,
};

/// Boundary errors: configuration problems, unknown handles, transport
/// open failures. Transaction outcomes are never `Error` — they are
/// [`Status`] values.
#[derive(Debug)]
pub enum Error {
    Config(String),
    UnknownPort,
    UnknownDevice,
    UnknownItem,
    /// The project cannot change while the runtime is running.
    RuntimeActive,
    Transport(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(text) => write!(f, "configuration error: {text}"),
            Error::UnknownPort => f.write_str("unknown port handle"),
            Error::UnknownDevice => f.write_str("unknown device handle"),
            Error::UnknownItem => f.write_str("unknown item handle"),
            Error::RuntimeActive => f.write_str("project is frozen while the runtime is running"),
            Error::Transport(text) => write!(f, "transport error: {text}"),
        }
    }
}

impl std::error::Error for Error {}
