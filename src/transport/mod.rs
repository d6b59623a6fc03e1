// transport/mod.rs
//
// Client-port abstraction the scheduler drives, plus the TCP and RTU
// implementations.
//
// Contract: the first call for a new transaction starts transmission and
// returns Processing; every further call with the same arguments drives
// the exchange forward until it settles on Good or a Bad variant. Callers
// must not change arguments between calls of one transaction. The line is
// half-duplex: while one transaction is in flight, calls carrying other
// arguments also return Processing until the line frees up.

mod pdu;
pub mod rtu;
pub mod tcp;

pub use rtu::RtuClientPort;
pub use tcp::TcpClientPort;

use crate::config::TransportConfig;
use crate::status::Status;
use crate::Error;

/// One Modbus client endpoint (a TCP connection or a serial line) shared
/// by every device on the port.
pub trait ClientPort: Send {
    fn read_coils(&mut self, unit: u8, offset: u16, count: u16, out: &mut [bool]) -> Status;
    fn read_discrete_inputs(&mut self, unit: u8, offset: u16, count: u16, out: &mut [bool])
        -> Status;
    fn read_input_registers(&mut self, unit: u8, offset: u16, count: u16, out: &mut [u16])
        -> Status;
    fn read_holding_registers(
        &mut self,
        unit: u8,
        offset: u16,
        count: u16,
        out: &mut [u16],
    ) -> Status;
    fn read_exception_status(&mut self, unit: u8, out: &mut u8) -> Status;
    fn write_single_coil(&mut self, unit: u8, offset: u16, value: bool) -> Status;
    fn write_single_register(&mut self, unit: u8, offset: u16, value: u16) -> Status;
    fn write_multiple_coils(&mut self, unit: u8, offset: u16, values: &[bool]) -> Status;
    fn write_multiple_registers(&mut self, unit: u8, offset: u16, values: &[u16]) -> Status;
    /// Human-readable description of the most recent failure.
    fn last_error_text(&self) -> String;
}

/// Open the transport a port is configured with. Failure here is fatal
/// for the port.
pub fn open(config: &TransportConfig) -> Result<Box<dyn ClientPort>, Error> {
    match config {
        TransportConfig::Tcp {
            host,
            port,
            timeout_ms,
        } => Ok(Box::new(TcpClientPort::open(host, *port, *timeout_ms)?)),
        TransportConfig::Rtu {
            path,
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            timeout_ms,
        } => Ok(Box::new(RtuClientPort::open(
            path,
            *baud_rate,
            *data_bits,
            *stop_bits,
            *parity,
            *timeout_ms,
        )?)),
    }
}
