// transport/rtu.rs
//
// Modbus RTU client port over a serial line. The serial handle runs with
// a 1 ms timeout so reads behave like polls; frame boundaries come from
// the expected reply length, validated by unit id and CRC-16/Modbus.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};

use super::pdu::{
    build_request_pdu, crc16_modbus, expected_response_pdu_len, parse_response_pdu, PduData,
    ResponseData, TxnKey,
};
use super::ClientPort;
use crate::config::Parity;
use crate::status::Status;
use crate::types::FunctionCode;
use crate::Error;

/// Poll granularity of the underlying serial reads.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

struct Txn {
    key: TxnKey,
    function: FunctionCode,
    request: Vec<u8>,
    written: usize,
    response: Vec<u8>,
    deadline: Instant,
}

pub struct RtuClientPort {
    path: String,
    serial: Box<dyn SerialPort>,
    response_timeout: Duration,
    txn: Option<Txn>,
    last_error: String,
}

impl RtuClientPort {
    pub fn open(
        path: &str,
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: Parity,
        timeout_ms: u64,
    ) -> Result<Self, Error> {
        let serial = serialport::new(path, baud_rate)
            .data_bits(match data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            })
            .stop_bits(match stop_bits {
                2 => StopBits::Two,
                _ => StopBits::One,
            })
            .parity(match parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            })
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| Error::Transport(format!("cannot open {path}: {e}")))?;
        debug!("modbus rtu: opened {path} at {baud_rate} baud");
        Ok(RtuClientPort {
            path: path.to_string(),
            serial,
            response_timeout: Duration::from_millis(timeout_ms.max(1)),
            txn: None,
            last_error: String::new(),
        })
    }

    fn fail_io(&mut self, text: String) -> Result<Vec<u8>, Status> {
        warn!("modbus rtu {}: {}", self.path, text);
        self.last_error = text;
        self.txn = None;
        Err(Status::BadNotConnected)
    }

    fn check_deadline(&mut self) -> Result<Vec<u8>, Status> {
        let expired = self
            .txn
            .as_ref()
            .map_or(true, |t| Instant::now() >= t.deadline);
        if expired {
            self.last_error = format!(
                "no response within {} ms",
                self.response_timeout.as_millis()
            );
            self.txn = None;
            let _ = self.serial.clear(ClearBuffer::Input);
            Err(Status::BadTimeout)
        } else {
            Err(Status::Processing)
        }
    }

    fn transaction(
        &mut self,
        key: TxnKey,
        function: FunctionCode,
        build: impl FnOnce() -> Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        if let Some(txn) = &self.txn {
            if txn.key != key {
                if Instant::now() >= txn.deadline {
                    // whoever started this stopped driving it; reclaim
                    // the line
                    self.last_error = "previous transaction abandoned".to_string();
                    self.txn = None;
                    let _ = self.serial.clear(ClearBuffer::Input);
                } else {
                    // half-duplex: the line is busy with another
                    // device's transaction
                    return Err(Status::Processing);
                }
            }
        }
        if self.txn.is_none() {
            // stale bytes from an earlier aborted exchange would shift
            // the frame boundary
            let _ = self.serial.clear(ClearBuffer::Input);
            let pdu = build();
            let mut adu = Vec::with_capacity(3 + pdu.len());
            adu.push(key.unit);
            adu.extend_from_slice(&pdu);
            let crc = crc16_modbus(&adu);
            adu.extend_from_slice(&crc.to_le_bytes());
            self.txn = Some(Txn {
                key,
                function,
                request: adu,
                written: 0,
                response: Vec::new(),
                deadline: Instant::now() + self.response_timeout,
            });
        }
        self.drive()
    }

    fn drive(&mut self) -> Result<Vec<u8>, Status> {
        // push unsent request bytes
        loop {
            let Some(txn) = self.txn.as_mut() else {
                return Err(Status::Bad);
            };
            if txn.written >= txn.request.len() {
                break;
            }
            match self.serial.write(&txn.request[txn.written..]) {
                Ok(0) => return self.fail_io("serial line closed while sending".to_string()),
                Ok(n) => txn.written += n,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return self.check_deadline()
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail_io(format!("send failed: {e}")),
            }
        }
        // pull whatever reply bytes are available
        let mut buf = [0u8; 256];
        loop {
            match self.serial.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(txn) = self.txn.as_mut() {
                        txn.response.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail_io(format!("receive failed: {e}")),
            }
        }
        // a full frame yet? exception replies are 5 bytes, normal replies
        // follow from the request
        let mut settled: Option<Result<Vec<u8>, Status>> = None;
        if let Some(txn) = self.txn.as_ref() {
            if txn.response.len() >= 2 {
                let expected = if txn.response[1] & 0x80 != 0 {
                    5
                } else {
                    1 + expected_response_pdu_len(txn.function, txn.key.count) + 2
                };
                if txn.response.len() >= expected {
                    let frame = &txn.response[..expected];
                    let crc = crc16_modbus(&frame[..expected - 2]);
                    let received =
                        u16::from_le_bytes([frame[expected - 2], frame[expected - 1]]);
                    if crc != received {
                        settled = Some(Err(Status::BadCrc));
                    } else if frame[0] != txn.key.unit {
                        settled = Some(Err(Status::BadInvalidResponse));
                    } else {
                        settled = Some(Ok(frame[1..expected - 2].to_vec()));
                    }
                }
            }
        }
        match settled {
            Some(Ok(pdu)) => {
                self.txn = None;
                Ok(pdu)
            }
            Some(Err(status)) => {
                self.last_error = match status {
                    Status::BadCrc => "CRC check failed".to_string(),
                    _ => "reply frame mismatch".to_string(),
                };
                self.txn = None;
                let _ = self.serial.clear(ClearBuffer::Input);
                Err(status)
            }
            None => self.check_deadline(),
        }
    }

    fn settle_parse(
        &mut self,
        result: Result<ResponseData, Status>,
    ) -> (Status, Option<ResponseData>) {
        match result {
            Ok(data) => (Status::Good, Some(data)),
            Err(status) => {
                if status.exception_code().is_some() {
                    self.last_error = format!("exception response: {status}");
                } else {
                    self.last_error = "malformed response PDU".to_string();
                }
                (status, None)
            }
        }
    }
}

impl ClientPort for RtuClientPort {
    fn read_coils(&mut self, unit: u8, offset: u16, count: u16, out: &mut [bool]) -> Status {
        let function = FunctionCode::ReadCoils;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(function, offset, count, &pdu));
        if let Some(ResponseData::Bits(bits)) = data {
            for (slot, bit) in out.iter_mut().zip(bits) {
                *slot = bit;
            }
        }
        status
    }

    fn read_discrete_inputs(
        &mut self,
        unit: u8,
        offset: u16,
        count: u16,
        out: &mut [bool],
    ) -> Status {
        let function = FunctionCode::ReadDiscreteInputs;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(function, offset, count, &pdu));
        if let Some(ResponseData::Bits(bits)) = data {
            for (slot, bit) in out.iter_mut().zip(bits) {
                *slot = bit;
            }
        }
        status
    }

    fn read_input_registers(
        &mut self,
        unit: u8,
        offset: u16,
        count: u16,
        out: &mut [u16],
    ) -> Status {
        let function = FunctionCode::ReadInputRegisters;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(function, offset, count, &pdu));
        if let Some(ResponseData::Words(words)) = data {
            for (slot, word) in out.iter_mut().zip(words) {
                *slot = word;
            }
        }
        status
    }

    fn read_holding_registers(
        &mut self,
        unit: u8,
        offset: u16,
        count: u16,
        out: &mut [u16],
    ) -> Status {
        let function = FunctionCode::ReadHoldingRegisters;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(function, offset, count, &pdu));
        if let Some(ResponseData::Words(words)) = data {
            for (slot, word) in out.iter_mut().zip(words) {
                *slot = word;
            }
        }
        status
    }

    fn read_exception_status(&mut self, unit: u8, out: &mut u8) -> Status {
        let function = FunctionCode::ReadExceptionStatus;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset: 0,
            count: 1,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, 0, 1, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(function, 0, 1, &pdu));
        if let Some(ResponseData::Byte(byte)) = data {
            *out = byte;
        }
        status
    }

    fn write_single_coil(&mut self, unit: u8, offset: u16, value: bool) -> Status {
        let function = FunctionCode::WriteSingleCoil;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count: 1,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, 1, PduData::Bit(value))
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(function, offset, 1, &pdu)).0
    }

    fn write_single_register(&mut self, unit: u8, offset: u16, value: u16) -> Status {
        let function = FunctionCode::WriteSingleRegister;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count: 1,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, 1, PduData::Word(value))
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(function, offset, 1, &pdu)).0
    }

    fn write_multiple_coils(&mut self, unit: u8, offset: u16, values: &[bool]) -> Status {
        let function = FunctionCode::WriteMultipleCoils;
        let count = values.len() as u16;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::Bits(values))
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(function, offset, count, &pdu)).0
    }

    fn write_multiple_registers(&mut self, unit: u8, offset: u16, values: &[u16]) -> Status {
        let function = FunctionCode::WriteMultipleRegisters;
        let count = values.len() as u16;
        let key = TxnKey {
            function: function.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, function, || {
            build_request_pdu(function, offset, count, PduData::Words(values))
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(function, offset, count, &pdu)).0
    }

    fn last_error_text(&self) -> String {
        self.last_error.clone()
    }
}
