// transport/tcp.rs
//
// Modbus TCP client port. Non-blocking socket driven by the scheduler's
// repeated calls: each call pushes unsent request bytes, pulls whatever
// reply bytes have arrived, and settles once a full MBAP frame is in.
// A lost connection is re-established lazily at the next transaction.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::pdu::{
    build_request_pdu, parse_response_pdu, PduData, ResponseData, TxnKey,
};
use super::ClientPort;
use crate::status::Status;
use crate::types::FunctionCode;
use crate::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

struct Txn {
    key: TxnKey,
    request: Vec<u8>,
    written: usize,
    response: Vec<u8>,
    deadline: Instant,
    tid: u16,
}

pub struct TcpClientPort {
    host: String,
    port: u16,
    response_timeout: Duration,
    stream: Option<TcpStream>,
    txn: Option<Txn>,
    next_tid: u16,
    last_error: String,
}

impl TcpClientPort {
    /// Connect to the server. Connection failure here is fatal for the
    /// owning port; later disconnections reconnect lazily.
    pub fn open(host: &str, port: u16, timeout_ms: u64) -> Result<Self, Error> {
        let mut client = TcpClientPort {
            host: host.to_string(),
            port,
            response_timeout: Duration::from_millis(timeout_ms.max(1)),
            stream: None,
            txn: None,
            next_tid: 0,
            last_error: String::new(),
        };
        if !client.ensure_connected() {
            return Err(Error::Transport(client.last_error));
        }
        Ok(client)
    }

    fn connect(&self) -> Result<TcpStream, String> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve {}:{}: {e}", self.host, self.port))?;
        let mut last = format!("no address for {}:{}", self.host, self.port);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(|e| format!("set_nonblocking failed: {e}"))?;
                    let _ = stream.set_nodelay(true);
                    debug!("modbus tcp: connected to {addr}");
                    return Ok(stream);
                }
                Err(e) => last = format!("connect to {addr} failed: {e}"),
            }
        }
        Err(last)
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match self.connect() {
            Ok(stream) => {
                self.stream = Some(stream);
                true
            }
            Err(text) => {
                self.last_error = text;
                false
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn fail_io(&mut self, text: String) -> Result<Vec<u8>, Status> {
        warn!("modbus tcp {}:{}: {}", self.host, self.port, text);
        self.last_error = text;
        self.txn = None;
        self.disconnect();
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
            // drop the connection so a late reply cannot desynchronize
            // the next transaction
            self.disconnect();
            Err(Status::BadTimeout)
        } else {
            Err(Status::Processing)
        }
    }

    /// Start or continue the transaction identified by `key`. Returns the
    /// reply PDU once it has fully arrived.
    fn transaction(
        &mut self,
        key: TxnKey,
        build: impl FnOnce() -> Vec<u8>,
    ) -> Result<Vec<u8>, Status> {
        if let Some(txn) = &self.txn {
            if txn.key != key {
                if Instant::now() >= txn.deadline {
                    // whoever started this stopped driving it; reclaim
                    // the line
                    self.last_error = "previous transaction abandoned".to_string();
                    self.txn = None;
                    self.disconnect();
                } else {
                    // half-duplex: the line is busy with another
                    // device's transaction
                    return Err(Status::Processing);
                }
            }
        }
        if self.txn.is_none() {
            if !self.ensure_connected() {
                return Err(Status::BadNotConnected);
            }
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            let pdu = build();
            let mut adu = Vec::with_capacity(7 + pdu.len());
            adu.extend_from_slice(&tid.to_be_bytes());
            adu.extend_from_slice(&0u16.to_be_bytes()); // protocol id
            adu.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
            adu.push(key.unit);
            adu.extend_from_slice(&pdu);
            self.txn = Some(Txn {
                key,
                request: adu,
                written: 0,
                response: Vec::new(),
                deadline: Instant::now() + self.response_timeout,
                tid,
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
            let Some(stream) = self.stream.as_mut() else {
                return self.fail_io("not connected".to_string());
            };
            match stream.write(&txn.request[txn.written..]) {
                Ok(0) => return self.fail_io("connection closed while sending".to_string()),
                Ok(n) => txn.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return self.check_deadline(),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail_io(format!("send failed: {e}")),
            }
        }
        // pull whatever reply bytes are available
        let mut buf = [0u8; 512];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return self.fail_io("not connected".to_string());
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    return self.fail_io("connection closed while waiting for reply".to_string())
                }
                Ok(n) => {
                    if let Some(txn) = self.txn.as_mut() {
                        txn.response.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail_io(format!("receive failed: {e}")),
            }
        }
        // a full MBAP frame yet?
        let mut settled: Option<Result<Vec<u8>, Status>> = None;
        if let Some(txn) = self.txn.as_ref() {
            if txn.response.len() >= 7 {
                let length = u16::from_be_bytes([txn.response[4], txn.response[5]]) as usize;
                if length < 2 {
                    settled = Some(Err(Status::BadInvalidResponse));
                } else if txn.response.len() >= 6 + length {
                    let tid = u16::from_be_bytes([txn.response[0], txn.response[1]]);
                    let proto = u16::from_be_bytes([txn.response[2], txn.response[3]]);
                    let unit = txn.response[6];
                    if proto != 0 || tid != txn.tid || unit != txn.key.unit {
                        settled = Some(Err(Status::BadInvalidResponse));
                    } else {
                        settled = Some(Ok(txn.response[7..6 + length].to_vec()));
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
                self.last_error = "MBAP frame mismatch".to_string();
                self.txn = None;
                self.disconnect();
                Err(status)
            }
            None => self.check_deadline(),
        }
    }

    fn settle_parse(&mut self, result: Result<ResponseData, Status>) -> (Status, Option<ResponseData>) {
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

impl ClientPort for TcpClientPort {
    fn read_coils(&mut self, unit: u8, offset: u16, count: u16, out: &mut [bool]) -> Status {
        let key = TxnKey {
            function: FunctionCode::ReadCoils.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(FunctionCode::ReadCoils, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) =
            self.settle_parse(parse_response_pdu(FunctionCode::ReadCoils, offset, count, &pdu));
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
        let key = TxnKey {
            function: FunctionCode::ReadDiscreteInputs.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(FunctionCode::ReadDiscreteInputs, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(
            FunctionCode::ReadDiscreteInputs,
            offset,
            count,
            &pdu,
        ));
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
        let key = TxnKey {
            function: FunctionCode::ReadInputRegisters.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(FunctionCode::ReadInputRegisters, offset, count, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(
            FunctionCode::ReadInputRegisters,
            offset,
            count,
            &pdu,
        ));
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
        let key = TxnKey {
            function: FunctionCode::ReadHoldingRegisters.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(
                FunctionCode::ReadHoldingRegisters,
                offset,
                count,
                PduData::None,
            )
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(
            FunctionCode::ReadHoldingRegisters,
            offset,
            count,
            &pdu,
        ));
        if let Some(ResponseData::Words(words)) = data {
            for (slot, word) in out.iter_mut().zip(words) {
                *slot = word;
            }
        }
        status
    }

    fn read_exception_status(&mut self, unit: u8, out: &mut u8) -> Status {
        let key = TxnKey {
            function: FunctionCode::ReadExceptionStatus.as_u8(),
            unit,
            offset: 0,
            count: 1,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(FunctionCode::ReadExceptionStatus, 0, 1, PduData::None)
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        let (status, data) = self.settle_parse(parse_response_pdu(
            FunctionCode::ReadExceptionStatus,
            0,
            1,
            &pdu,
        ));
        if let Some(ResponseData::Byte(byte)) = data {
            *out = byte;
        }
        status
    }

    fn write_single_coil(&mut self, unit: u8, offset: u16, value: bool) -> Status {
        let key = TxnKey {
            function: FunctionCode::WriteSingleCoil.as_u8(),
            unit,
            offset,
            count: 1,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(FunctionCode::WriteSingleCoil, offset, 1, PduData::Bit(value))
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(FunctionCode::WriteSingleCoil, offset, 1, &pdu))
            .0
    }

    fn write_single_register(&mut self, unit: u8, offset: u16, value: u16) -> Status {
        let key = TxnKey {
            function: FunctionCode::WriteSingleRegister.as_u8(),
            unit,
            offset,
            count: 1,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(
                FunctionCode::WriteSingleRegister,
                offset,
                1,
                PduData::Word(value),
            )
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(
            FunctionCode::WriteSingleRegister,
            offset,
            1,
            &pdu,
        ))
        .0
    }

    fn write_multiple_coils(&mut self, unit: u8, offset: u16, values: &[bool]) -> Status {
        let count = values.len() as u16;
        let key = TxnKey {
            function: FunctionCode::WriteMultipleCoils.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(
                FunctionCode::WriteMultipleCoils,
                offset,
                count,
                PduData::Bits(values),
            )
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(
            FunctionCode::WriteMultipleCoils,
            offset,
            count,
            &pdu,
        ))
        .0
    }

    fn write_multiple_registers(&mut self, unit: u8, offset: u16, values: &[u16]) -> Status {
        let count = values.len() as u16;
        let key = TxnKey {
            function: FunctionCode::WriteMultipleRegisters.as_u8(),
            unit,
            offset,
            count,
        };
        let pdu = match self.transaction(key, || {
            build_request_pdu(
                FunctionCode::WriteMultipleRegisters,
                offset,
                count,
                PduData::Words(values),
            )
        }) {
            Ok(pdu) => pdu,
            Err(status) => return status,
        };
        self.settle_parse(parse_response_pdu(
            FunctionCode::WriteMultipleRegisters,
            offset,
            count,
            &pdu,
        ))
        .0
    }

    fn last_error_text(&self) -> String {
        self.last_error.clone()
    }
}
