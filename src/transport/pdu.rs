// transport/pdu.rs
//
// Request building and response parsing shared by the TCP and RTU client
// ports. PDUs only; the MBAP header and the RTU address/CRC envelope live
// in their respective transports.

use crate::codec::{pack_bits, unpack_bits};
use crate::status::Status;
use crate::types::FunctionCode;

/// Identity of an in-flight transaction. The scheduler guarantees the
/// same arguments across repeated calls; a key mismatch means the caller
/// abandoned a transaction mid-flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxnKey {
    pub function: u8,
    pub unit: u8,
    pub offset: u16,
    pub count: u16,
}

/// Outgoing request payload.
pub(crate) enum PduData<'a> {
    None,
    Bit(bool),
    Word(u16),
    Bits(&'a [bool]),
    Words(&'a [u16]),
}

/// Decoded reply payload.
#[derive(Debug, PartialEq)]
pub(crate) enum ResponseData {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Byte(u8),
    Ack,
}

/// Serialize a request PDU (function byte included).
pub(crate) fn build_request_pdu(
    function: FunctionCode,
    offset: u16,
    count: u16,
    data: PduData<'_>,
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.as_u8());
    match (function, data) {
        (
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters,
            _,
        ) => {
            pdu.extend_from_slice(&offset.to_be_bytes());
            pdu.extend_from_slice(&count.to_be_bytes());
        }
        (FunctionCode::ReadExceptionStatus, _) => {}
        (FunctionCode::WriteSingleCoil, PduData::Bit(value)) => {
            pdu.extend_from_slice(&offset.to_be_bytes());
            pdu.push(if value { 0xFF } else { 0x00 });
            pdu.push(0x00);
        }
        (FunctionCode::WriteSingleRegister, PduData::Word(value)) => {
            pdu.extend_from_slice(&offset.to_be_bytes());
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        (FunctionCode::WriteMultipleCoils, PduData::Bits(bits)) => {
            let packed = pack_bits(bits);
            pdu.extend_from_slice(&offset.to_be_bytes());
            pdu.extend_from_slice(&(bits.len() as u16).to_be_bytes());
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
        (FunctionCode::WriteMultipleRegisters, PduData::Words(words)) => {
            pdu.extend_from_slice(&offset.to_be_bytes());
            pdu.extend_from_slice(&(words.len() as u16).to_be_bytes());
            pdu.push((words.len() * 2) as u8);
            for word in words {
                pdu.extend_from_slice(&word.to_be_bytes());
            }
        }
        // argument shape mismatches cannot be built; send the bare
        // function byte and let the parser reject the echo
        _ => {}
    }
    pdu
}

/// Reply PDU length for a request, exception replies excluded.
pub(crate) fn expected_response_pdu_len(function: FunctionCode, count: u16) -> usize {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            2 + (count as usize + 7) / 8
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            2 + 2 * count as usize
        }
        FunctionCode::ReadExceptionStatus => 2,
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => 5,
    }
}

/// Decode a reply PDU. Exception replies map to their status; malformed
/// replies map to `BadInvalidResponse`.
pub(crate) fn parse_response_pdu(
    function: FunctionCode,
    offset: u16,
    count: u16,
    pdu: &[u8],
) -> Result<ResponseData, Status> {
    if pdu.len() < 2 {
        return Err(Status::BadInvalidResponse);
    }
    if pdu[0] == function.as_u8() | 0x80 {
        return Err(Status::from_exception(pdu[1]));
    }
    if pdu[0] != function.as_u8() {
        return Err(Status::BadInvalidResponse);
    }
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let byte_count = pdu[1] as usize;
            if byte_count != (count as usize + 7) / 8 || pdu.len() != 2 + byte_count {
                return Err(Status::BadInvalidResponse);
            }
            Ok(ResponseData::Bits(unpack_bits(&pdu[2..], count as usize)))
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let byte_count = pdu[1] as usize;
            if byte_count != 2 * count as usize || pdu.len() != 2 + byte_count {
                return Err(Status::BadInvalidResponse);
            }
            let words = pdu[2..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(ResponseData::Words(words))
        }
        FunctionCode::ReadExceptionStatus => Ok(ResponseData::Byte(pdu[1])),
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => {
            if pdu.len() != 5 || u16::from_be_bytes([pdu[1], pdu[2]]) != offset {
                return Err(Status::BadInvalidResponse);
            }
            Ok(ResponseData::Ack)
        }
    }
}

/// CRC-16/Modbus: poly 0xA001 (reflected 0x8005), init 0xFFFF.
/// Transmitted low byte first.
pub(crate) fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_read_request() {
        let pdu = build_request_pdu(FunctionCode::ReadHoldingRegisters, 0x006B, 3, PduData::None);
        assert_eq!(pdu, vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
        let pdu = build_request_pdu(FunctionCode::ReadCoils, 19, 19, PduData::None);
        assert_eq!(pdu, vec![0x01, 0x00, 0x13, 0x00, 0x13]);
        let pdu = build_request_pdu(FunctionCode::ReadExceptionStatus, 0, 1, PduData::None);
        assert_eq!(pdu, vec![0x07]);
    }

    #[test]
    fn test_build_write_requests() {
        let pdu = build_request_pdu(FunctionCode::WriteSingleCoil, 0x00AC, 1, PduData::Bit(true));
        assert_eq!(pdu, vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let pdu = build_request_pdu(
            FunctionCode::WriteSingleRegister,
            0x0001,
            1,
            PduData::Word(0x0003),
        );
        assert_eq!(pdu, vec![0x06, 0x00, 0x01, 0x00, 0x03]);
        let bits = [true, false, true, true, false, false, true, true, true, false];
        let pdu = build_request_pdu(
            FunctionCode::WriteMultipleCoils,
            0x0013,
            10,
            PduData::Bits(&bits),
        );
        assert_eq!(pdu, vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
        let pdu = build_request_pdu(
            FunctionCode::WriteMultipleRegisters,
            0x0001,
            2,
            PduData::Words(&[0x000A, 0x0102]),
        );
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_parse_register_reply() {
        let pdu = [0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
        let parsed = parse_response_pdu(FunctionCode::ReadHoldingRegisters, 0x6B, 3, &pdu).unwrap();
        assert_eq!(parsed, ResponseData::Words(vec![0x022B, 0x0000, 0x0064]));
    }

    #[test]
    fn test_parse_bit_reply() {
        let pdu = [0x01, 0x03, 0xCD, 0x6B, 0x05];
        let parsed = parse_response_pdu(FunctionCode::ReadCoils, 19, 19, &pdu).unwrap();
        if let ResponseData::Bits(bits) = parsed {
            assert_eq!(bits.len(), 19);
            assert!(bits[0]); // 0xCD bit 0
            assert!(!bits[1]);
            assert!(bits[18]); // 0x05 bit 2
        } else {
            panic!("expected bits");
        }
    }

    #[test]
    fn test_parse_exception_reply() {
        let pdu = [0x83, 0x02];
        let err = parse_response_pdu(FunctionCode::ReadHoldingRegisters, 0, 1, &pdu).unwrap_err();
        assert_eq!(err, Status::BadIllegalDataAddress);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // wrong function echo
        let err = parse_response_pdu(FunctionCode::ReadCoils, 0, 8, &[0x02, 0x01, 0xFF]);
        assert_eq!(err.unwrap_err(), Status::BadInvalidResponse);
        // short byte count
        let err = parse_response_pdu(FunctionCode::ReadHoldingRegisters, 0, 2, &[0x03, 0x02, 0, 1]);
        assert_eq!(err.unwrap_err(), Status::BadInvalidResponse);
        // write echo with wrong offset
        let err = parse_response_pdu(
            FunctionCode::WriteSingleRegister,
            5,
            1,
            &[0x06, 0x00, 0x09, 0x00, 0x01],
        );
        assert_eq!(err.unwrap_err(), Status::BadInvalidResponse);
    }

    #[test]
    fn test_crc16_known_vector() {
        // unit 1, read holding registers 0..2: CRC 0x840A transmitted 0A 84
        let frame = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x02];
        let crc = crc16_modbus(&frame);
        assert_eq!(crc.to_le_bytes(), [0xC4, 0x0B]);
    }

    #[test]
    fn test_expected_lengths() {
        assert_eq!(expected_response_pdu_len(FunctionCode::ReadCoils, 19), 5);
        assert_eq!(
            expected_response_pdu_len(FunctionCode::ReadHoldingRegisters, 3),
            8
        );
        assert_eq!(expected_response_pdu_len(FunctionCode::ReadExceptionStatus, 1), 2);
        assert_eq!(expected_response_pdu_len(FunctionCode::WriteMultipleCoils, 10), 5);
    }
}
