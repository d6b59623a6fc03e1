// status.rs
//
// Tri-state result codes for Modbus transactions. Every transport and
// scheduler operation resolves to exactly one of three families:
// Good (done), Processing (transaction accepted but not finished yet),
// or one of the Bad variants.

use serde::{Deserialize, Serialize};

/// Outcome of a Modbus operation.
///
/// `Processing` is not an error: it marks a suspension point where the
/// transport has accepted a request but the reply has not arrived. Callers
/// must keep driving the same operation with identical arguments until a
/// terminal code comes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Good,
    Processing,
    /// Request was invalid before it reached the wire (unknown function
    /// code, write to a read-only table, malformed payload).
    Bad,
    // Modbus exception responses (exception code in the reply PDU)
    BadIllegalFunction,
    BadIllegalDataAddress,
    BadIllegalDataValue,
    BadServerDeviceFailure,
    BadAcknowledge,
    BadServerDeviceBusy,
    BadNegativeAcknowledge,
    BadMemoryParityError,
    BadGatewayPathUnavailable,
    BadGatewayTargetFailedToRespond,
    // Transport-level failures
    BadTimeout,
    BadCrc,
    BadNotConnected,
    BadInvalidResponse,
    /// Runtime shut down before the message was sent.
    BadAborted,
}

impl Status {
    pub fn is_good(self) -> bool {
        self == Status::Good
    }

    pub fn is_processing(self) -> bool {
        self == Status::Processing
    }

    pub fn is_bad(self) -> bool {
        !self.is_good() && !self.is_processing()
    }

    /// Map a Modbus exception code from a reply PDU.
    /// Unknown codes collapse to the generic `Bad`.
    pub fn from_exception(code: u8) -> Self {
        match code {
            1 => Status::BadIllegalFunction,
            2 => Status::BadIllegalDataAddress,
            3 => Status::BadIllegalDataValue,
            4 => Status::BadServerDeviceFailure,
            5 => Status::BadAcknowledge,
            6 => Status::BadServerDeviceBusy,
            7 => Status::BadNegativeAcknowledge,
            8 => Status::BadMemoryParityError,
            10 => Status::BadGatewayPathUnavailable,
            11 => Status::BadGatewayTargetFailedToRespond,
            _ => Status::Bad,
        }
    }

    /// The Modbus exception code this status came from, if any.
    pub fn exception_code(self) -> Option<u8> {
        match self {
            Status::BadIllegalFunction => Some(1),
            Status::BadIllegalDataAddress => Some(2),
            Status::BadIllegalDataValue => Some(3),
            Status::BadServerDeviceFailure => Some(4),
            Status::BadAcknowledge => Some(5),
            Status::BadServerDeviceBusy => Some(6),
            Status::BadNegativeAcknowledge => Some(7),
            Status::BadMemoryParityError => Some(8),
            Status::BadGatewayPathUnavailable => Some(10),
            Status::BadGatewayTargetFailedToRespond => Some(11),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Good => "Good",
            Status::Processing => "Processing",
            Status::Bad => "Bad",
            Status::BadIllegalFunction => "Illegal Function",
            Status::BadIllegalDataAddress => "Illegal Data Address",
            Status::BadIllegalDataValue => "Illegal Data Value",
            Status::BadServerDeviceFailure => "Server Device Failure",
            Status::BadAcknowledge => "Acknowledge",
            Status::BadServerDeviceBusy => "Server Device Busy",
            Status::BadNegativeAcknowledge => "Negative Acknowledge",
            Status::BadMemoryParityError => "Memory Parity Error",
            Status::BadGatewayPathUnavailable => "Gateway Path Unavailable",
            Status::BadGatewayTargetFailedToRespond => "Gateway Target Failed To Respond",
            Status::BadTimeout => "Timeout",
            Status::BadCrc => "CRC Error",
            Status::BadNotConnected => "Not Connected",
            Status::BadInvalidResponse => "Invalid Response",
            Status::BadAborted => "Aborted",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_are_exclusive() {
        let all = [
            Status::Good,
            Status::Processing,
            Status::Bad,
            Status::BadIllegalFunction,
            Status::BadIllegalDataAddress,
            Status::BadIllegalDataValue,
            Status::BadServerDeviceFailure,
            Status::BadAcknowledge,
            Status::BadServerDeviceBusy,
            Status::BadNegativeAcknowledge,
            Status::BadMemoryParityError,
            Status::BadGatewayPathUnavailable,
            Status::BadGatewayTargetFailedToRespond,
            Status::BadTimeout,
            Status::BadCrc,
            Status::BadNotConnected,
            Status::BadInvalidResponse,
            Status::BadAborted,
        ];
        for s in all {
            let count = [s.is_good(), s.is_processing(), s.is_bad()]
                .iter()
                .filter(|&&p| p)
                .count();
            assert_eq!(count, 1, "{s:?} must satisfy exactly one predicate");
        }
    }

    #[test]
    fn test_exception_round_trip() {
        for code in [1u8, 2, 3, 4, 5, 6, 7, 8, 10, 11] {
            let status = Status::from_exception(code);
            assert!(status.is_bad());
            assert_eq!(status.exception_code(), Some(code));
        }
        assert_eq!(Status::from_exception(99), Status::Bad);
        assert_eq!(Status::Bad.exception_code(), None);
        assert_eq!(Status::BadTimeout.exception_code(), None);
    }
}
