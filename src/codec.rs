// codec.rs
//
// Conversions between wire-level register/bit data and the canonical byte
// layout stored in item staging buffers, plus display rendering.
//
// Canonical layout: the value's bytes least-significant first. A device's
// byte order says whether each 16-bit register arrives with its bytes in
// standard (most significant first) or swapped order; the register order
// says whether a multi-register value puts its low or high word at the
// lower address.

use crate::types::{
    DataOrder, DigitalFormat, Format, StringEncoding, StringLengthType,
};

/// Convert registers as read off the wire (lowest address first) into
/// canonical value bytes.
pub fn words_to_bytes(words: &[u16], byte_order: DataOrder, register_order: DataOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    let ordered: Box<dyn Iterator<Item = &u16>> = match register_order {
        DataOrder::LessSignifiedFirst => Box::new(words.iter()),
        DataOrder::MostSignifiedFirst => Box::new(words.iter().rev()),
    };
    for &w in ordered {
        let w = match byte_order {
            DataOrder::MostSignifiedFirst => w,
            DataOrder::LessSignifiedFirst => w.swap_bytes(),
        };
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// Convert canonical value bytes into registers in wire order (lowest
/// address first). Odd-length input is zero-padded to a full register.
pub fn bytes_to_words(bytes: &[u8], byte_order: DataOrder, register_order: DataOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks(2)
        .map(|c| {
            let lo = c[0];
            let hi = c.get(1).copied().unwrap_or(0);
            let w = u16::from_le_bytes([lo, hi]);
            match byte_order {
                DataOrder::MostSignifiedFirst => w,
                DataOrder::LessSignifiedFirst => w.swap_bytes(),
            }
        })
        .collect();
    if register_order == DataOrder::MostSignifiedFirst {
        words.reverse();
    }
    words
}

/// Pack bits into bytes, 8 per byte, LSB first within each byte (the
/// Modbus convention for coil payloads).
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits from LSB-first packed bytes. Missing trailing bytes
/// read as zero.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map_or(false, |&b| (b >> (i % 8)) & 1 == 1))
        .collect()
}

fn le_u16(bytes: &[u8]) -> u16 {
    let mut a = [0u8; 2];
    for (i, b) in bytes.iter().take(2).enumerate() {
        a[i] = *b;
    }
    u16::from_le_bytes(a)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    for (i, b) in bytes.iter().take(4).enumerate() {
        a[i] = *b;
    }
    u32::from_le_bytes(a)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    for (i, b) in bytes.iter().take(8).enumerate() {
        a[i] = *b;
    }
    u64::from_le_bytes(a)
}

/// Cascaded rendering settings, fully resolved (Item -> Device -> Global).
#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub digital_format: DigitalFormat,
    pub separator: String,
    pub string_length_type: StringLengthType,
    pub string_encoding: StringEncoding,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            digital_format: DigitalFormat::Hex,
            separator: " ".to_string(),
            string_length_type: StringLengthType::ZeroTerminated,
            string_encoding: StringEncoding::Utf8,
        }
    }
}

/// Render canonical item bytes as the display string for the given format.
pub fn render_value(format: Format, bytes: &[u8], opts: &RenderOptions) -> String {
    match format {
        Format::Bool => {
            let v = bytes.first().map_or(false, |&b| b != 0);
            if v { "1".to_string() } else { "0".to_string() }
        }
        Format::Bin16 => format!("{:016b}", le_u16(bytes)),
        Format::Dec16 => format!("{}", le_u16(bytes) as i16),
        Format::UDec16 => format!("{}", le_u16(bytes)),
        Format::Hex16 => format!("{:04X}", le_u16(bytes)),
        Format::Bin32 => format!("{:032b}", le_u32(bytes)),
        Format::Dec32 => format!("{}", le_u32(bytes) as i32),
        Format::UDec32 => format!("{}", le_u32(bytes)),
        Format::Hex32 => format!("{:08X}", le_u32(bytes)),
        Format::Bin64 => format!("{:064b}", le_u64(bytes)),
        Format::Dec64 => format!("{}", le_u64(bytes) as i64),
        Format::UDec64 => format!("{}", le_u64(bytes)),
        Format::Hex64 => format!("{:016X}", le_u64(bytes)),
        Format::Float32 => format!("{}", f32::from_le_bytes(le_u32(bytes).to_le_bytes())),
        Format::Double64 => format!("{}", f64::from_le_bytes(le_u64(bytes).to_le_bytes())),
        Format::ByteArray => render_byte_array(bytes, opts),
        Format::String => render_string(bytes, opts),
    }
}

fn render_byte_array(bytes: &[u8], opts: &RenderOptions) -> String {
    if opts.separator.is_empty() && opts.digital_format == DigitalFormat::Hex {
        return hex::encode_upper(bytes);
    }
    let rendered: Vec<String> = bytes
        .iter()
        .map(|&b| match opts.digital_format {
            DigitalFormat::Bin => format!("{b:08b}"),
            DigitalFormat::Oct => format!("{b:03o}"),
            DigitalFormat::Dec => format!("{}", b as i8),
            DigitalFormat::UDec => format!("{b}"),
            DigitalFormat::Hex => format!("{b:02X}"),
        })
        .collect();
    rendered.join(&opts.separator)
}

fn render_string(bytes: &[u8], opts: &RenderOptions) -> String {
    match opts.string_encoding {
        StringEncoding::Utf8 => {
            let end = match opts.string_length_type {
                StringLengthType::ZeroTerminated => {
                    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
                }
                StringLengthType::FullLength => bytes.len(),
            };
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        StringEncoding::Utf16 => {
            let mut units: Vec<u16> = bytes.chunks(2).map(le_u16).collect();
            if opts.string_length_type == StringLengthType::ZeroTerminated {
                if let Some(pos) = units.iter().position(|&u| u == 0) {
                    units.truncate(pos);
                }
            }
            String::from_utf16_lossy(&units)
        }
        StringEncoding::Latin1 => {
            let end = match opts.string_length_type {
                StringLengthType::ZeroTerminated => {
                    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
                }
                StringLengthType::FullLength => bytes.len(),
            };
            bytes[..end].iter().map(|&b| b as char).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataOrder::*;

    #[test]
    fn test_words_to_bytes_orders() {
        // value 0x11223344 spread over two registers
        // standard bytes, low word at low address: [0x3344, 0x1122]
        assert_eq!(
            words_to_bytes(&[0x3344, 0x1122], MostSignifiedFirst, LessSignifiedFirst),
            vec![0x44, 0x33, 0x22, 0x11]
        );
        // standard bytes, high word first on the wire
        assert_eq!(
            words_to_bytes(&[0x1122, 0x3344], MostSignifiedFirst, MostSignifiedFirst),
            vec![0x44, 0x33, 0x22, 0x11]
        );
        // swapped bytes within each register
        assert_eq!(
            words_to_bytes(&[0x4433, 0x2211], LessSignifiedFirst, LessSignifiedFirst),
            vec![0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_round_trip_all_orders() {
        let value = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        for bo in [LessSignifiedFirst, MostSignifiedFirst] {
            for ro in [LessSignifiedFirst, MostSignifiedFirst] {
                let words = bytes_to_words(&value, bo, ro);
                assert_eq!(words.len(), 4);
                assert_eq!(words_to_bytes(&words, bo, ro), value.to_vec());
            }
        }
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, false, true, true, false, false, false, true];
        let bytes = pack_bits(&bits);
        assert_eq!(bytes, vec![0b0001_1001, 0b0000_0001]);
        assert_eq!(unpack_bits(&bytes, 9), bits.to_vec());
        // truncated byte input reads as zero bits
        assert_eq!(unpack_bits(&[0x01], 9), {
            let mut v = vec![false; 9];
            v[0] = true;
            v
        });
    }

    #[test]
    fn test_render_numeric() {
        let opts = RenderOptions::default();
        assert_eq!(render_value(Format::Dec16, &[0xFF, 0xFF], &opts), "-1");
        assert_eq!(render_value(Format::UDec16, &[0xFF, 0xFF], &opts), "65535");
        assert_eq!(render_value(Format::Hex16, &[0x34, 0x12], &opts), "1234");
        assert_eq!(
            render_value(Format::Hex32, &[0x44, 0x33, 0x22, 0x11], &opts),
            "11223344"
        );
        let f = 12.5f32.to_le_bytes();
        assert_eq!(render_value(Format::Float32, &f, &opts), "12.5");
        assert_eq!(render_value(Format::Bool, &[1, 0], &opts), "1");
        assert_eq!(render_value(Format::Bool, &[0], &opts), "0");
    }

    #[test]
    fn test_render_byte_array() {
        let opts = RenderOptions {
            digital_format: DigitalFormat::Hex,
            separator: " ".to_string(),
            ..RenderOptions::default()
        };
        assert_eq!(render_value(Format::ByteArray, &[0xDE, 0xAD], &opts), "DE AD");
        let packed = RenderOptions {
            separator: String::new(),
            ..opts
        };
        assert_eq!(render_value(Format::ByteArray, &[0xDE, 0xAD], &packed), "DEAD");
        let dec = RenderOptions {
            digital_format: DigitalFormat::UDec,
            separator: ",".to_string(),
            ..RenderOptions::default()
        };
        assert_eq!(render_value(Format::ByteArray, &[1, 2, 255], &dec), "1,2,255");
    }

    #[test]
    fn test_render_string() {
        let opts = RenderOptions::default();
        assert_eq!(
            render_value(Format::String, b"pump-1\0\0", &opts),
            "pump-1"
        );
        let full = RenderOptions {
            string_length_type: StringLengthType::FullLength,
            ..RenderOptions::default()
        };
        assert_eq!(
            render_value(Format::String, b"pump-1\0\0", &full),
            "pump-1\0\0"
        );
        let latin = RenderOptions {
            string_encoding: StringEncoding::Latin1,
            ..RenderOptions::default()
        };
        assert_eq!(render_value(Format::String, &[0x41, 0xE9, 0x00], &latin), "Aé");
        let utf16 = RenderOptions {
            string_encoding: StringEncoding::Utf16,
            ..RenderOptions::default()
        };
        let data = [0x41, 0x00, 0x42, 0x00, 0x00, 0x00];
        assert_eq!(render_value(Format::String, &data, &utf16), "AB");
    }
}
