/// Modbus TCP wire definitions
///
/// Function codes, fixed frame offsets and the MBAP header view used by the
/// frame codec. All offsets are relative to the first byte of the frame and
/// every multi-byte field is big-endian.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// MBAP header size: transaction id, protocol id, length, unit id
pub const MBAP_HEADER_SIZE: usize = 7;

/// Header bytes copied verbatim into every response (transaction id, protocol id, length)
pub const ECHOED_HEADER_LEN: usize = 6;

/// Offset of the unit identifier
pub const UNIT_ID_OFFSET: usize = 6;

/// Offset of the function code
pub const FUNCTION_CODE_OFFSET: usize = 7;

/// Offset of the starting address in both supported requests
pub const ADDRESS_OFFSET: usize = 8;

/// Offset of the bit count / quantity in both supported requests
pub const QUANTITY_OFFSET: usize = 10;

/// Offset of the byte count in a Write Multiple Coils request
pub const BYTE_COUNT_OFFSET: usize = 12;

/// Offset of the first coil data byte in a Write Multiple Coils request
pub const COIL_DATA_OFFSET: usize = 13;

/// Total size of a Write Multiple Coils response
pub const WRITE_COILS_RESPONSE_LEN: usize = 12;

/// Largest Read Discrete Inputs quantity whose byte count fits the one-byte field
pub const MAX_DISCRETE_INPUTS_PER_REPLY: u16 = 2040;

/// Function codes implemented by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Smallest frame that carries every fixed field of the request
    pub fn min_request_len(self) -> usize {
        match self {
            ModbusFunction::ReadDiscreteInputs => QUANTITY_OFFSET + 2,
            ModbusFunction::WriteMultipleCoils => COIL_DATA_OFFSET,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count following the length field (unit id + PDU)
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Read the header from the front of `frame`, `None` until 7 bytes are present
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < MBAP_HEADER_SIZE {
            return None;
        }
        Some(Self {
            transaction_id: BigEndian::read_u16(&frame[0..2]),
            protocol_id: BigEndian::read_u16(&frame[2..4]),
            length: BigEndian::read_u16(&frame[4..6]),
            unit_id: frame[UNIT_ID_OFFSET],
        })
    }

    /// Whole frame size announced by the length field
    pub fn frame_len(&self) -> usize {
        ECHOED_HEADER_LEN + self.length as usize
    }
}

/// Read a big-endian u16 at `offset`, `None` if the frame is too short
pub fn read_u16_at(frame: &[u8], offset: usize) -> Option<u16> {
    frame
        .get(offset..offset + 2)
        .map(BigEndian::read_u16)
}

/// Bytes needed to carry `quantity` bits
pub fn byte_count_for(quantity: u16) -> usize {
    (quantity as usize + 7) / 8
}

/// Unpack `bit_count` values, least significant bit first
///
/// Bits beyond the supplied bytes come back as `false`.
pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
    (0..bit_count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|byte| byte & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x0F).unwrap(),
            ModbusFunction::WriteMultipleCoils
        );
        assert_eq!(ModbusFunction::ReadDiscreteInputs.to_u8(), 0x02);
        assert_eq!(
            ModbusFunction::from_u8(0x03),
            Err(ModbusError::invalid_function(0x03))
        );
    }

    #[test]
    fn test_header_parse() {
        let frame = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00];
        let header = MbapHeader::parse(&frame).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 1);
        assert_eq!(header.frame_len(), 12);

        assert!(MbapHeader::parse(&frame[..6]).is_none());
    }

    #[test]
    fn test_read_u16_at() {
        let frame = [0x00, 0x01, 0xAB, 0xCD];
        assert_eq!(read_u16_at(&frame, 2), Some(0xABCD));
        assert_eq!(read_u16_at(&frame, 3), None);
    }

    #[test]
    fn test_unpack_bits_pads() {
        let bits = unpack_bits(&[0b0000_0101], 10);
        assert_eq!(bits.len(), 10);
        assert_eq!(
            bits,
            vec![true, false, true, false, false, false, false, false, false, false]
        );
        assert!(unpack_bits(&[], 3).iter().all(|b| !b));
    }

    #[test]
    fn test_byte_count() {
        assert_eq!(byte_count_for(0), 0);
        assert_eq!(byte_count_for(1), 1);
        assert_eq!(byte_count_for(8), 1);
        assert_eq!(byte_count_for(12), 2);
        assert_eq!(byte_count_for(MAX_DISCRETE_INPUTS_PER_REPLY), 255);
    }
}
