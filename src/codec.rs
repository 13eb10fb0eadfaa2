/// Frame codec for the supported Modbus TCP subset
///
/// Two jobs: carve complete frames out of a connection's inbound buffer, and
/// turn one frame into zero or one response frame while applying its effect
/// to the coil bank.
///
/// Field decoding is offset driven rather than trusting the declared
/// lengths. A Write Multiple Coils request that announces more bits than it
/// carries is still applied, with the missing bits read as `false`, and its
/// response still echoes the declared address and bit count.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::coil_bank::CoilBank;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::FrameTrace;
use crate::protocol::{
    byte_count_for, read_u16_at, unpack_bits, MbapHeader, ModbusFunction, ADDRESS_OFFSET,
    BYTE_COUNT_OFFSET, COIL_DATA_OFFSET, ECHOED_HEADER_LEN, FUNCTION_CODE_OFFSET,
    MAX_DISCRETE_INPUTS_PER_REPLY, MBAP_HEADER_SIZE, QUANTITY_OFFSET, UNIT_ID_OFFSET,
    WRITE_COILS_RESPONSE_LEN,
};

/// Size of a complete frame at the front of `buffer`, `None` while more bytes are needed
///
/// The MBAP length field delimits frames. When it cannot be right (no room
/// for a function code, or larger than any Modbus TCP frame) everything
/// buffered so far is treated as one frame.
pub fn next_frame_len(buffer: &[u8]) -> Option<usize> {
    let header = MbapHeader::parse(buffer)?;
    let frame_len = header.frame_len();

    if frame_len < MBAP_HEADER_SIZE + 1 || frame_len > crate::MAX_TCP_FRAME_SIZE {
        return Some(buffer.len());
    }
    if buffer.len() >= frame_len {
        Some(frame_len)
    } else {
        None
    }
}

/// Split the next complete frame off the front of `buffer`
pub fn take_frame(buffer: &mut BytesMut) -> Option<BytesMut> {
    let len = next_frame_len(buffer)?;
    Some(buffer.split_to(len))
}

/// Decoded Write Multiple Coils (0x0F) request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCoilsRequest {
    pub address: u16,
    pub bit_count: u16,
    pub byte_count: u8,
    /// Exactly `bit_count` values, zero padded
    pub values: Vec<bool>,
    /// Bits actually carried by the frame
    pub available_bits: usize,
}

impl WriteCoilsRequest {
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        let (address, bit_count, byte_count) = match (
            read_u16_at(frame, ADDRESS_OFFSET),
            read_u16_at(frame, QUANTITY_OFFSET),
            frame.get(BYTE_COUNT_OFFSET),
        ) {
            (Some(address), Some(bit_count), Some(&byte_count)) => (address, bit_count, byte_count),
            _ => return Err(ModbusError::frame("Write multiple coils request too short")),
        };

        let data_end = (COIL_DATA_OFFSET + byte_count as usize).min(frame.len());
        let data = &frame[COIL_DATA_OFFSET..data_end];

        Ok(Self {
            address,
            bit_count,
            byte_count,
            values: unpack_bits(data, bit_count as usize),
            available_bits: data.len() * 8,
        })
    }

    /// Whether some declared bits had to be padded
    pub fn is_padded(&self) -> bool {
        self.available_bits < self.bit_count as usize
    }

    /// 12-byte acknowledgement echoing the request header, address and bit count
    pub fn response(&self, request: &[u8]) -> Vec<u8> {
        let mut response = Vec::with_capacity(WRITE_COILS_RESPONSE_LEN);
        response.extend_from_slice(&request[..ECHOED_HEADER_LEN]);
        response.push(request[UNIT_ID_OFFSET]);
        response.push(ModbusFunction::WriteMultipleCoils.to_u8());
        response.extend_from_slice(&self.address.to_be_bytes());
        response.extend_from_slice(&self.bit_count.to_be_bytes());
        response
    }
}

/// Decoded Read Discrete Inputs (0x02) request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInputsRequest {
    pub address: u16,
    pub quantity: u16,
}

impl ReadInputsRequest {
    pub fn decode(frame: &[u8]) -> ModbusResult<Self> {
        match (
            read_u16_at(frame, ADDRESS_OFFSET),
            read_u16_at(frame, QUANTITY_OFFSET),
        ) {
            (Some(address), Some(quantity)) => Ok(Self { address, quantity }),
            _ => Err(ModbusError::frame("Read discrete inputs request too short")),
        }
    }

    /// Response data length, `ceil(quantity / 8)`
    ///
    /// `None` once the quantity is past 2040 and the count no longer fits a byte.
    pub fn byte_count(&self) -> Option<u8> {
        if self.quantity > MAX_DISCRETE_INPUTS_PER_REPLY {
            return None;
        }
        u8::try_from(byte_count_for(self.quantity)).ok()
    }

    /// All-zero input report
    ///
    /// Discrete inputs have no backing state, so every bit reads as off.
    pub fn response(&self, request: &[u8]) -> Option<Vec<u8>> {
        let byte_count = self.byte_count()?;
        let mut response = Vec::with_capacity(FUNCTION_CODE_OFFSET + 2 + byte_count as usize);
        response.extend_from_slice(&request[..ECHOED_HEADER_LEN]);
        response.push(request[UNIT_ID_OFFSET]);
        response.push(ModbusFunction::ReadDiscreteInputs.to_u8());
        response.push(byte_count);
        response.resize(response.len() + byte_count as usize, 0);
        Some(response)
    }
}

/// What handling a frame produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Send these bytes back; `padded` marks a short coil payload
    Reply { response: Vec<u8>, padded: bool },
    /// Unsupported function code, nothing is sent
    Ignored { function_code: u8 },
    /// Frame too short to carry the request's fixed fields, nothing is sent
    Truncated,
    /// Read quantity whose reply cannot be encoded, nothing is sent
    Oversized { quantity: u16 },
}

/// Frame handler bound to one coil bank
#[derive(Debug, Clone)]
pub struct FrameCodec {
    bank: Arc<CoilBank>,
    trace: FrameTrace,
}

impl FrameCodec {
    pub fn new(bank: Arc<CoilBank>, trace: FrameTrace) -> Self {
        Self { bank, trace }
    }

    pub fn trace(&self) -> FrameTrace {
        self.trace
    }

    /// Handle one complete frame received from `peer`
    pub fn handle(&self, peer: SocketAddr, frame: &[u8]) -> ModbusResult<Handled> {
        let Some(&code) = frame.get(FUNCTION_CODE_OFFSET) else {
            return Ok(Handled::Truncated);
        };

        let function = match ModbusFunction::from_u8(code) {
            Ok(function) => function,
            Err(_) => {
                self.trace.ignored(peer, code);
                return Ok(Handled::Ignored { function_code: code });
            }
        };

        if frame.len() < function.min_request_len() {
            self.trace.truncated(peer, function, frame.len());
            return Ok(Handled::Truncated);
        }

        match function {
            ModbusFunction::WriteMultipleCoils => {
                let request = WriteCoilsRequest::decode(frame)?;
                let padded = request.is_padded();
                if padded {
                    self.trace
                        .short_payload(peer, request.bit_count, request.available_bits);
                }
                self.bank.write_many(request.address as usize, &request.values)?;
                Ok(Handled::Reply {
                    response: request.response(frame),
                    padded,
                })
            }
            ModbusFunction::ReadDiscreteInputs => {
                let request = ReadInputsRequest::decode(frame)?;
                match request.response(frame) {
                    Some(response) => Ok(Handled::Reply {
                        response,
                        padded: false,
                    }),
                    None => {
                        self.trace.oversized(peer, request.quantity);
                        Ok(Handled::Oversized {
                            quantity: request.quantity,
                        })
                    }
                }
            }
        }
    }
}
