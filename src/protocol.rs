//! Modbus protocol definitions and the PDU codec.
//!
//! A Protocol Data Unit is the transport-independent part of a Modbus
//! message: one function-code byte followed by a function-specific payload,
//! 1 to 253 bytes in total. Request and response payloads for the same
//! function code differ (a Read Coils request is address + quantity, its
//! response is byte count + packed bits), so requests and responses are
//! separate types with separate codecs.
//!
//! Encoding and decoding here are pure: no I/O, no shared state. Framing
//! (MBAP, RTU) lives in [`crate::mbap`] and [`crate::rtu`].

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DecodeErrorKind;

/// Modbus address type (0-65535).
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier.
pub type SlaveId = u8;

/// Broadcast unit identifier on serial lines.
pub const BROADCAST_SLAVE_ID: SlaveId = 0;

/// Modbus function codes supported by this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl ModbusFunction {
    /// Convert from a raw function-code byte.
    pub fn from_u8(value: u8) -> Result<Self, DecodeErrorKind> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x16 => Ok(ModbusFunction::MaskWriteRegister),
            0x17 => Ok(ModbusFunction::ReadWriteMultipleRegisters),
            _ => Err(DecodeErrorKind::UnsupportedFunction(value)),
        }
    }

    /// Convert to the raw function-code byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function.
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
                | ModbusFunction::ReadWriteMultipleRegisters
        )
    }

    /// Check if this is a write function.
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
                | ModbusFunction::MaskWriteRegister
                | ModbusFunction::ReadWriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::MaskWriteRegister => "Mask Write Register",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes returned by server devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    /// Exception code outside the standard catalogue.
    Unknown(u8),
}

impl ModbusException {
    /// Convert from a raw exception-code byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => ModbusException::IllegalFunction,
            0x02 => ModbusException::IllegalDataAddress,
            0x03 => ModbusException::IllegalDataValue,
            0x04 => ModbusException::ServerDeviceFailure,
            0x05 => ModbusException::Acknowledge,
            0x06 => ModbusException::ServerDeviceBusy,
            0x08 => ModbusException::MemoryParityError,
            0x0A => ModbusException::GatewayPathUnavailable,
            0x0B => ModbusException::GatewayTargetFailedToRespond,
            other => ModbusException::Unknown(other),
        }
    }

    /// Convert to the raw exception-code byte.
    pub fn to_u8(self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 0x01,
            ModbusException::IllegalDataAddress => 0x02,
            ModbusException::IllegalDataValue => 0x03,
            ModbusException::ServerDeviceFailure => 0x04,
            ModbusException::Acknowledge => 0x05,
            ModbusException::ServerDeviceBusy => 0x06,
            ModbusException::MemoryParityError => 0x08,
            ModbusException::GatewayPathUnavailable => 0x0A,
            ModbusException::GatewayTargetFailedToRespond => 0x0B,
            ModbusException::Unknown(code) => code,
        }
    }

    /// Get a short description of the exception condition.
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "function code not allowed by the server",
            ModbusException::IllegalDataAddress => "data address not allowed by the server",
            ModbusException::IllegalDataValue => "value not allowed by the server",
            ModbusException::ServerDeviceFailure => "unrecoverable error in the server device",
            ModbusException::Acknowledge => "request accepted, long-running processing",
            ModbusException::ServerDeviceBusy => "server device busy",
            ModbusException::MemoryParityError => "memory parity error in record file",
            ModbusException::GatewayPathUnavailable => "gateway could not allocate a path",
            ModbusException::GatewayTargetFailedToRespond => "no response from gateway target",
            ModbusException::Unknown(_) => "unknown exception code",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.description())
    }
}

/// A typed Modbus request PDU.
///
/// Each variant carries the field set of one function code. Quantities and
/// coil vectors are kept in their logical form; packing into wire bytes
/// happens in [`ModbusRequest::encode`].
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusRequest {
    ReadCoils { address: ModbusAddress, quantity: u16 },
    ReadDiscreteInputs { address: ModbusAddress, quantity: u16 },
    ReadHoldingRegisters { address: ModbusAddress, quantity: u16 },
    ReadInputRegisters { address: ModbusAddress, quantity: u16 },
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: u16 },
    WriteMultipleCoils { address: ModbusAddress, coils: Vec<bool> },
    WriteMultipleRegisters { address: ModbusAddress, values: Vec<u16> },
    MaskWriteRegister { address: ModbusAddress, and_mask: u16, or_mask: u16 },
    ReadWriteMultipleRegisters {
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        values: Vec<u16>,
    },
}

impl ModbusRequest {
    /// The function code of this request.
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusRequest::ReadCoils { .. } => ModbusFunction::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusRequest::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusRequest::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            ModbusRequest::MaskWriteRegister { .. } => ModbusFunction::MaskWriteRegister,
            ModbusRequest::ReadWriteMultipleRegisters { .. } => {
                ModbusFunction::ReadWriteMultipleRegisters
            }
        }
    }

    /// Validate address/quantity constraints before the request is encoded.
    ///
    /// Violations never reach the wire; the client surfaces them as
    /// `InvalidArgument`.
    pub fn validate(&self) -> Result<(), String> {
        fn check_span(what: &str, address: u16, quantity: u16, max: u16) -> Result<(), String> {
            if quantity == 0 || quantity > max {
                return Err(format!("{what} quantity {quantity} outside 1..={max}"));
            }
            if address as u32 + quantity as u32 > 0x1_0000 {
                return Err(format!(
                    "{what} range {address}+{quantity} exceeds address space"
                ));
            }
            Ok(())
        }

        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity } => {
                check_span("read bit", *address, *quantity, crate::MAX_COILS_PER_REQUEST)
            }
            ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => check_span(
                "read register",
                *address,
                *quantity,
                crate::MAX_REGISTERS_PER_REQUEST,
            ),
            ModbusRequest::WriteSingleCoil { .. }
            | ModbusRequest::WriteSingleRegister { .. }
            | ModbusRequest::MaskWriteRegister { .. } => Ok(()),
            ModbusRequest::WriteMultipleCoils { address, coils } => check_span(
                "write coil",
                *address,
                coils.len() as u16,
                crate::MAX_WRITE_COILS_PER_REQUEST,
            ),
            ModbusRequest::WriteMultipleRegisters { address, values } => check_span(
                "write register",
                *address,
                values.len() as u16,
                crate::MAX_WRITE_REGISTERS_PER_REQUEST,
            ),
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                check_span(
                    "read register",
                    *read_address,
                    *read_quantity,
                    crate::MAX_REGISTERS_PER_REQUEST,
                )?;
                check_span(
                    "write register",
                    *write_address,
                    values.len() as u16,
                    crate::MAX_RW_WRITE_REGISTERS_PER_REQUEST,
                )
            }
        }
    }

    /// Serialize this request into `dst`, function-code byte first.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.function().to_u8());
        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity }
            | ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => {
                dst.put_u16(*address);
                dst.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                dst.put_u16(*address);
                dst.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                dst.put_u16(*address);
                dst.put_u16(*value);
            }
            ModbusRequest::WriteMultipleCoils { address, coils } => {
                dst.put_u16(*address);
                dst.put_u16(coils.len() as u16);
                let packed = data_utils::pack_bits(coils);
                dst.put_u8(packed.len() as u8);
                dst.put_slice(&packed);
            }
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                dst.put_u16(*address);
                dst.put_u16(values.len() as u16);
                dst.put_u8((values.len() * 2) as u8);
                dst.put_slice(&data_utils::registers_to_bytes(values));
            }
            ModbusRequest::MaskWriteRegister { address, and_mask, or_mask } => {
                dst.put_u16(*address);
                dst.put_u16(*and_mask);
                dst.put_u16(*or_mask);
            }
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                dst.put_u16(*read_address);
                dst.put_u16(*read_quantity);
                dst.put_u16(*write_address);
                dst.put_u16(values.len() as u16);
                dst.put_u8((values.len() * 2) as u8);
                dst.put_slice(&data_utils::registers_to_bytes(values));
            }
        }
    }

    /// Serialize this request into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(crate::MAX_PDU_SIZE);
        self.encode(&mut dst);
        dst
    }

    /// Deserialize a request PDU, function-code byte first.
    pub fn decode(pdu: &[u8]) -> Result<Self, DecodeErrorKind> {
        let fc = *pdu.first().ok_or(DecodeErrorKind::Truncated)?;
        let function = ModbusFunction::from_u8(fc)?;
        let body = &pdu[1..];
        match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                let (address, quantity) = decode_addr_quantity(body)?;
                let max = if function.is_register_read() {
                    crate::MAX_REGISTERS_PER_REQUEST
                } else {
                    crate::MAX_COILS_PER_REQUEST
                };
                if quantity == 0 || quantity > max {
                    return Err(DecodeErrorKind::QuantityOutOfRange);
                }
                Ok(match function {
                    ModbusFunction::ReadCoils => ModbusRequest::ReadCoils { address, quantity },
                    ModbusFunction::ReadDiscreteInputs => {
                        ModbusRequest::ReadDiscreteInputs { address, quantity }
                    }
                    ModbusFunction::ReadHoldingRegisters => {
                        ModbusRequest::ReadHoldingRegisters { address, quantity }
                    }
                    _ => ModbusRequest::ReadInputRegisters { address, quantity },
                })
            }
            ModbusFunction::WriteSingleCoil => {
                let (address, raw) = decode_addr_quantity(body)?;
                let value = match raw {
                    0xFF00 => true,
                    0x0000 => false,
                    other => return Err(DecodeErrorKind::InvalidCoilValue(other)),
                };
                Ok(ModbusRequest::WriteSingleCoil { address, value })
            }
            ModbusFunction::WriteSingleRegister => {
                let (address, value) = decode_addr_quantity(body)?;
                Ok(ModbusRequest::WriteSingleRegister { address, value })
            }
            ModbusFunction::WriteMultipleCoils => {
                if body.len() < 5 {
                    return Err(DecodeErrorKind::Truncated);
                }
                let address = read_u16(body, 0);
                let quantity = read_u16(body, 2);
                if quantity == 0 || quantity > crate::MAX_WRITE_COILS_PER_REQUEST {
                    return Err(DecodeErrorKind::QuantityOutOfRange);
                }
                let byte_count = body[4] as usize;
                if byte_count != (quantity as usize).div_ceil(8) {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                if body.len() < 5 + byte_count {
                    return Err(DecodeErrorKind::Truncated);
                }
                if body.len() > 5 + byte_count {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                let coils = data_utils::unpack_bits(&body[5..], quantity as usize);
                Ok(ModbusRequest::WriteMultipleCoils { address, coils })
            }
            ModbusFunction::WriteMultipleRegisters => {
                if body.len() < 5 {
                    return Err(DecodeErrorKind::Truncated);
                }
                let address = read_u16(body, 0);
                let quantity = read_u16(body, 2);
                if quantity == 0 || quantity > crate::MAX_WRITE_REGISTERS_PER_REQUEST {
                    return Err(DecodeErrorKind::QuantityOutOfRange);
                }
                let byte_count = body[4] as usize;
                if byte_count != quantity as usize * 2 {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                if body.len() < 5 + byte_count {
                    return Err(DecodeErrorKind::Truncated);
                }
                if body.len() > 5 + byte_count {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                let values = data_utils::bytes_to_registers(&body[5..])?;
                Ok(ModbusRequest::WriteMultipleRegisters { address, values })
            }
            ModbusFunction::MaskWriteRegister => {
                if body.len() < 6 {
                    return Err(DecodeErrorKind::Truncated);
                }
                if body.len() > 6 {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                Ok(ModbusRequest::MaskWriteRegister {
                    address: read_u16(body, 0),
                    and_mask: read_u16(body, 2),
                    or_mask: read_u16(body, 4),
                })
            }
            ModbusFunction::ReadWriteMultipleRegisters => {
                if body.len() < 9 {
                    return Err(DecodeErrorKind::Truncated);
                }
                let read_address = read_u16(body, 0);
                let read_quantity = read_u16(body, 2);
                let write_address = read_u16(body, 4);
                let write_quantity = read_u16(body, 6);
                if read_quantity == 0 || read_quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(DecodeErrorKind::QuantityOutOfRange);
                }
                if write_quantity == 0
                    || write_quantity > crate::MAX_RW_WRITE_REGISTERS_PER_REQUEST
                {
                    return Err(DecodeErrorKind::QuantityOutOfRange);
                }
                let byte_count = body[8] as usize;
                if byte_count != write_quantity as usize * 2 {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                if body.len() < 9 + byte_count {
                    return Err(DecodeErrorKind::Truncated);
                }
                if body.len() > 9 + byte_count {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                let values = data_utils::bytes_to_registers(&body[9..])?;
                Ok(ModbusRequest::ReadWriteMultipleRegisters {
                    read_address,
                    read_quantity,
                    write_address,
                    values,
                })
            }
        }
    }
}

impl ModbusFunction {
    fn is_register_read(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters
        )
    }
}

/// A typed Modbus response PDU.
///
/// Read responses carry whole wire bytes' worth of data: a coil read always
/// yields a multiple of 8 bits; callers truncate to the quantity they asked
/// for.
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusResponse {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: ModbusAddress, value: bool },
    WriteSingleRegister { address: ModbusAddress, value: u16 },
    WriteMultipleCoils { address: ModbusAddress, quantity: u16 },
    WriteMultipleRegisters { address: ModbusAddress, quantity: u16 },
    MaskWriteRegister { address: ModbusAddress, and_mask: u16, or_mask: u16 },
    ReadWriteMultipleRegisters(Vec<u16>),
    /// Exception sub-protocol response: `(fc | 0x80, code)`.
    Exception { function: ModbusFunction, exception: ModbusException },
}

impl ModbusResponse {
    /// The function code this response answers.
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusResponse::ReadCoils(_) => ModbusFunction::ReadCoils,
            ModbusResponse::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs,
            ModbusResponse::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
            ModbusResponse::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
            ModbusResponse::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            ModbusResponse::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            ModbusResponse::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            ModbusResponse::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            ModbusResponse::MaskWriteRegister { .. } => ModbusFunction::MaskWriteRegister,
            ModbusResponse::ReadWriteMultipleRegisters(_) => {
                ModbusFunction::ReadWriteMultipleRegisters
            }
            ModbusResponse::Exception { function, .. } => *function,
        }
    }

    /// Whether this is an exception response.
    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusResponse::Exception { .. })
    }

    /// Deserialize a response PDU for the given originating request
    /// function.
    ///
    /// The decoder is selected by `expected`: a response whose function code
    /// is neither `expected` nor `expected | 0x80` fails with
    /// `UnexpectedFunction`.
    pub fn decode(pdu: &[u8], expected: ModbusFunction) -> Result<Self, DecodeErrorKind> {
        let fc = *pdu.first().ok_or(DecodeErrorKind::Truncated)?;
        if fc == expected.to_u8() | 0x80 {
            // Exception PDU is exactly two bytes.
            if pdu.len() < 2 {
                return Err(DecodeErrorKind::Truncated);
            }
            if pdu.len() > 2 {
                return Err(DecodeErrorKind::ByteCountMismatch);
            }
            return Ok(ModbusResponse::Exception {
                function: expected,
                exception: ModbusException::from_u8(pdu[1]),
            });
        }
        if fc != expected.to_u8() {
            return Err(DecodeErrorKind::UnexpectedFunction(fc));
        }
        let body = &pdu[1..];
        match expected {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let data = decode_counted_bytes(body)?;
                let bits = data_utils::unpack_bits(data, data.len() * 8);
                Ok(if expected == ModbusFunction::ReadCoils {
                    ModbusResponse::ReadCoils(bits)
                } else {
                    ModbusResponse::ReadDiscreteInputs(bits)
                })
            }
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::ReadWriteMultipleRegisters => {
                let data = decode_counted_bytes(body)?;
                let values = data_utils::bytes_to_registers(data)?;
                Ok(match expected {
                    ModbusFunction::ReadHoldingRegisters => {
                        ModbusResponse::ReadHoldingRegisters(values)
                    }
                    ModbusFunction::ReadInputRegisters => {
                        ModbusResponse::ReadInputRegisters(values)
                    }
                    _ => ModbusResponse::ReadWriteMultipleRegisters(values),
                })
            }
            ModbusFunction::WriteSingleCoil => {
                let (address, raw) = decode_addr_quantity(body)?;
                let value = match raw {
                    0xFF00 => true,
                    0x0000 => false,
                    other => return Err(DecodeErrorKind::InvalidCoilValue(other)),
                };
                Ok(ModbusResponse::WriteSingleCoil { address, value })
            }
            ModbusFunction::WriteSingleRegister => {
                let (address, value) = decode_addr_quantity(body)?;
                Ok(ModbusResponse::WriteSingleRegister { address, value })
            }
            ModbusFunction::WriteMultipleCoils => {
                let (address, quantity) = decode_addr_quantity(body)?;
                Ok(ModbusResponse::WriteMultipleCoils { address, quantity })
            }
            ModbusFunction::WriteMultipleRegisters => {
                let (address, quantity) = decode_addr_quantity(body)?;
                Ok(ModbusResponse::WriteMultipleRegisters { address, quantity })
            }
            ModbusFunction::MaskWriteRegister => {
                if body.len() < 6 {
                    return Err(DecodeErrorKind::Truncated);
                }
                if body.len() > 6 {
                    return Err(DecodeErrorKind::ByteCountMismatch);
                }
                Ok(ModbusResponse::MaskWriteRegister {
                    address: read_u16(body, 0),
                    and_mask: read_u16(body, 2),
                    or_mask: read_u16(body, 4),
                })
            }
        }
    }

    /// Serialize this response into `dst`, function-code byte first.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
                let fc = if matches!(self, ModbusResponse::ReadCoils(_)) {
                    ModbusFunction::ReadCoils
                } else {
                    ModbusFunction::ReadDiscreteInputs
                };
                dst.put_u8(fc.to_u8());
                let packed = data_utils::pack_bits(bits);
                dst.put_u8(packed.len() as u8);
                dst.put_slice(&packed);
            }
            ModbusResponse::ReadHoldingRegisters(values)
            | ModbusResponse::ReadInputRegisters(values)
            | ModbusResponse::ReadWriteMultipleRegisters(values) => {
                let fc = match self {
                    ModbusResponse::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
                    ModbusResponse::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
                    _ => ModbusFunction::ReadWriteMultipleRegisters,
                };
                dst.put_u8(fc.to_u8());
                dst.put_u8((values.len() * 2) as u8);
                dst.put_slice(&data_utils::registers_to_bytes(values));
            }
            ModbusResponse::WriteSingleCoil { address, value } => {
                dst.put_u8(ModbusFunction::WriteSingleCoil.to_u8());
                dst.put_u16(*address);
                dst.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusResponse::WriteSingleRegister { address, value } => {
                dst.put_u8(ModbusFunction::WriteSingleRegister.to_u8());
                dst.put_u16(*address);
                dst.put_u16(*value);
            }
            ModbusResponse::WriteMultipleCoils { address, quantity } => {
                dst.put_u8(ModbusFunction::WriteMultipleCoils.to_u8());
                dst.put_u16(*address);
                dst.put_u16(*quantity);
            }
            ModbusResponse::WriteMultipleRegisters { address, quantity } => {
                dst.put_u8(ModbusFunction::WriteMultipleRegisters.to_u8());
                dst.put_u16(*address);
                dst.put_u16(*quantity);
            }
            ModbusResponse::MaskWriteRegister { address, and_mask, or_mask } => {
                dst.put_u8(ModbusFunction::MaskWriteRegister.to_u8());
                dst.put_u16(*address);
                dst.put_u16(*and_mask);
                dst.put_u16(*or_mask);
            }
            ModbusResponse::Exception { function, exception } => {
                dst.put_u8(function.to_u8() | 0x80);
                dst.put_u8(exception.to_u8());
            }
        }
    }

    /// Serialize this response into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(crate::MAX_PDU_SIZE);
        self.encode(&mut dst);
        dst
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Decode the common `address:u16, value:u16` body shape; the PDU must end
/// exactly there.
fn decode_addr_quantity(body: &[u8]) -> Result<(u16, u16), DecodeErrorKind> {
    if body.len() < 4 {
        return Err(DecodeErrorKind::Truncated);
    }
    if body.len() > 4 {
        return Err(DecodeErrorKind::ByteCountMismatch);
    }
    Ok((read_u16(body, 0), read_u16(body, 2)))
}

/// Decode a `count:u8` prefixed byte run; the PDU must end exactly after
/// `count` bytes.
fn decode_counted_bytes(body: &[u8]) -> Result<&[u8], DecodeErrorKind> {
    let count = *body.first().ok_or(DecodeErrorKind::Truncated)? as usize;
    if count == 0 {
        return Err(DecodeErrorKind::ByteCountMismatch);
    }
    if body.len() < 1 + count {
        return Err(DecodeErrorKind::Truncated);
    }
    if body.len() > 1 + count {
        return Err(DecodeErrorKind::ByteCountMismatch);
    }
    Ok(&body[1..])
}

/// Data conversion utilities shared by the codec and by applications that
/// map multi-register values.
pub mod data_utils {
    use crate::error::DecodeErrorKind;

    /// Convert register values to bytes (big-endian).
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian). The byte run must have
    /// even length.
    pub fn bytes_to_registers(bytes: &[u8]) -> Result<Vec<u16>, DecodeErrorKind> {
        if bytes.len() % 2 != 0 {
            return Err(DecodeErrorKind::ByteCountMismatch);
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first: bit `i` lands in byte
    /// `i / 8`, bit position `i % 8`. Unused high bits of the last byte stay
    /// zero.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack bytes into `bit_count` boolean values, LSB first.
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

    /// Convert u32 to two u16 registers (big-endian word order).
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two u16 registers to u32 (big-endian word order).
    pub fn registers_to_u32(registers: &[u16]) -> Result<u32, DecodeErrorKind> {
        if registers.len() < 2 {
            return Err(DecodeErrorKind::Truncated);
        }
        Ok(((registers[0] as u32) << 16) | registers[1] as u32)
    }

    /// Convert f32 to two u16 registers (IEEE 754, big-endian word order).
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Convert two u16 registers to f32 (IEEE 754, big-endian word order).
    pub fn registers_to_f32(registers: &[u16]) -> Result<f32, DecodeErrorKind> {
        registers_to_u32(registers).map(f32::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_catalogue() -> Vec<ModbusRequest> {
        vec![
            ModbusRequest::ReadCoils { address: 0x0013, quantity: 0x0025 },
            ModbusRequest::ReadDiscreteInputs { address: 0x00C4, quantity: 0x0016 },
            ModbusRequest::ReadHoldingRegisters { address: 0x006B, quantity: 0x0003 },
            ModbusRequest::ReadInputRegisters { address: 0x0008, quantity: 0x0001 },
            ModbusRequest::WriteSingleCoil { address: 0x00AC, value: true },
            ModbusRequest::WriteSingleRegister { address: 0x0001, value: 0x0003 },
            ModbusRequest::WriteMultipleCoils {
                address: 0x0013,
                coils: vec![true, false, true, true, false, false, true, true, true, false],
            },
            ModbusRequest::WriteMultipleRegisters {
                address: 0x0001,
                values: vec![0x000A, 0x0102],
            },
            ModbusRequest::MaskWriteRegister {
                address: 0x0004,
                and_mask: 0x00F2,
                or_mask: 0x0025,
            },
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address: 0x0003,
                read_quantity: 6,
                write_address: 0x000E,
                values: vec![0x00FF, 0x00FF, 0x00FF],
            },
        ]
    }

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(
            ModbusFunction::from_u8(0x16).unwrap(),
            ModbusFunction::MaskWriteRegister
        );
        assert_eq!(
            ModbusFunction::from_u8(0xFF),
            Err(DecodeErrorKind::UnsupportedFunction(0xFF))
        );
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert_eq!(ModbusException::from_u8(0x42), ModbusException::Unknown(0x42));
        assert_eq!(ModbusException::Unknown(0x42).to_u8(), 0x42);
    }

    #[test]
    fn test_read_holding_registers_wire_shape() {
        let request = ModbusRequest::ReadHoldingRegisters { address: 0x006B, quantity: 3 };
        assert_eq!(&request.to_bytes()[..], &[0x03, 0x00, 0x6B, 0x00, 0x03]);

        let response = ModbusResponse::decode(
            &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64],
            ModbusFunction::ReadHoldingRegisters,
        )
        .unwrap();
        assert_eq!(
            response,
            ModbusResponse::ReadHoldingRegisters(vec![0x022B, 0x0000, 0x0064])
        );
    }

    #[test]
    fn test_exception_response_decode() {
        let response =
            ModbusResponse::decode(&[0x81, 0x02], ModbusFunction::ReadCoils).unwrap();
        assert_eq!(
            response,
            ModbusResponse::Exception {
                function: ModbusFunction::ReadCoils,
                exception: ModbusException::IllegalDataAddress,
            }
        );
        assert!(response.is_exception());

        // An exception PDU is exactly two bytes.
        assert_eq!(
            ModbusResponse::decode(&[0x81], ModbusFunction::ReadCoils),
            Err(DecodeErrorKind::Truncated)
        );
        assert_eq!(
            ModbusResponse::decode(&[0x81, 0x02, 0x00], ModbusFunction::ReadCoils),
            Err(DecodeErrorKind::ByteCountMismatch)
        );
    }

    #[test]
    fn test_request_round_trips() {
        for request in request_catalogue() {
            let bytes = request.to_bytes();
            let decoded = ModbusRequest::decode(&bytes).unwrap();
            assert_eq!(decoded, request, "round trip failed for {request:?}");
            // And byte-exact the other way around.
            assert_eq!(decoded.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_response_round_trips() {
        let responses = vec![
            (
                ModbusResponse::ReadCoils(data_utils::unpack_bits(&[0xCD, 0x6B], 16)),
                ModbusFunction::ReadCoils,
            ),
            (
                ModbusResponse::ReadDiscreteInputs(data_utils::unpack_bits(&[0xAC], 8)),
                ModbusFunction::ReadDiscreteInputs,
            ),
            (
                ModbusResponse::ReadHoldingRegisters(vec![0x022B, 0x0000, 0x0064]),
                ModbusFunction::ReadHoldingRegisters,
            ),
            (
                ModbusResponse::ReadInputRegisters(vec![0x000A]),
                ModbusFunction::ReadInputRegisters,
            ),
            (
                ModbusResponse::WriteSingleCoil { address: 0x00AC, value: true },
                ModbusFunction::WriteSingleCoil,
            ),
            (
                ModbusResponse::WriteSingleRegister { address: 0x0001, value: 0x0003 },
                ModbusFunction::WriteSingleRegister,
            ),
            (
                ModbusResponse::WriteMultipleCoils { address: 0x0013, quantity: 10 },
                ModbusFunction::WriteMultipleCoils,
            ),
            (
                ModbusResponse::WriteMultipleRegisters { address: 0x0001, quantity: 2 },
                ModbusFunction::WriteMultipleRegisters,
            ),
            (
                ModbusResponse::MaskWriteRegister {
                    address: 0x0004,
                    and_mask: 0x00F2,
                    or_mask: 0x0025,
                },
                ModbusFunction::MaskWriteRegister,
            ),
            (
                ModbusResponse::ReadWriteMultipleRegisters(vec![0x00FE, 0x0ACD]),
                ModbusFunction::ReadWriteMultipleRegisters,
            ),
            (
                ModbusResponse::Exception {
                    function: ModbusFunction::ReadHoldingRegisters,
                    exception: ModbusException::ServerDeviceBusy,
                },
                ModbusFunction::ReadHoldingRegisters,
            ),
        ];
        for (response, function) in responses {
            let bytes = response.to_bytes();
            let decoded = ModbusResponse::decode(&bytes, function).unwrap();
            assert_eq!(decoded, response, "round trip failed for {response:?}");
            assert_eq!(decoded.to_bytes(), bytes);
        }
    }

    #[test]
    fn test_coil_bit_packing() {
        // Bit i of the request maps to byte i/8, bit i%8.
        let bits = vec![true, false, true, true];
        assert_eq!(data_utils::pack_bits(&bits), vec![0b0000_1101]);

        let bits = data_utils::unpack_bits(&[0b1010_1010], 8);
        assert_eq!(
            bits,
            vec![false, true, false, true, false, true, false, true]
        );

        // Nine coils span two bytes; padding stays zero.
        let bits = vec![true; 9];
        assert_eq!(data_utils::pack_bits(&bits), vec![0xFF, 0x01]);
    }

    #[test]
    fn test_write_single_coil_values() {
        let on = ModbusRequest::WriteSingleCoil { address: 0x00AC, value: true };
        assert_eq!(&on.to_bytes()[..], &[0x05, 0x00, 0xAC, 0xFF, 0x00]);

        let off = ModbusRequest::WriteSingleCoil { address: 0x00AC, value: false };
        assert_eq!(&off.to_bytes()[..], &[0x05, 0x00, 0xAC, 0x00, 0x00]);

        assert_eq!(
            ModbusRequest::decode(&[0x05, 0x00, 0xAC, 0x12, 0x34]),
            Err(DecodeErrorKind::InvalidCoilValue(0x1234))
        );
        assert_eq!(
            ModbusResponse::decode(&[0x05, 0x00, 0xAC, 0xFF, 0x01], ModbusFunction::WriteSingleCoil),
            Err(DecodeErrorKind::InvalidCoilValue(0xFF01))
        );
    }

    #[test]
    fn test_decode_rejects_bad_quantities() {
        // 2001 coils
        assert_eq!(
            ModbusRequest::decode(&[0x01, 0x00, 0x00, 0x07, 0xD1]),
            Err(DecodeErrorKind::QuantityOutOfRange)
        );
        // zero registers
        assert_eq!(
            ModbusRequest::decode(&[0x03, 0x00, 0x00, 0x00, 0x00]),
            Err(DecodeErrorKind::QuantityOutOfRange)
        );
        // 126 registers
        assert_eq!(
            ModbusRequest::decode(&[0x04, 0x00, 0x00, 0x00, 0x7E]),
            Err(DecodeErrorKind::QuantityOutOfRange)
        );
    }

    #[test]
    fn test_decode_rejects_byte_count_mismatch() {
        // Write 10 coils requires ceil(10/8) = 2 data bytes, not 3.
        assert_eq!(
            ModbusRequest::decode(&[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x03, 0xCD, 0x01, 0x00]),
            Err(DecodeErrorKind::ByteCountMismatch)
        );
        // Register read response whose count disagrees with the body.
        assert_eq!(
            ModbusResponse::decode(
                &[0x03, 0x04, 0x02, 0x2B],
                ModbusFunction::ReadHoldingRegisters
            ),
            Err(DecodeErrorKind::Truncated)
        );
        // Odd register byte count.
        assert_eq!(
            ModbusResponse::decode(
                &[0x03, 0x03, 0x02, 0x2B, 0x00],
                ModbusFunction::ReadHoldingRegisters
            ),
            Err(DecodeErrorKind::ByteCountMismatch)
        );
    }

    #[test]
    fn test_decode_truncated_and_unknown() {
        assert_eq!(ModbusRequest::decode(&[]), Err(DecodeErrorKind::Truncated));
        assert_eq!(
            ModbusRequest::decode(&[0x03, 0x00]),
            Err(DecodeErrorKind::Truncated)
        );
        assert_eq!(
            ModbusRequest::decode(&[0x2B, 0x0E]),
            Err(DecodeErrorKind::UnsupportedFunction(0x2B))
        );
        // Response carrying some other function code than the request's.
        assert_eq!(
            ModbusResponse::decode(&[0x04, 0x02, 0x00, 0x0A], ModbusFunction::ReadHoldingRegisters),
            Err(DecodeErrorKind::UnexpectedFunction(0x04))
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(ModbusRequest::ReadHoldingRegisters { address: 100, quantity: 10 }
            .validate()
            .is_ok());
        assert!(ModbusRequest::ReadHoldingRegisters { address: 100, quantity: 200 }
            .validate()
            .is_err());
        assert!(ModbusRequest::ReadCoils { address: 0xFFF0, quantity: 0x20 }
            .validate()
            .is_err());
        assert!(ModbusRequest::WriteMultipleRegisters {
            address: 0,
            values: vec![0; 124],
        }
        .validate()
        .is_err());
        assert!(ModbusRequest::ReadWriteMultipleRegisters {
            read_address: 0,
            read_quantity: 125,
            write_address: 0,
            values: vec![0; 121],
        }
        .validate()
        .is_ok());
        assert!(ModbusRequest::ReadWriteMultipleRegisters {
            read_address: 0,
            read_quantity: 125,
            write_address: 0,
            values: vec![0; 122],
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_data_utils_conversions() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);
        assert!(data_utils::bytes_to_registers(&bytes[..3]).is_err());

        assert_eq!(data_utils::u32_to_registers(0x12345678), [0x1234, 0x5678]);
        assert_eq!(
            data_utils::registers_to_u32(&[0x1234, 0x5678]).unwrap(),
            0x12345678
        );

        let registers = data_utils::f32_to_registers(123.45);
        let back = data_utils::registers_to_f32(&registers).unwrap();
        assert!((back - 123.45).abs() < f32::EPSILON);
    }
}
