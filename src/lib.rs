//! # Gridline Modbus - async Modbus TCP/RTU client library
//!
//! A client-side implementation of the Modbus application protocol over two
//! transport bindings: Modbus/TCP (MBAP framing over a byte stream) and
//! Modbus/RTU (CRC-trailed, silence-delimited framing over a serial line).
//!
//! ## Features
//!
//! - Bit-exact PDU codec for the standard function-code catalogue,
//!   including the exception sub-protocol
//! - Transaction correlation: concurrent requests over one TCP connection,
//!   identifier allocation with rollover, per-request timeouts, drain on
//!   disconnect
//! - Streaming MBAP frame decoder, resumable over arbitrary byte splits
//! - RTU framing with CRC-16/Modbus validation and t1.5/t3.5 character
//!   timing, including transmit-side turnaround gating and broadcast
//!   semantics
//! - Transport abstraction: bring your own byte pipe (TLS, pipes, mocks)
//!   or use the bundled TCP and serial bindings
//!
//! ## Supported function codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x16 | Mask Write Register |
//! | 0x17 | Read/Write Multiple Registers |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gridline_modbus::{ModbusClient, ModbusResult, ModbusTcpClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client =
//!         ModbusTcpClient::from_address("127.0.0.1:502", Duration::from_secs(5)).await?;
//!
//!     let registers = client.read_03(1, 0x006B, 3).await?;
//!     println!("registers: {registers:04X?}");
//!
//!     client.write_06(1, 100, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! typed request ──▶ PDU codec ──▶ framer (MBAP / RTU) ──▶ transport
//!                                                            │
//! awaiter ◀── transaction registry ◀── framer ◀── bytes ◀────┘
//! ```
//!
//! Each client connection runs a single registry task owning all pending
//! transaction state; user calls, inbound bytes and timers are serialized
//! through it, so responses never race timeouts. Connection supervision
//! (reconnect policy) is intentionally left to the caller: the registry
//! fails pending requests on disconnect and resumes on the transport's
//! `Connected` event.

pub mod client;
pub mod error;
pub mod mbap;
pub mod protocol;
pub mod rtu;
pub mod transaction;
pub mod transport;

// Re-export main types for convenience.
pub use client::{ModbusClient, ModbusClientConfig, ModbusRtuClient, ModbusTcpClient};
pub use error::{DecodeErrorKind, ModbusError, ModbusResult};
pub use protocol::{
    ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, BROADCAST_SLAVE_ID,
};
pub use transaction::{TransactionSequence, TransportStats};
pub use transport::{
    ModbusTransport, SerialConfig, SerialTransport, TcpTransport, TransportEvent,
};

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils in a single read request.
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in a single read request.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in a single write request.
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers in a single write request.
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum number of registers written by a combined read/write request.
pub const MAX_RW_WRITE_REGISTERS_PER_REQUEST: u16 = 121;

/// Maximum size of a serialized PDU in bytes.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum Modbus TCP frame size (MBAP header + PDU).
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum Modbus RTU frame size (unit id + PDU + CRC).
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Modbus TCP default port when the stream is TLS-wrapped.
pub const DEFAULT_TCP_TLS_PORT: u16 = 802;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information.
pub fn info() -> String {
    format!("Gridline Modbus v{VERSION} - async Modbus TCP/RTU client library")
}
