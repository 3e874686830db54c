//! High-level Modbus client implementations.
//!
//! Modbus TCP and RTU share the same application layer (the PDU); they
//! differ in framing and in transaction discipline. The typed operations
//! here are therefore implemented once against the transaction registry
//! handle and exposed through two thin clients:
//!
//! - [`ModbusTcpClient`]: MBAP framing, many requests in flight at once.
//! - [`ModbusRtuClient`]: silence-delimited framing, one request in
//!   flight, broadcast writes to unit 0.
//!
//! # API naming convention
//!
//! Operations follow the function-code numbering with semantic aliases:
//!
//! | Function code | Primary name | Semantic alias |
//! |---------------|-----------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//! | 0x16 | `write_16()` | `mask_write_register()` |
//! | 0x17 | `read_write_17()` | `read_write_multiple_registers()` |
//!
//! Address and quantity constraints are validated before anything touches
//! the wire; violations fail with [`ModbusError::InvalidArgument`].
//!
//! Clients spawn their registry task on the ambient tokio runtime, so they
//! must be created from within one.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{DecodeErrorKind, ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};
use crate::transaction::{RegistryHandle, RtuRegistry, TcpRegistry, TransportStats};
use crate::transport::{ModbusTransport, SerialConfig, SerialTransport, TcpTransport};

/// Client configuration.
///
/// Every knob the client honors is an explicit field here; construct it
/// with struct update syntax over [`Default`].
///
/// ```
/// use gridline_modbus::ModbusClientConfig;
/// use std::time::Duration;
///
/// let config = ModbusClientConfig {
///     request_timeout: Duration::from_secs(2),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ModbusClientConfig {
    /// How long each request may wait for its response.
    pub request_timeout: Duration,
    /// Bound for establishing the underlying connection (TCP only).
    pub connect_timeout: Duration,
}

impl Default for ModbusClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Trait defining the interface for Modbus client operations.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02).
    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (function code 0x03).
    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04).
    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Write single coil (function code 0x05).
    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool)
        -> ModbusResult<()>;

    /// Write single register (function code 0x06).
    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16)
        -> ModbusResult<()>;

    /// Write multiple coils (function code 0x0F).
    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()>;

    /// Write multiple registers (function code 0x10).
    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()>;

    /// Mask write register (function code 0x16): `register = (register AND
    /// and_mask) OR (or_mask AND NOT and_mask)`, atomic in the device.
    async fn write_16(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()>;

    /// Read/write multiple registers in one transaction (function code
    /// 0x17). The write happens before the read in the device.
    async fn read_write_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>>;

    /// Whether the underlying transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Shut the client down; outstanding requests complete with
    /// `Cancelled`.
    async fn close(&mut self) -> ModbusResult<()>;

    /// Snapshot of the connection counters.
    fn get_stats(&self) -> TransportStats;

    // Semantic aliases.

    async fn read_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_01(slave_id, address, quantity).await
    }

    async fn read_discrete_inputs(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_02(slave_id, address, quantity).await
    }

    async fn read_holding_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_03(slave_id, address, quantity).await
    }

    async fn read_input_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_04(slave_id, address, quantity).await
    }

    async fn write_single_coil(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        self.write_05(slave_id, address, value).await
    }

    async fn write_single_register(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.write_06(slave_id, address, value).await
    }

    async fn write_multiple_coils(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.write_0f(slave_id, address, values).await
    }

    async fn write_multiple_registers(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.write_10(slave_id, address, values).await
    }

    async fn mask_write_register(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        self.write_16(slave_id, address, and_mask, or_mask).await
    }

    async fn read_write_multiple_registers(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        self.read_write_17(slave_id, read_address, read_quantity, write_address, values)
            .await
    }
}

// Typed operations shared by both clients: validate, submit to the
// registry, shape the decoded response.

fn validated(request: ModbusRequest) -> ModbusResult<ModbusRequest> {
    request
        .validate()
        .map_err(ModbusError::invalid_argument)?;
    Ok(request)
}

fn require_response(response: Option<ModbusResponse>) -> ModbusResult<ModbusResponse> {
    response.ok_or_else(|| {
        ModbusError::invalid_argument("broadcast request returns no response")
    })
}

fn unexpected(response: &ModbusResponse) -> ModbusError {
    ModbusError::decode(DecodeErrorKind::UnexpectedFunction(
        response.function().to_u8(),
    ))
}

async fn run_read_bits(
    handle: &RegistryHandle,
    slave_id: SlaveId,
    request: ModbusRequest,
    quantity: u16,
) -> ModbusResult<Vec<bool>> {
    let request = validated(request)?;
    let response = require_response(handle.execute(slave_id, request).await?)?;
    let bits = match response {
        ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => bits,
        other => return Err(unexpected(&other)),
    };
    // The device answers in whole bytes.
    if bits.len() != (quantity as usize).div_ceil(8) * 8 {
        return Err(ModbusError::decode(DecodeErrorKind::ByteCountMismatch));
    }
    let mut bits = bits;
    bits.truncate(quantity as usize);
    Ok(bits)
}

async fn run_read_registers(
    handle: &RegistryHandle,
    slave_id: SlaveId,
    request: ModbusRequest,
    quantity: u16,
) -> ModbusResult<Vec<u16>> {
    let request = validated(request)?;
    let response = require_response(handle.execute(slave_id, request).await?)?;
    let values = match response {
        ModbusResponse::ReadHoldingRegisters(values)
        | ModbusResponse::ReadInputRegisters(values)
        | ModbusResponse::ReadWriteMultipleRegisters(values) => values,
        other => return Err(unexpected(&other)),
    };
    if values.len() != quantity as usize {
        return Err(ModbusError::decode(DecodeErrorKind::ByteCountMismatch));
    }
    Ok(values)
}

async fn run_write(
    handle: &RegistryHandle,
    slave_id: SlaveId,
    request: ModbusRequest,
) -> ModbusResult<()> {
    let request = validated(request)?;
    // A broadcast write completes with no response once the line goes
    // quiet; everything else echoes the request shape.
    match handle.execute(slave_id, request).await? {
        None => Ok(()),
        Some(ModbusResponse::WriteSingleCoil { .. })
        | Some(ModbusResponse::WriteSingleRegister { .. })
        | Some(ModbusResponse::WriteMultipleCoils { .. })
        | Some(ModbusResponse::WriteMultipleRegisters { .. })
        | Some(ModbusResponse::MaskWriteRegister { .. }) => Ok(()),
        Some(other) => Err(unexpected(&other)),
    }
}

/// Modbus TCP client.
///
/// Clones share the same connection and transaction registry, so several
/// tasks can issue requests concurrently; responses are correlated by
/// transaction identifier.
#[derive(Clone)]
pub struct ModbusTcpClient {
    handle: RegistryHandle,
    peer: Option<SocketAddr>,
}

impl ModbusTcpClient {
    /// Connect to a Modbus TCP server.
    pub async fn connect(addr: SocketAddr, config: ModbusClientConfig) -> ModbusResult<Self> {
        let transport = TcpTransport::connect(addr, config.connect_timeout).await?;
        Ok(Self {
            handle: TcpRegistry::spawn(transport, config.request_timeout),
            peer: Some(addr),
        })
    }

    /// Connect using an address string, e.g. `"10.0.0.5:502"`.
    pub async fn from_address(addr: &str, request_timeout: Duration) -> ModbusResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid address: {e}")))?;
        Self::connect(
            addr,
            ModbusClientConfig { request_timeout, ..Default::default() },
        )
        .await
    }

    /// Build a client over any transport, e.g. a TLS stream wrapper or an
    /// in-memory pipe.
    pub fn from_transport<T: ModbusTransport>(transport: T, config: ModbusClientConfig) -> Self {
        Self {
            handle: TcpRegistry::spawn(transport, config.request_timeout),
            peer: None,
        }
    }

    /// The server address, when connected through [`ModbusTcpClient::connect`].
    pub fn server_address(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        run_read_bits(
            &self.handle,
            slave_id,
            ModbusRequest::ReadCoils { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        run_read_bits(
            &self.handle,
            slave_id,
            ModbusRequest::ReadDiscreteInputs { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadHoldingRegisters { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadInputRegisters { address, quantity },
            quantity,
        )
        .await
    }

    async fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteSingleCoil { address, value },
        )
        .await
    }

    async fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteSingleRegister { address, value },
        )
        .await
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteMultipleCoils { address, coils: values.to_vec() },
        )
        .await
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteMultipleRegisters { address, values: values.to_vec() },
        )
        .await
    }

    async fn write_16(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::MaskWriteRegister { address, and_mask, or_mask },
        )
        .await
    }

    async fn read_write_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values: values.to_vec(),
            },
            read_quantity,
        )
        .await
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.handle.shutdown();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.handle.stats()
    }
}

/// Modbus RTU client.
///
/// One request is in flight at a time; further requests queue in FIFO
/// order, which clones of the client (sharing the same line) feed as well.
/// Writes to unit 0 are broadcast: they complete after the line has been
/// quiet for the inter-frame silence with no response expected.
#[derive(Clone)]
pub struct ModbusRtuClient {
    handle: RegistryHandle,
}

impl ModbusRtuClient {
    /// Open the serial port and start the client.
    pub fn open(serial: SerialConfig, config: ModbusClientConfig) -> ModbusResult<Self> {
        let baud_rate = serial.baud_rate;
        let transport = SerialTransport::open(serial)?;
        Ok(Self::from_transport(transport, baud_rate, config))
    }

    /// Shorthand for an 8N1 port with default timeouts.
    pub fn new(path: &str, baud_rate: u32) -> ModbusResult<Self> {
        Self::open(SerialConfig::new(path, baud_rate), ModbusClientConfig::default())
    }

    /// Build a client over any transport. `baud_rate` still governs the
    /// t1.5/t3.5 silence thresholds of the framing layer.
    pub fn from_transport<T: ModbusTransport>(
        transport: T,
        baud_rate: u32,
        config: ModbusClientConfig,
    ) -> Self {
        Self {
            handle: RtuRegistry::spawn(transport, baud_rate, config.request_timeout),
        }
    }
}

#[async_trait]
impl ModbusClient for ModbusRtuClient {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        run_read_bits(
            &self.handle,
            slave_id,
            ModbusRequest::ReadCoils { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        run_read_bits(
            &self.handle,
            slave_id,
            ModbusRequest::ReadDiscreteInputs { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadHoldingRegisters { address, quantity },
            quantity,
        )
        .await
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadInputRegisters { address, quantity },
            quantity,
        )
        .await
    }

    async fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteSingleCoil { address, value },
        )
        .await
    }

    async fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteSingleRegister { address, value },
        )
        .await
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteMultipleCoils { address, coils: values.to_vec() },
        )
        .await
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::WriteMultipleRegisters { address, values: values.to_vec() },
        )
        .await
    }

    async fn write_16(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        run_write(
            &self.handle,
            slave_id,
            ModbusRequest::MaskWriteRegister { address, and_mask, or_mask },
        )
        .await
    }

    async fn read_write_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        run_read_registers(
            &self.handle,
            slave_id,
            ModbusRequest::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values: values.to_vec(),
            },
            read_quantity,
        )
        .await
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.handle.shutdown();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.handle.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use async_trait::async_trait;

    /// Transport that accepts writes and never produces input.
    struct NullTransport;

    #[async_trait]
    impl ModbusTransport for NullTransport {
        async fn send(&mut self, _bytes: &[u8]) -> ModbusResult<()> {
            Ok(())
        }

        async fn recv(&mut self) -> TransportEvent {
            std::future::pending().await
        }

        async fn close(&mut self) -> ModbusResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_argument_validation_stays_local() {
        let mut client =
            ModbusTcpClient::from_transport(NullTransport, ModbusClientConfig::default());

        assert!(matches!(
            client.read_01(1, 0, 0).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            client.read_01(1, 0, 2001).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            client.read_03(1, 0, 126).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        // Address span past the end of the register space.
        assert!(matches!(
            client.read_03(1, 0xFFF0, 0x20).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            client.write_10(1, 0, &[0u16; 124]).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            client
                .read_write_17(1, 0, 10, 0, &[0u16; 122])
                .await,
            Err(ModbusError::InvalidArgument { .. })
        ));

        // Nothing was transmitted for any of those.
        assert_eq!(client.get_stats().requests_sent, 0);
        assert_eq!(client.get_stats().bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_from_address_rejects_garbage() {
        let result = ModbusTcpClient::from_address("not-an-address", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ModbusError::Configuration { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rtu_broadcast_write_completes_without_response() {
        let mut client = ModbusRtuClient::from_transport(
            NullTransport,
            9600,
            ModbusClientConfig::default(),
        );
        client.write_05(0, 0x0001, true).await.unwrap();
        let stats = client.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
    }

    #[tokio::test]
    async fn test_rtu_broadcast_read_is_rejected() {
        let mut client = ModbusRtuClient::from_transport(
            NullTransport,
            9600,
            ModbusClientConfig::default(),
        );
        assert!(matches!(
            client.read_03(0, 0, 1).await,
            Err(ModbusError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut client =
            ModbusTcpClient::from_transport(NullTransport, ModbusClientConfig::default());
        client.close().await.unwrap();
        client.close().await.unwrap();
    }
}
