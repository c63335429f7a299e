//! Modbus TCP/RTU transport on top of `tokio-modbus`.

use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use super::{ConnectParams, Parity, RegisterData, RegisterTransport, TransportError, WriteValues};
use crate::schema::RegisterKind;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Modbus client holding at most one open link.
pub struct ModbusTransport {
    ctx: Option<Context>,
    timeout: Duration,
}

impl Default for ModbusTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ModbusTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { ctx: None, timeout }
    }

    fn context(&mut self, unit_id: u8) -> Result<&mut Context, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit_id));
        Ok(ctx)
    }

    async fn open(params: &ConnectParams, timeout: Duration) -> Result<Context, TransportError> {
        match params {
            ConnectParams::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Connect(format!("Invalid address: {}", e)))?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connect(format!("No address found for {}", host))
                    })?;

                tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(1)))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))?
                    .map_err(|e| TransportError::Connect(e.to_string()))
            }
            ConnectParams::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Even => tokio_serial::Parity::Even,
                    Parity::Odd => tokio_serial::Parity::Odd,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port, *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connect(format!("Serial open failed: {}", e))
                })?;

                Ok(rtu::attach_slave(serial, Slave(1)))
            }
        }
    }
}

/// Run one exchange under the request timeout, flattening the
/// transport and exception layers of the result.
async fn exchange<T, E, X>(
    timeout: Duration,
    request: impl Future<Output = Result<Result<T, X>, E>>,
    failed: fn(String) -> TransportError,
) -> Result<T, TransportError>
where
    E: Display,
    X: Debug,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))?
        .map_err(|e| failed(e.to_string()))?
        .map_err(|e| TransportError::Exception(format!("{:?}", e)))
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn connect(&mut self, params: &ConnectParams) -> Result<(), TransportError> {
        if let Some(mut old) = self.ctx.take() {
            if let Err(e) = old.disconnect().await {
                debug!(error = %e, "Closing previous link failed");
            }
        }

        let ctx = Self::open(params, self.timeout).await?;
        info!(endpoint = %params.endpoint(), "Modbus link open");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        match self.ctx.take() {
            Some(mut ctx) => ctx
                .disconnect()
                .await
                .map_err(|e| TransportError::Connect(e.to_string())),
            None => Ok(()),
        }
    }

    async fn read(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<RegisterData, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context(unit_id)?;

        match kind {
            RegisterKind::Coil => {
                exchange(timeout, ctx.read_coils(start, count), TransportError::Read)
                    .await
                    .map(RegisterData::Bits)
            }
            RegisterKind::Discrete => exchange(
                timeout,
                ctx.read_discrete_inputs(start, count),
                TransportError::Read,
            )
            .await
            .map(RegisterData::Bits),
            RegisterKind::Input => exchange(
                timeout,
                ctx.read_input_registers(start, count),
                TransportError::Read,
            )
            .await
            .map(RegisterData::Words),
            RegisterKind::Holding => exchange(
                timeout,
                ctx.read_holding_registers(start, count),
                TransportError::Read,
            )
            .await
            .map(RegisterData::Words),
        }
    }

    async fn write(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        values: &WriteValues,
    ) -> Result<(), TransportError> {
        values.check_kind(kind)?;
        let timeout = self.timeout;
        let ctx = self.context(unit_id)?;

        // Single values use FC05/FC06, several use FC15/FC16.
        match values {
            WriteValues::Bits(bits) => match bits.as_slice() {
                [] => Err(TransportError::InvalidRequest("no values to write".to_string())),
                [bit] => {
                    exchange(timeout, ctx.write_single_coil(start, *bit), TransportError::Write)
                        .await
                }
                many => {
                    exchange(timeout, ctx.write_multiple_coils(start, many), TransportError::Write)
                        .await
                }
            },
            WriteValues::Words(words) => match words.as_slice() {
                [] => Err(TransportError::InvalidRequest("no values to write".to_string())),
                [word] => exchange(
                    timeout,
                    ctx.write_single_register(start, *word),
                    TransportError::Write,
                )
                .await,
                many => exchange(
                    timeout,
                    ctx.write_multiple_registers(start, many),
                    TransportError::Write,
                )
                .await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_futures_are_send() {
        let params = ConnectParams::tcp("127.0.0.1", 502);
        assert_send(&ModbusTransport::open(&params, DEFAULT_TIMEOUT));

        let mut transport = ModbusTransport::default();
        assert_send(&transport.connect(&params));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_link() {
        let mut transport = ModbusTransport::new(Duration::from_millis(500));
        let params = ConnectParams::tcp("127.0.0.1", 1);
        assert!(transport.connect(&params).await.is_err());
        assert!(transport.ctx.is_none());
        assert_eq!(
            transport.read(RegisterKind::Coil, 1, 0, 1).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_read_without_connection() {
        let mut transport = ModbusTransport::default();
        let result = transport.read(RegisterKind::Holding, 1, 0, 1).await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_write_to_input_rejected_before_io() {
        let mut transport = ModbusTransport::default();
        let result = transport
            .write(RegisterKind::Input, 1, 0, &WriteValues::Words(vec![1]))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let mut transport = ModbusTransport::default();
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_exchange_flattens_layers() {
        let ok: Result<Result<u8, String>, String> = Ok(Ok(7));
        assert_eq!(
            exchange(DEFAULT_TIMEOUT, async { ok }, TransportError::Read).await,
            Ok(7)
        );

        let exception: Result<Result<u8, String>, String> = Ok(Err("IllegalDataAddress".into()));
        assert!(matches!(
            exchange(DEFAULT_TIMEOUT, async { exception }, TransportError::Read).await,
            Err(TransportError::Exception(_))
        ));

        let io: Result<Result<u8, String>, String> = Err("broken pipe".into());
        assert_eq!(
            exchange(DEFAULT_TIMEOUT, async { io }, TransportError::Read).await,
            Err(TransportError::Read("broken pipe".to_string()))
        );
    }
}
