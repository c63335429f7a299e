//! Transport serializer: one shared connection, one request at a time.
//!
//! Every connect, disconnect, read and write goes through a FIFO-fair async
//! mutex. Callers either use the one-shot helpers or hold an
//! [`ExclusiveAccess`] guard across several operations.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info};

use crate::schema::RegisterKind;
use crate::traffic::{self, TrafficStats};
use crate::transport::{
    ConnectParams, ConnectionMode, RegisterData, RegisterTransport, TransportError, WriteValues,
};

struct Link {
    transport: Box<dyn RegisterTransport>,
    mode: ConnectionMode,
}

/// Owner of the shared connection and its traffic counters.
pub struct TransportSerializer {
    link: Mutex<Link>,
    connected: AtomicBool,
    stats: watch::Sender<TrafficStats>,
}

impl TransportSerializer {
    pub fn new(transport: impl RegisterTransport + 'static) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    pub fn from_boxed(transport: Box<dyn RegisterTransport>) -> Self {
        let (stats, _) = watch::channel(TrafficStats::default());
        Self {
            link: Mutex::new(Link {
                transport,
                mode: ConnectionMode::Tcp,
            }),
            connected: AtomicBool::new(false),
            stats,
        }
    }

    /// Wait for the gate. Waiters are admitted in arrival order.
    pub async fn acquire(&self) -> ExclusiveAccess<'_> {
        ExclusiveAccess {
            link: self.link.lock().await,
            owner: self,
        }
    }

    /// Whether the last connect succeeded and no disconnect followed.
    ///
    /// Does not touch the gate.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Cumulative counters since the last successful connect.
    pub fn stats(&self) -> TrafficStats {
        *self.stats.borrow()
    }

    /// Receive every counter update.
    pub fn subscribe_stats(&self) -> watch::Receiver<TrafficStats> {
        self.stats.subscribe()
    }

    pub async fn connect(&self, params: &ConnectParams) -> Result<(), TransportError> {
        self.acquire().await.connect(params).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.acquire().await.disconnect().await
    }

    pub async fn read(
        &self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<RegisterData, TransportError> {
        self.acquire().await.read(kind, unit_id, start, count).await
    }

    pub async fn write(
        &self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        values: &WriteValues,
    ) -> Result<(), TransportError> {
        self.acquire().await.write(kind, unit_id, start, values).await
    }
}

/// Exclusive use of the shared connection until dropped.
pub struct ExclusiveAccess<'a> {
    link: MutexGuard<'a, Link>,
    owner: &'a TransportSerializer,
}

impl ExclusiveAccess<'_> {
    /// Open the connection. Counters restart from zero on success.
    pub async fn connect(&mut self, params: &ConnectParams) -> Result<(), TransportError> {
        match self.link.transport.connect(params).await {
            Ok(()) => {
                self.link.mode = params.mode();
                self.owner.stats.send_replace(TrafficStats::default());
                self.owner.connected.store(true, Ordering::Release);
                info!(endpoint = %params.endpoint(), "Connected");
                Ok(())
            }
            Err(e) => {
                self.owner.connected.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.owner.connected.store(false, Ordering::Release);
        let result = self.link.transport.disconnect().await;
        info!("Disconnected");
        result
    }

    pub async fn read(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<RegisterData, TransportError> {
        let data = self
            .link
            .transport
            .read(kind, unit_id, start, count)
            .await?;

        let mode = self.link.mode;
        let request = traffic::read_request_bytes(mode);
        let response = traffic::read_response_bytes(mode, data.payload_bytes());
        self.owner
            .stats
            .send_modify(|stats| stats.record_exchange(request, response));

        debug!(%kind, unit_id, start, count, "Read complete");
        Ok(data)
    }

    pub async fn write(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        values: &WriteValues,
    ) -> Result<(), TransportError> {
        self.link
            .transport
            .write(kind, unit_id, start, values)
            .await?;

        let mode = self.link.mode;
        let request = traffic::write_request_bytes(mode, values.len(), values.payload_bytes());
        let response = traffic::write_response_bytes(mode);
        self.owner
            .stats
            .send_modify(|stats| stats.record_exchange(request, response));

        debug!(%kind, unit_id, start, count = values.len(), "Write complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_connect_resets_stats() {
        let bank = MemoryTransport::new();
        let serializer = TransportSerializer::new(bank.clone());
        let params = ConnectParams::tcp("sim", 502);

        serializer.connect(&params).await.unwrap();
        serializer
            .read(RegisterKind::Holding, 1, 0, 10)
            .await
            .unwrap();
        assert_eq!(
            serializer.stats(),
            TrafficStats {
                tx_bytes: 12,
                rx_bytes: 29,
                tx_messages: 1,
                rx_messages: 1,
            }
        );

        // Disconnect keeps the counters, a new connect clears them.
        serializer.disconnect().await.unwrap();
        assert!(!serializer.is_connected());
        assert_eq!(serializer.stats().tx_messages, 1);

        serializer.connect(&params).await.unwrap();
        assert_eq!(serializer.stats(), TrafficStats::default());
    }

    #[tokio::test]
    async fn test_failed_operations_not_counted() {
        let bank = MemoryTransport::new();
        let serializer = TransportSerializer::new(bank.clone());

        assert_eq!(
            serializer.read(RegisterKind::Input, 1, 0, 1).await,
            Err(TransportError::NotConnected)
        );

        serializer
            .connect(&ConnectParams::tcp("sim", 502))
            .await
            .unwrap();
        bank.fail_reads_at(RegisterKind::Input, 0, Some("no response"));
        assert!(serializer.read(RegisterKind::Input, 1, 0, 1).await.is_err());
        assert_eq!(serializer.stats(), TrafficStats::default());
    }

    #[tokio::test]
    async fn test_failed_connect_clears_flag() {
        let bank = MemoryTransport::new();
        let serializer = TransportSerializer::new(bank.clone());
        let params = ConnectParams::tcp("sim", 502);

        serializer.connect(&params).await.unwrap();
        assert!(serializer.is_connected());

        bank.fail_connect(Some("refused"));
        assert!(serializer.connect(&params).await.is_err());
        assert!(!serializer.is_connected());
    }

    #[tokio::test]
    async fn test_rtu_write_accounting() {
        let bank = MemoryTransport::new();
        let serializer = TransportSerializer::new(bank.clone());
        let params = ConnectParams::Rtu {
            port: "/dev/null".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: crate::transport::Parity::None,
            stop_bits: 1,
        };

        serializer.connect(&params).await.unwrap();
        serializer
            .write(RegisterKind::Coil, 1, 0, &WriteValues::Bits(vec![true; 9]))
            .await
            .unwrap();

        let stats = serializer.stats();
        assert_eq!(stats.tx_bytes, 7 + 2 + 2);
        assert_eq!(stats.rx_bytes, 8);
        assert!(bank.bit(1, RegisterKind::Coil, 8));
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let serializer = TransportSerializer::new(MemoryTransport::new());
        let mut updates = serializer.subscribe_stats();

        serializer
            .connect(&ConnectParams::tcp("sim", 502))
            .await
            .unwrap();
        serializer
            .read(RegisterKind::Coil, 1, 0, 16)
            .await
            .unwrap();

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().rx_bytes, 7 + 2 + 2);
    }
}
