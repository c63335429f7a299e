//! In-process register bank implementing [`RegisterTransport`].
//!
//! Every unit id owns four independent address spaces. Unset addresses read
//! as zero/false. Clones share the same bank, so a test can keep a handle
//! to seed values and inspect the request log while the serializer owns
//! another.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{ConnectParams, RegisterData, RegisterTransport, TransportError, WriteValues};
use crate::schema::RegisterKind;

/// One completed request, as observed by the bank.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub kind: RegisterKind,
    pub unit_id: u8,
    pub start: u16,
    pub count: u16,
    pub write: bool,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct Bank {
    connected: bool,
    connects: usize,
    words: HashMap<(u8, RegisterKind), BTreeMap<u16, u16>>,
    bits: HashMap<(u8, RegisterKind), BTreeMap<u16, bool>>,
    latency: Duration,
    connect_failure: Option<String>,
    read_failures: HashMap<(RegisterKind, u16), String>,
    in_flight: usize,
    max_in_flight: usize,
    log: Vec<RequestRecord>,
}

/// Simulated device bank.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    bank: Arc<Mutex<Bank>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&self) -> MutexGuard<'_, Bank> {
        self.bank.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay applied to every request.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.bank().latency = latency;
        self
    }

    /// Store words in a holding or input register space.
    pub fn set_words(&self, unit_id: u8, kind: RegisterKind, start: u16, values: &[u16]) {
        let mut bank = self.bank();
        let space = bank.words.entry((unit_id, kind)).or_default();
        for (i, value) in values.iter().enumerate() {
            space.insert(start.wrapping_add(i as u16), *value);
        }
    }

    /// Store bits in a coil or discrete input space.
    pub fn set_bits(&self, unit_id: u8, kind: RegisterKind, start: u16, values: &[bool]) {
        let mut bank = self.bank();
        let space = bank.bits.entry((unit_id, kind)).or_default();
        for (i, value) in values.iter().enumerate() {
            space.insert(start.wrapping_add(i as u16), *value);
        }
    }

    pub fn word(&self, unit_id: u8, kind: RegisterKind, address: u16) -> u16 {
        self.bank()
            .words
            .get(&(unit_id, kind))
            .and_then(|space| space.get(&address).copied())
            .unwrap_or(0)
    }

    pub fn bit(&self, unit_id: u8, kind: RegisterKind, address: u16) -> bool {
        self.bank()
            .bits
            .get(&(unit_id, kind))
            .and_then(|space| space.get(&address).copied())
            .unwrap_or(false)
    }

    /// Make the next connects fail with `message`, or succeed again with `None`.
    pub fn fail_connect(&self, message: Option<&str>) {
        self.bank().connect_failure = message.map(str::to_string);
    }

    /// Make reads starting at `start` fail, or succeed again with `None`.
    pub fn fail_reads_at(&self, kind: RegisterKind, start: u16, message: Option<&str>) {
        let mut bank = self.bank();
        match message {
            Some(msg) => {
                bank.read_failures.insert((kind, start), msg.to_string());
            }
            None => {
                bank.read_failures.remove(&(kind, start));
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bank().connected
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.bank().connects
    }

    /// Highest number of requests ever executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.bank().max_in_flight
    }

    /// Completed requests in completion order.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.bank().log.clone()
    }

    async fn exchange(&self, kind: RegisterKind, unit_id: u8, start: u16, count: u16, write: bool) {
        let started = Instant::now();
        let latency = {
            let mut bank = self.bank();
            bank.in_flight += 1;
            bank.max_in_flight = bank.max_in_flight.max(bank.in_flight);
            bank.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut bank = self.bank();
        bank.in_flight -= 1;
        bank.log.push(RequestRecord {
            kind,
            unit_id,
            start,
            count,
            write,
            started,
            finished: Instant::now(),
        });
    }
}

#[async_trait]
impl RegisterTransport for MemoryTransport {
    async fn connect(&mut self, _params: &ConnectParams) -> Result<(), TransportError> {
        let mut bank = self.bank();
        if let Some(message) = bank.connect_failure.clone() {
            bank.connected = false;
            return Err(TransportError::Connect(message));
        }
        bank.connected = true;
        bank.connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.bank().connected = false;
        Ok(())
    }

    async fn read(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<RegisterData, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.exchange(kind, unit_id, start, count, false).await;

        let bank = self.bank();
        if let Some(message) = bank.read_failures.get(&(kind, start)) {
            return Err(TransportError::Read(message.clone()));
        }
        if start as u32 + count as u32 > u16::MAX as u32 + 1 {
            return Err(TransportError::Exception("IllegalDataAddress".to_string()));
        }

        let addresses = (0..count).map(|i| start + i);
        if kind.is_bit() {
            let space = bank.bits.get(&(unit_id, kind));
            Ok(RegisterData::Bits(
                addresses
                    .map(|a| space.and_then(|s| s.get(&a).copied()).unwrap_or(false))
                    .collect(),
            ))
        } else {
            let space = bank.words.get(&(unit_id, kind));
            Ok(RegisterData::Words(
                addresses
                    .map(|a| space.and_then(|s| s.get(&a).copied()).unwrap_or(0))
                    .collect(),
            ))
        }
    }

    async fn write(
        &mut self,
        kind: RegisterKind,
        unit_id: u8,
        start: u16,
        values: &WriteValues,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        values.check_kind(kind)?;

        self.exchange(kind, unit_id, start, values.len() as u16, true)
            .await;

        match values {
            WriteValues::Words(words) => self.set_words(unit_id, kind, start, words),
            WriteValues::Bits(bits) => self.set_bits(unit_id, kind, start, bits),
        }
        Ok(())
    }
}
