//! Poll scheduler: one periodic task per running device or collector.
//!
//! Each task owns nothing but a weak handle to its entity's state cell, so a
//! tick that finishes after the entity was removed has nowhere to write. All
//! traffic goes through the shared [`TransportSerializer`].

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use regpoll_common::{CollectorSnapshot, DeviceSnapshot, TrafficStats};

use crate::catalog::DecoderRegistry;
use crate::codec;
use crate::config::{CollectorConfig, DeviceConfig};
use crate::error::{EngineError, Result};
use crate::expr::Expression;
use crate::manual;
use crate::planner;
use crate::schema::{DeviceDecoder, RegisterKind};
use crate::serializer::TransportSerializer;
use crate::transport::{ConnectParams, RegisterData, TransportError, WriteValues};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(cell: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    cell.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(cell: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    cell.write().unwrap_or_else(PoisonError::into_inner)
}

/// A running periodic task.
struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollTask {
    fn stop(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

struct DeviceSlot {
    decoder: Arc<DeviceDecoder>,
    state: Arc<RwLock<DeviceSnapshot>>,
    task: Option<PollTask>,
}

struct CollectorSlot {
    conversion: Arc<Expression>,
    state: Arc<RwLock<CollectorSnapshot>>,
    kind: RegisterKind,
    task: Option<PollTask>,
}

/// Cancel the slot's task, if any. Callers hold the registry lock.
fn stop_device(id: &str, slot: &mut DeviceSlot) {
    if let Some(task) = slot.task.take() {
        task.stop();
        write(&slot.state).enabled = false;
        debug!(device = %id, "Polling stopped");
    }
}

fn stop_collector(slot: &mut CollectorSlot) {
    if let Some(task) = slot.task.take() {
        task.stop();
        write(&slot.state).enabled = false;
    }
}

/// Registry of devices and collectors sharing one connection.
///
/// Methods that start polling spawn onto the current Tokio runtime.
pub struct PollScheduler {
    registry: Arc<DecoderRegistry>,
    serializer: Arc<TransportSerializer>,
    devices: Mutex<BTreeMap<String, DeviceSlot>>,
    collectors: Mutex<BTreeMap<String, CollectorSlot>>,
}

impl PollScheduler {
    pub fn new(registry: impl Into<Arc<DecoderRegistry>>, serializer: Arc<TransportSerializer>) -> Self {
        Self {
            registry: registry.into(),
            serializer,
            devices: Mutex::new(BTreeMap::new()),
            collectors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    pub fn serializer(&self) -> &Arc<TransportSerializer> {
        &self.serializer
    }

    // --- connection ---

    /// Open the shared connection. Traffic counters restart from zero.
    pub async fn connect(&self, params: &ConnectParams) -> Result<()> {
        self.serializer.connect(params).await?;
        Ok(())
    }

    /// Stop every device and collector, then close the connection.
    pub async fn disconnect(&self) -> Result<()> {
        for (id, slot) in lock(&self.devices).iter_mut() {
            if let Some(task) = slot.task.take() {
                task.stop();
                write(&slot.state).enabled = false;
                debug!(device = %id, "Stopped by disconnect");
            }
        }
        for (id, slot) in lock(&self.collectors).iter_mut() {
            if let Some(task) = slot.task.take() {
                task.stop();
                write(&slot.state).enabled = false;
                debug!(collector = %id, "Stopped by disconnect");
            }
        }

        self.serializer.disconnect().await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.serializer.is_connected()
    }

    pub fn traffic(&self) -> TrafficStats {
        self.serializer.stats()
    }

    // --- devices ---

    /// Attach a decoder to a unit id. Starts polling when `enabled` is set.
    pub fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let decoder = self
            .registry
            .get(&config.decoder)
            .ok_or_else(|| EngineError::UnknownDecoder(config.decoder.clone()))?;
        if config.poll_interval_ms == 0 {
            return Err(EngineError::InvalidInterval(config.id));
        }

        let mut devices = lock(&self.devices);
        if devices.contains_key(&config.id) {
            return Err(EngineError::DuplicateDevice(config.id));
        }

        let unit_id = config.unit_id.unwrap_or(decoder.default_unit_id);
        let snapshot = DeviceSnapshot::new(&config.id, &decoder.id, unit_id, config.poll_interval_ms);
        let mut slot = DeviceSlot {
            decoder,
            state: Arc::new(RwLock::new(snapshot)),
            task: None,
        };

        info!(
            "Device '{}' added (decoder: {}, unit: {}, interval: {}ms)",
            config.id, config.decoder, unit_id, config.poll_interval_ms
        );

        if config.enabled {
            self.start_device(&config.id, &mut slot);
        }
        devices.insert(config.id, slot);
        Ok(())
    }

    /// Remove a device. A tick already waiting for the connection still runs,
    /// but its results are discarded.
    pub fn remove_device(&self, id: &str) -> Result<()> {
        let slot = lock(&self.devices)
            .remove(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;
        if let Some(task) = slot.task {
            task.stop();
        }
        info!("Device '{}' removed", id);
        Ok(())
    }

    pub fn enable_device(&self, id: &str) -> Result<()> {
        let mut devices = lock(&self.devices);
        let slot = devices
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;
        if slot.task.is_none() {
            self.start_device(id, slot);
        }
        Ok(())
    }

    pub fn disable_device(&self, id: &str) -> Result<()> {
        let mut devices = lock(&self.devices);
        let slot = devices
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;
        stop_device(id, slot);
        Ok(())
    }

    /// Flip a device between running and stopped. Returns the new state.
    pub fn toggle_device(&self, id: &str) -> Result<bool> {
        let mut devices = lock(&self.devices);
        let slot = devices
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownDevice(id.to_string()))?;

        if slot.task.is_some() {
            stop_device(id, slot);
            Ok(false)
        } else {
            self.start_device(id, slot);
            Ok(true)
        }
    }

    fn start_device(&self, id: &str, slot: &mut DeviceSlot) {
        let (unit_id, period) = {
            let mut state = write(&slot.state);
            state.enabled = true;
            state.last_error = None;
            (state.unit_id, Duration::from_millis(state.poll_interval_ms as u64))
        };

        let cancel = CancellationToken::new();
        let job = DeviceJob {
            id: id.to_string(),
            decoder: Arc::clone(&slot.decoder),
            unit_id,
            serializer: Arc::clone(&self.serializer),
            state: Arc::downgrade(&slot.state),
        };
        let handle = tokio::spawn(run_periodic(period, cancel.clone(), move |cancel| {
            let job = job.clone();
            async move { job.tick(&cancel).await }
        }));

        debug!(device = %id, period_ms = period.as_millis() as u64, "Polling started");
        slot.task = Some(PollTask { cancel, handle });
    }

    pub fn device(&self, id: &str) -> Option<DeviceSnapshot> {
        lock(&self.devices).get(id).map(|slot| read(&slot.state).clone())
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        lock(&self.devices)
            .values()
            .map(|slot| read(&slot.state).clone())
            .collect()
    }

    // --- collectors ---

    /// Add an ad-hoc poller. The conversion is compiled up front.
    pub fn add_collector(&self, config: CollectorConfig) -> Result<()> {
        let conversion = config
            .compile()
            .map_err(|reason| EngineError::InvalidCollector {
                id: config.id.clone(),
                reason,
            })?;
        if config.poll_interval_ms == 0 {
            return Err(EngineError::InvalidInterval(config.id));
        }

        let mut collectors = lock(&self.collectors);
        if collectors.contains_key(&config.id) {
            return Err(EngineError::DuplicateCollector(config.id));
        }

        let snapshot = CollectorSnapshot {
            id: config.id.clone(),
            name: config.name.clone(),
            register_type: config.register_type.to_string(),
            unit_id: config.unit_id,
            start_address: config.start_address,
            count: config.count,
            poll_interval_ms: config.poll_interval_ms,
            conversion: config.conversion.clone(),
            enabled: false,
            last_value: None,
            last_error: None,
            last_update: None,
        };
        let mut slot = CollectorSlot {
            conversion: Arc::new(conversion),
            state: Arc::new(RwLock::new(snapshot)),
            kind: config.register_type,
            task: None,
        };

        info!(
            "Collector '{}' added ({} {}+{} on unit {})",
            config.id, config.register_type, config.start_address, config.count, config.unit_id
        );

        if config.enabled {
            self.start_collector(&config.id, &mut slot);
        }
        collectors.insert(config.id, slot);
        Ok(())
    }

    pub fn remove_collector(&self, id: &str) -> Result<()> {
        let slot = lock(&self.collectors)
            .remove(id)
            .ok_or_else(|| EngineError::UnknownCollector(id.to_string()))?;
        if let Some(task) = slot.task {
            task.stop();
        }
        info!("Collector '{}' removed", id);
        Ok(())
    }

    pub fn enable_collector(&self, id: &str) -> Result<()> {
        let mut collectors = lock(&self.collectors);
        let slot = collectors
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownCollector(id.to_string()))?;
        if slot.task.is_none() {
            self.start_collector(id, slot);
        }
        Ok(())
    }

    pub fn disable_collector(&self, id: &str) -> Result<()> {
        let mut collectors = lock(&self.collectors);
        let slot = collectors
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownCollector(id.to_string()))?;
        stop_collector(slot);
        Ok(())
    }

    pub fn toggle_collector(&self, id: &str) -> Result<bool> {
        let mut collectors = lock(&self.collectors);
        let slot = collectors
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownCollector(id.to_string()))?;

        if slot.task.is_some() {
            stop_collector(slot);
            Ok(false)
        } else {
            self.start_collector(id, slot);
            Ok(true)
        }
    }

    fn start_collector(&self, id: &str, slot: &mut CollectorSlot) {
        let (unit_id, start, count, period) = {
            let mut state = write(&slot.state);
            state.enabled = true;
            state.last_error = None;
            (
                state.unit_id,
                state.start_address,
                state.count,
                Duration::from_millis(state.poll_interval_ms as u64),
            )
        };

        let cancel = CancellationToken::new();
        let job = CollectorJob {
            id: id.to_string(),
            kind: slot.kind,
            unit_id,
            start,
            count,
            conversion: Arc::clone(&slot.conversion),
            serializer: Arc::clone(&self.serializer),
            state: Arc::downgrade(&slot.state),
        };
        let handle = tokio::spawn(run_periodic(period, cancel.clone(), move |_| {
            let job = job.clone();
            async move { job.tick().await }
        }));

        debug!(collector = %id, period_ms = period.as_millis() as u64, "Polling started");
        slot.task = Some(PollTask { cancel, handle });
    }

    pub fn collector(&self, id: &str) -> Option<CollectorSnapshot> {
        lock(&self.collectors).get(id).map(|slot| read(&slot.state).clone())
    }

    pub fn collectors(&self) -> Vec<CollectorSnapshot> {
        lock(&self.collectors)
            .values()
            .map(|slot| read(&slot.state).clone())
            .collect()
    }

    // --- manual access ---

    /// One-shot read through the shared connection.
    pub async fn read(&self, kind: RegisterKind, unit_id: u8, start: u16, count: u16) -> Result<RegisterData> {
        if count == 0 {
            return Err(EngineError::Transport(TransportError::InvalidRequest(
                "count must be at least 1".to_string(),
            )));
        }
        Ok(self.serializer.read(kind, unit_id, start, count).await?)
    }

    /// One-shot read rendered as a bracketed list, e.g. `[1, 2]`.
    pub async fn read_text(&self, kind: RegisterKind, unit_id: u8, start: u16, count: u16) -> Result<String> {
        let data = self.read(kind, unit_id, start, count).await?;
        Ok(manual::format_values(&data))
    }

    /// One-shot write through the shared connection.
    pub async fn write(&self, kind: RegisterKind, unit_id: u8, start: u16, values: &WriteValues) -> Result<()> {
        if !kind.is_writable() {
            return Err(manual::read_only());
        }
        if values.is_empty() {
            return Err(EngineError::InvalidWrite("No value provided".to_string()));
        }
        Ok(self.serializer.write(kind, unit_id, start, values).await?)
    }

    /// Parse user input and write it.
    pub async fn write_text(&self, kind: RegisterKind, unit_id: u8, start: u16, text: &str) -> Result<()> {
        let values = manual::parse_write_values(kind, text)?;
        self.write(kind, unit_id, start, &values).await
    }

    /// Stop all polling and wait for running ticks to finish.
    pub async fn shutdown(&self) {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for slot in lock(&self.devices).values_mut() {
            if let Some(task) = slot.task.take() {
                handles.push(task.stop());
                write(&slot.state).enabled = false;
            }
        }
        for slot in lock(&self.collectors).values_mut() {
            if let Some(task) = slot.task.take() {
                handles.push(task.stop());
                write(&slot.state).enabled = false;
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Poll task ended abnormally");
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        let devices = self.devices.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in devices.values_mut() {
            if let Some(task) = slot.task.take() {
                task.stop();
            }
        }
        let collectors = self.collectors.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in collectors.values_mut() {
            if let Some(task) = slot.task.take() {
                task.stop();
            }
        }
    }
}

/// Whether the entity is still registered after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Alive,
    Gone,
}

/// Fire `tick` every `period`, first after one full period, until cancelled.
///
/// A tick is skipped while the connection is down; overrunning ticks push
/// the schedule back instead of bursting.
async fn run_periodic<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Option<TickOutcome>>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(TickOutcome::Gone) = tick(cancel.clone()).await {
            break;
        }
    }
}

#[derive(Clone)]
struct DeviceJob {
    id: String,
    decoder: Arc<DeviceDecoder>,
    unit_id: u8,
    serializer: Arc<TransportSerializer>,
    state: Weak<RwLock<DeviceSnapshot>>,
}

impl DeviceJob {
    /// One pass over every window. Returns `None` when not connected.
    async fn tick(&self, cancel: &CancellationToken) -> Option<TickOutcome> {
        if !self.serializer.is_connected() {
            return None;
        }

        let mut any_success = false;
        for window in planner::plan(&self.decoder.fields) {
            if cancel.is_cancelled() {
                break;
            }

            let result = self
                .serializer
                .read(window.kind, self.unit_id, window.start, window.count())
                .await;

            let Some(cell) = self.state.upgrade() else {
                debug!(device = %self.id, "Device removed, dropping result");
                return Some(TickOutcome::Gone);
            };
            let mut state = write(&cell);

            match result {
                Ok(data) => {
                    for field in &window.fields {
                        match codec::decode(&data, window.offset_of(field), field) {
                            Ok(decoded) => {
                                state.raw_values.insert(field.name.clone(), decoded.raw);
                                state.display_values.insert(field.name.clone(), decoded.display);
                            }
                            Err(e) => debug!(device = %self.id, error = %e, "Field skipped"),
                        }
                    }
                    state.last_error = None;
                    any_success = true;
                }
                Err(e) => {
                    warn!(
                        "Device '{}': {} {}..={} failed: {}",
                        self.id, window.kind, window.start, window.end, e
                    );
                    state.last_error = Some(e.to_string());
                }
            }
        }

        let Some(cell) = self.state.upgrade() else {
            return Some(TickOutcome::Gone);
        };
        if any_success {
            write(&cell).last_update = Some(Utc::now());
        }
        Some(TickOutcome::Alive)
    }
}

#[derive(Clone)]
struct CollectorJob {
    id: String,
    kind: RegisterKind,
    unit_id: u8,
    start: u16,
    count: u16,
    conversion: Arc<Expression>,
    serializer: Arc<TransportSerializer>,
    state: Weak<RwLock<CollectorSnapshot>>,
}

impl CollectorJob {
    async fn tick(&self) -> Option<TickOutcome> {
        if !self.serializer.is_connected() {
            return None;
        }

        let result = self
            .serializer
            .read(self.kind, self.unit_id, self.start, self.count)
            .await;

        let Some(cell) = self.state.upgrade() else {
            debug!(collector = %self.id, "Collector removed, dropping result");
            return Some(TickOutcome::Gone);
        };
        let mut state = write(&cell);

        match result {
            Ok(data) => match self.conversion.eval_conversion(&data) {
                Ok(value) => {
                    state.last_value = Some(value);
                    state.last_error = None;
                    state.last_update = Some(Utc::now());
                }
                Err(e) => {
                    debug!(collector = %self.id, error = %e, "Conversion failed");
                    state.last_error = Some(format!("Expression error: {}", e));
                }
            },
            Err(e) => {
                warn!("Collector '{}': read failed: {}", self.id, e);
                state.last_error = Some(e.to_string());
            }
        }
        Some(TickOutcome::Alive)
    }
}
