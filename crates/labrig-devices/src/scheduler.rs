/*!
 * Cooperative device tick scheduler.
 *
 * The scheduler owns the host role the device engine assumes: it ticks every
 * registered device at a fixed cadence from a single tokio task, so all
 * device state machines advance cooperatively. Shutdown is signalled through
 * a watch channel and waits for the loop to drain.
 */
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use labrig_core::config::SchedulerConfig;
use labrig_core::types::Id;

use crate::runtime::{Device, DeviceLogic};

/// A device the scheduler can drive
pub trait TickDevice: Send + Sync {
    /// The device instance ID
    fn instance_id(&self) -> Id;

    /// Advance the device by one cooperative step
    fn tick_at(&self, now: Instant);
}

impl<L: DeviceLogic> TickDevice for Device<L> {
    fn instance_id(&self) -> Id {
        self.instance()
    }

    fn tick_at(&self, now: Instant) {
        self.tick(now);
    }
}

/// Scheduler lifecycle events
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The tick loop started
    Started,
    /// The tick loop stopped
    Stopped,
    /// A device was registered
    DeviceRegistered {
        /// The device instance ID
        instance: Id,
    },
}

/// Device tick scheduler
pub struct DeviceScheduler {
    devices: Arc<Mutex<Vec<Arc<dyn TickDevice>>>>,
    tick_interval: Duration,
    event_tx: broadcast::Sender<SchedulerEvent>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScheduler")
            .field("tick_interval", &self.tick_interval)
            .field("devices", &self.device_count())
            .finish()
    }
}

impl DeviceScheduler {
    /// Create a new scheduler with the configured tick cadence
    pub fn new(config: &SchedulerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            devices: Arc::new(Mutex::new(Vec::new())),
            tick_interval: config.tick_interval(),
            event_tx,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Register a device to be ticked
    pub fn register_device(&self, device: Arc<dyn TickDevice>) {
        let instance = device.instance_id();
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(device);
        info!("Registered device {} with scheduler", instance);
        let _ = self
            .event_tx
            .send(SchedulerEvent::DeviceRegistered { instance });
    }

    /// Number of registered devices
    pub fn device_count(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Tick every registered device once, immediately
    pub fn tick_all(&self) {
        let devices: Vec<Arc<dyn TickDevice>> = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let now = Instant::now();
        for device in devices {
            device.tick_at(now);
        }
    }

    /// Start the tick loop
    pub fn start(&self) {
        let mut task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() {
            warn!("Device scheduler is already running");
            return;
        }

        let devices = Arc::clone(&self.devices);
        let tick_interval = self.tick_interval;
        let event_tx = self.event_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            let _ = event_tx.send(SchedulerEvent::Started);
            info!(
                "Device scheduler started (tick interval {:?})",
                tick_interval
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot: Vec<Arc<dyn TickDevice>> = devices
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .clone();
                        let now = Instant::now();
                        for device in snapshot {
                            device.tick_at(now);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        // A dropped sender also ends the loop
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            let _ = event_tx.send(SchedulerEvent::Stopped);
            info!("Device scheduler stopped");
        }));
    }

    /// Stop the tick loop and wait for it to finish
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
