/*!
 * Upward reporting channels for devices.
 *
 * Devices publish lifecycle and consolidated-result events on a broadcast
 * channel (the external interface), and forward fault records to the shared
 * fault log (the device-processing layer). The error sub-machine guarantees
 * every fault reaches the log exactly once.
 */
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::error;

use labrig_core::types::{ErrorRecord, Id};

use crate::runtime::MainState;

/// Events published by a device to its external caller
#[derive(Debug, Clone, Serialize)]
pub enum DeviceEvent {
    /// The main life-cycle state has changed
    StateChanged {
        /// The device instance ID
        instance: Id,
        /// The old state
        old_state: MainState,
        /// The new state
        new_state: MainState,
    },
    /// A device operation resolved; carries the consolidated result
    OperationFinished {
        /// The device instance ID
        instance: Id,
        /// The device task key of the operation
        operation: Id,
        /// Whether every module task completed successfully
        success: bool,
        /// Operation-specific derived value (drawer position, temperature, ...)
        value: serde_json::Value,
    },
    /// An unsolicited device observation (hood opened/closed, ...)
    ValueChanged {
        /// The device instance ID
        instance: Id,
        /// The observed property
        property: String,
        /// The new value
        value: serde_json::Value,
    },
    /// A fault was surfaced to the external interface
    Fault {
        /// The device instance ID
        instance: Id,
        /// The fault record
        record: ErrorRecord,
    },
}

/// One entry in the shared fault log
#[derive(Debug, Clone, PartialEq)]
pub struct FaultEntry {
    /// The reporting device instance
    pub instance: Id,
    /// The reported fault
    pub record: ErrorRecord,
}

/// Shared device-processing fault log.
///
/// Collects every fault forwarded by the devices' error sub-machines.
#[derive(Debug, Default)]
pub struct FaultLog {
    entries: Mutex<Vec<FaultEntry>>,
}

impl FaultLog {
    /// Create an empty fault log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault reported by a device
    pub fn report(&self, instance: &Id, record: &ErrorRecord) {
        error!("Device {} fault: {}", instance, record);
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(FaultEntry {
                instance: instance.clone(),
                record: record.clone(),
            });
    }

    /// All recorded faults, in reporting order
    pub fn entries(&self) -> Vec<FaultEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded faults
    pub fn count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A shared fault log that can be cloned across devices
pub type SharedFaultLog = Arc<FaultLog>;

/// Create a broadcast channel pair for device events
pub fn device_event_channel() -> (broadcast::Sender<DeviceEvent>, broadcast::Receiver<DeviceEvent>) {
    broadcast::channel(100)
}
