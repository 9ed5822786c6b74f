/*!
 * Labrig Devices
 *
 * This crate provides the device layer of the labrig instrument control
 * stack: the task data model and task manager, the generic per-device
 * engine (main state machine, error sub-machine, request dispatch), the
 * concrete devices built on it, and the cooperative tick scheduler.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labrig_core::prelude;

// Re-export types from labrig_core for convenience
pub use labrig_core::types::{ErrorRecord, Id};

pub mod devices;
pub mod error;
pub mod events;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod task_manager;

// Re-export main types for convenience
pub use devices::{
    Agitation, HeatedVessels, HoodSensor, HoodState, Loader, LoaderPosition, RackTransfer,
    ValveTarget, VesselTarget, Water,
};
pub use error::{DeviceError, Result};
pub use events::{DeviceEvent, FaultLog, SharedFaultLog};
pub use runtime::{
    Activation, Device, DeviceLogic, ErrorMachineState, MainState, Reporter, RequestSlot,
    TaskOutcome,
};
pub use scheduler::{DeviceScheduler, SchedulerEvent, TickDevice};
pub use task::{DeviceTask, DeviceTaskState, ModuleTask, StartTrigger, TaskFault, TaskState};
pub use task_manager::ScanOutcome;

/// Labrig devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<()> {
    tracing::info!("Labrig Devices {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
