/*!
 * Labrig Modules
 *
 * This crate provides the function-module layer of the labrig instrument
 * control stack: module handles and command surfaces, the symbolic-key
 * registry with completion/fault routing, and a simulated bus transport.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labrig_core::prelude;

pub mod module;
pub mod registry;
pub mod sim;

// Re-export the module contract types
pub use module::{
    AckKind, AckPayload, AckResult, BusError, ModuleAck, ModuleBus, ModuleClass, ModuleCommand,
    ModuleError, ModuleHandle, MotorCommand, RfidCommand, TempCommand, TempOperatingMode,
};
pub use registry::{ModuleRegistry, RegistryEvent};
pub use sim::SimBus;

/// Labrig modules crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the module layer
pub fn init() -> Result<(), labrig_core::error::Error> {
    tracing::info!("Labrig Modules {} initialized", VERSION);
    Ok(())
}
