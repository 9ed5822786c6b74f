/*!
 * Prelude module for Labrig Core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{ErrorRecord, Id};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, DeviceConfig, SharedConfig};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
