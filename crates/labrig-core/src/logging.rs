/*!
 * Logging functionality for labrig.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the instrument control layer.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "labrig=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a device instance
///
/// # Arguments
///
/// * `device` - The device name
/// * `instance` - The instance ID of the device
pub fn device_span(device: &str, instance: &str) -> Span {
    tracing::info_span!("device", name = %device, instance = %instance)
}

/// Create a new span for one device operation
///
/// # Arguments
///
/// * `operation` - The name of the operation (device task key)
/// * `device` - The device performing the operation
pub fn operation_span(operation: &str, device: &str) -> Span {
    tracing::info_span!("operation", name = %operation, device = %device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // This will fail if called multiple times in the same process
        // but it's fine for a single test
        let _ = init();
    }

    #[test]
    fn test_device_span() {
        let span = device_span("loader", "loader-1");
        assert!(span.is_none()); // Span is not entered so is_none() should be true
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("reference-run", "loader");
        assert!(span.is_none());
    }
}
