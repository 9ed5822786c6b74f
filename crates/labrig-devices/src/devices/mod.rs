/*!
 * Concrete device types.
 *
 * Each device instantiates the generic engine with its own
 * [`DeviceLogic`](crate::runtime::DeviceLogic): a fixed module set, a fixed
 * operation catalog wired as device tasks, and cached actual values with
 * synchronous getters. Module keys, named positions, motion profiles and
 * timeout overrides come from the per-device [`DeviceConfig`] table; every
 * lookup falls back to the documented default so an empty table yields a
 * working device.
 */
use std::time::Duration;

pub mod agitation;
pub mod heated_vessels;
pub mod hood_sensor;
pub mod loader;
pub mod rack_transfer;
pub mod water;

pub use agitation::{Agitation, AgitationLogic};
pub use heated_vessels::{HeatedVessels, HeatedVesselsLogic, VesselTarget, VESSEL_COUNT};
pub use hood_sensor::{HoodSensor, HoodSensorLogic, HoodState};
pub use loader::{Loader, LoaderLogic, LoaderPosition};
pub use rack_transfer::{RackTransfer, RackTransferLogic};
pub use water::{Water, WaterLogic, ValveTarget, VALVE_COUNT};

/// Default timeout for simple read/set requests
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Default timeout for motion operations (reference runs, positioning)
pub(crate) const MOTION_TIMEOUT: Duration = Duration::from_millis(5000);
