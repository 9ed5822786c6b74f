/*!
 * Function-module handles, commands and notifications.
 *
 * A function module is one slave-side logical unit (a motor axis, a digital
 * channel, a temperature controller, an RFID channel) addressed by a numeric
 * handle over the instrument bus. This module defines the command surface a
 * device uses to start an operation on a module, and the notification types
 * the transport delivers back when the module answers.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use labrig_core::types::ErrorRecord;

/// Numeric handle addressing one function module instance on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle(u32);

impl ModuleHandle {
    /// Create a handle from its raw bus address
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw bus address
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fm#{}", self.0)
    }
}

/// Function module class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleClass {
    /// Stepper motor axis
    Motor,
    /// Digital input channel
    DigitalInput,
    /// Digital output channel
    DigitalOutput,
    /// Temperature controller
    TemperatureControl,
    /// RFID reader channel
    Rfid,
}

impl ModuleClass {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleClass::Motor => "motor",
            ModuleClass::DigitalInput => "digital-input",
            ModuleClass::DigitalOutput => "digital-output",
            ModuleClass::TemperatureControl => "temperature-control",
            ModuleClass::Rfid => "rfid",
        }
    }
}

impl fmt::Display for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Motor operating commands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MotorCommand {
    /// Enable or disable the motor driver stage
    SetState {
        /// Whether the driver stage is enabled
        enabled: bool,
    },
    /// Start a reference (homing) run
    ReferenceRun {
        /// Motion profile index
        profile: u8,
    },
    /// Move to an absolute position in half-steps
    MoveToPosition {
        /// Target position in half-steps
        target: i32,
        /// Motion profile index
        profile: u8,
    },
    /// Rotate at a target speed
    MoveAtSpeed {
        /// Target speed in half-steps per second
        speed: i16,
        /// Motion profile index
        profile: u8,
    },
    /// Request the actual position
    RequestPosition,
    /// Request the actual speed
    RequestSpeed,
}

/// Temperature controller operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempOperatingMode {
    /// Full power heat-up
    Full,
    /// Temperature hold
    Hold,
}

/// Temperature controller commands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TempCommand {
    /// Set the nominal temperature
    SetTemperature {
        /// Nominal temperature in degrees Celsius
        celsius: f32,
    },
    /// Switch temperature regulation on or off
    SetStatus {
        /// Whether regulation is active
        on: bool,
    },
    /// Select the operating mode
    SetOperatingMode {
        /// The operating mode to select
        mode: TempOperatingMode,
    },
    /// Request the actual temperature
    RequestTemperature,
}

/// RFID reader commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfidCommand {
    /// Request the user data block of the tag in range
    RequestData,
    /// Request the unique tag ID of the tag in range
    RequestTag,
}

/// One operation request addressed to a function module
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ModuleCommand {
    /// Motor operation
    Motor(MotorCommand),
    /// Read the digital input value
    DigitalInputRequest,
    /// Set the digital output value
    DigitalOutputSet {
        /// Output value to apply
        value: u16,
    },
    /// Read back the digital output value
    DigitalOutputRequest,
    /// Temperature controller operation
    Temperature(TempCommand),
    /// RFID reader operation
    Rfid(RfidCommand),
}

impl ModuleCommand {
    /// The module class this command is valid for
    pub fn class(&self) -> ModuleClass {
        match self {
            ModuleCommand::Motor(_) => ModuleClass::Motor,
            ModuleCommand::DigitalInputRequest => ModuleClass::DigitalInput,
            ModuleCommand::DigitalOutputSet { .. } | ModuleCommand::DigitalOutputRequest => {
                ModuleClass::DigitalOutput
            }
            ModuleCommand::Temperature(_) => ModuleClass::TemperatureControl,
            ModuleCommand::Rfid(_) => ModuleClass::Rfid,
        }
    }
}

/// Identifies which module operation a notification answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    /// Motor driver state set
    MotorState,
    /// Motor reference run finished
    MotorReferenceRun,
    /// Motor movement finished
    MotorMovement,
    /// Actual motor position report
    MotorActPosition,
    /// Actual motor speed report
    MotorActSpeed,
    /// Digital output value applied
    DigitalOutputValue,
    /// Digital input value report
    DigitalInputValue,
    /// Nominal temperature applied
    TempTemperature,
    /// Temperature regulation status applied
    TempStatus,
    /// Temperature operating mode applied
    TempOperatingMode,
    /// Actual temperature report
    TempActTemperature,
    /// RFID user data report
    RfidData,
    /// RFID tag ID report
    RfidTag,
}

/// Result code of a completed module operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    /// The operation completed successfully
    Ok,
    /// The module answered with a failure code
    Failed(u16),
}

impl AckResult {
    /// Whether the operation succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, AckResult::Ok)
    }
}

/// Operation-specific payload carried by a completion notification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AckPayload {
    /// No payload
    None,
    /// Motor position in half-steps
    MotorPosition(i32),
    /// Motor speed in half-steps per second
    MotorSpeed(i16),
    /// Digital channel value
    DigitalValue(u16),
    /// Temperature in degrees Celsius
    Temperature(f32),
    /// 32-bit RFID user data
    RfidData(u32),
    /// 64-bit RFID tag ID
    RfidTag(u64),
}

/// Completion notification delivered by the transport receive path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleAck {
    /// The answering module
    pub handle: ModuleHandle,
    /// The operation being answered
    pub kind: AckKind,
    /// The module result code
    pub result: AckResult,
    /// Operation-specific payload
    pub payload: AckPayload,
}

impl ModuleAck {
    /// Create a successful ack
    pub fn ok(handle: ModuleHandle, kind: AckKind, payload: AckPayload) -> Self {
        Self {
            handle,
            kind,
            result: AckResult::Ok,
            payload,
        }
    }

    /// Create a failed ack carrying the module result code
    pub fn failed(handle: ModuleHandle, kind: AckKind, code: u16) -> Self {
        Self {
            handle,
            kind,
            result: AckResult::Failed(code),
            payload: AckPayload::None,
        }
    }
}

/// Unsolicited module fault notification (motor stall, overtemperature, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleError {
    /// The faulting module
    pub handle: ModuleHandle,
    /// The fault record reported by the module
    pub record: ErrorRecord,
}

/// Error type for bus transmission failures
#[derive(Error, Debug)]
pub enum BusError {
    /// The transport rejected the command synchronously
    #[error("Module {0} rejected command: {1}")]
    Rejected(ModuleHandle, String),

    /// The transport is not connected
    #[error("Bus offline")]
    Offline,
}

/// The transport seam towards the slave controllers.
///
/// `start` issues the underlying bus request and returns as soon as the
/// command is on its way; completion arrives later through the registry's
/// notification dispatch.
pub trait ModuleBus: Send + Sync + fmt::Debug {
    /// Issue a command to a function module
    fn start(&self, handle: ModuleHandle, command: ModuleCommand) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_class() {
        let cmd = ModuleCommand::Motor(MotorCommand::RequestPosition);
        assert_eq!(cmd.class(), ModuleClass::Motor);

        let cmd = ModuleCommand::DigitalOutputSet { value: 1 };
        assert_eq!(cmd.class(), ModuleClass::DigitalOutput);

        let cmd = ModuleCommand::Temperature(TempCommand::SetTemperature { celsius: 37.0 });
        assert_eq!(cmd.class(), ModuleClass::TemperatureControl);

        let cmd = ModuleCommand::Rfid(RfidCommand::RequestTag);
        assert_eq!(cmd.class(), ModuleClass::Rfid);
    }

    #[test]
    fn test_ack_constructors() {
        let handle = ModuleHandle::new(7);
        let ack = ModuleAck::ok(handle, AckKind::MotorActPosition, AckPayload::MotorPosition(250));
        assert!(ack.result.is_ok());
        assert_eq!(ack.payload, AckPayload::MotorPosition(250));

        let ack = ModuleAck::failed(handle, AckKind::MotorMovement, 0x0042);
        assert_eq!(ack.result, AckResult::Failed(0x0042));
        assert_eq!(ack.payload, AckPayload::None);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(format!("{}", ModuleHandle::new(12)), "fm#12");
    }
}
