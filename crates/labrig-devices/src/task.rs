/*!
 * Task data model for the device engine.
 *
 * A [`ModuleTask`] is one request/response unit addressed to a single
 * function module. A [`DeviceTask`] is a named, repeatable device operation
 * composed of an ordered set of module tasks. Device tasks are built once at
 * device configuration time and reused for every invocation of their
 * operation.
 */
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use labrig_core::types::Id;
use labrig_modules::{
    AckKind, AckPayload, ModuleAck, ModuleCommand, ModuleHandle, MotorCommand, RfidCommand,
    TempCommand, TempOperatingMode,
};

/// Lifecycle state of one module task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting to be started
    Init,
    /// Command issued, waiting for the module's answer
    Progress,
    /// The module answered successfully
    Finished,
    /// The task failed (start failure, timeout or module failure)
    Error,
}

/// Start-ordering rule of a module task relative to its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// May start as soon as the device task begins
    First,
    /// May start only once the referenced sibling is Finished
    AfterSibling(u8),
}

/// Why a module task ended in Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFault {
    /// The bus rejected the start synchronously
    StartFailed,
    /// The module did not answer within the timeout budget
    Timeout,
    /// The module answered with a failure code
    ModuleFailure(u16),
}

/// Motor sub-operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorSubtask {
    /// Enable or disable the driver stage
    SetState {
        /// Whether the driver stage is enabled
        enabled: bool,
    },
    /// Reference (homing) run
    ReferenceRun,
    /// Move to an absolute position in half-steps
    MoveToPosition {
        /// Target position in half-steps
        target: i32,
    },
    /// Rotate at a target speed
    MoveAtSpeed {
        /// Target speed in half-steps per second
        speed: i16,
    },
    /// Request the actual position
    RequestPosition,
    /// Request the actual speed
    RequestSpeed,
}

/// Motor task payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorTaskData {
    /// The motor sub-operation, including its request parameters
    pub subtask: MotorSubtask,
    /// Motion profile index
    pub profile: u8,
    /// Actual position written back by the completion
    pub act_position: Option<i32>,
    /// Actual speed written back by the completion
    pub act_speed: Option<i16>,
}

/// Digital-output sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitalOutputSubtask {
    /// Apply an output value
    SetValue {
        /// The value to apply
        value: u16,
    },
    /// Read back the output value
    RequestValue,
}

/// Digital-output task payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalOutputTaskData {
    /// The digital-output sub-operation
    pub subtask: DigitalOutputSubtask,
    /// Value written back by the completion
    pub act_value: Option<u16>,
}

/// Digital-input task payload (the only sub-operation is a value request)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalInputTaskData {
    /// Value written back by the completion
    pub act_value: Option<u16>,
}

/// Temperature-control sub-operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempSubtask {
    /// Set the nominal temperature
    SetTemperature {
        /// Nominal temperature in degrees Celsius
        celsius: f32,
    },
    /// Switch regulation on or off
    SetStatus {
        /// Whether regulation is active
        on: bool,
    },
    /// Select the operating mode
    SetOperatingMode {
        /// The operating mode
        mode: TempOperatingMode,
    },
    /// Request the actual temperature
    RequestTemperature,
}

/// Temperature-control task payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempTaskData {
    /// The temperature sub-operation
    pub subtask: TempSubtask,
    /// Actual temperature written back by the completion
    pub act_temperature: Option<f32>,
}

/// RFID sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfidSubtask {
    /// Request the user data block
    RequestData,
    /// Request the unique tag ID
    RequestTag,
}

/// RFID task payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfidTaskData {
    /// The RFID sub-operation
    pub subtask: RfidSubtask,
    /// User data written back by the completion
    pub data: Option<u32>,
    /// Tag ID written back by the completion
    pub tag: Option<u64>,
}

/// Tagged task variant, one per function-module class
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskKind {
    /// Stepper motor operation
    Motor(MotorTaskData),
    /// Digital input read
    DigitalInput(DigitalInputTaskData),
    /// Digital output operation
    DigitalOutput(DigitalOutputTaskData),
    /// Temperature controller operation
    TemperatureControl(TempTaskData),
    /// RFID reader operation
    Rfid(RfidTaskData),
}

/// One requested operation on one function module
#[derive(Debug, Clone)]
pub struct ModuleTask {
    /// The operation and its payload
    pub kind: TaskKind,
    /// Lifecycle state
    pub state: TaskState,
    /// Start-ordering rule
    pub trigger: StartTrigger,
    /// The module that processes this task, resolved at configuration time
    pub module: Option<ModuleHandle>,
    /// Duration budget from start to completion
    pub timeout: Duration,
    /// Set when the task transitions Init -> Progress
    pub started_at: Option<Instant>,
    /// Why the task ended in Error, valid once state == Error
    pub fault: Option<TaskFault>,
}

impl ModuleTask {
    /// Create a new module task in the Init state
    pub fn new(kind: TaskKind, trigger: StartTrigger, timeout: Duration) -> Self {
        Self {
            kind,
            state: TaskState::Init,
            trigger,
            module: None,
            timeout,
            started_at: None,
            fault: None,
        }
    }

    /// Bind the task to its resolved module handle
    pub fn bind(mut self, module: ModuleHandle) -> Self {
        self.module = Some(module);
        self
    }

    /// Build the bus command for this task
    pub fn command(&self) -> ModuleCommand {
        match &self.kind {
            TaskKind::Motor(data) => ModuleCommand::Motor(match data.subtask {
                MotorSubtask::SetState { enabled } => MotorCommand::SetState { enabled },
                MotorSubtask::ReferenceRun => MotorCommand::ReferenceRun {
                    profile: data.profile,
                },
                MotorSubtask::MoveToPosition { target } => MotorCommand::MoveToPosition {
                    target,
                    profile: data.profile,
                },
                MotorSubtask::MoveAtSpeed { speed } => MotorCommand::MoveAtSpeed {
                    speed,
                    profile: data.profile,
                },
                MotorSubtask::RequestPosition => MotorCommand::RequestPosition,
                MotorSubtask::RequestSpeed => MotorCommand::RequestSpeed,
            }),
            TaskKind::DigitalInput(_) => ModuleCommand::DigitalInputRequest,
            TaskKind::DigitalOutput(data) => match data.subtask {
                DigitalOutputSubtask::SetValue { value } => ModuleCommand::DigitalOutputSet { value },
                DigitalOutputSubtask::RequestValue => ModuleCommand::DigitalOutputRequest,
            },
            TaskKind::TemperatureControl(data) => ModuleCommand::Temperature(match data.subtask {
                TempSubtask::SetTemperature { celsius } => TempCommand::SetTemperature { celsius },
                TempSubtask::SetStatus { on } => TempCommand::SetStatus { on },
                TempSubtask::SetOperatingMode { mode } => TempCommand::SetOperatingMode { mode },
                TempSubtask::RequestTemperature => TempCommand::RequestTemperature,
            }),
            TaskKind::Rfid(data) => ModuleCommand::Rfid(match data.subtask {
                RfidSubtask::RequestData => RfidCommand::RequestData,
                RfidSubtask::RequestTag => RfidCommand::RequestTag,
            }),
        }
    }

    /// Which notification kind answers this task
    pub fn expected_ack(&self) -> AckKind {
        match &self.kind {
            TaskKind::Motor(data) => match data.subtask {
                MotorSubtask::SetState { .. } => AckKind::MotorState,
                MotorSubtask::ReferenceRun => AckKind::MotorReferenceRun,
                MotorSubtask::MoveToPosition { .. } | MotorSubtask::MoveAtSpeed { .. } => {
                    AckKind::MotorMovement
                }
                MotorSubtask::RequestPosition => AckKind::MotorActPosition,
                MotorSubtask::RequestSpeed => AckKind::MotorActSpeed,
            },
            TaskKind::DigitalInput(_) => AckKind::DigitalInputValue,
            TaskKind::DigitalOutput(_) => AckKind::DigitalOutputValue,
            TaskKind::TemperatureControl(data) => match data.subtask {
                TempSubtask::SetTemperature { .. } => AckKind::TempTemperature,
                TempSubtask::SetStatus { .. } => AckKind::TempStatus,
                TempSubtask::SetOperatingMode { .. } => AckKind::TempOperatingMode,
                TempSubtask::RequestTemperature => AckKind::TempActTemperature,
            },
            TaskKind::Rfid(data) => match data.subtask {
                RfidSubtask::RequestData => AckKind::RfidData,
                RfidSubtask::RequestTag => AckKind::RfidTag,
            },
        }
    }

    /// Whether this in-progress task is answered by the given notification.
    ///
    /// Matching is by module handle and sub-operation kind; several tasks of
    /// one device task may share a module instance, so the caller enumerates
    /// candidates and applies the notification to the first match.
    pub fn matches_ack(&self, ack: &ModuleAck) -> bool {
        self.state == TaskState::Progress
            && self.module == Some(ack.handle)
            && self.expected_ack() == ack.kind
    }

    /// Apply a completion notification: copy the payload into the task and
    /// advance the state to Finished, or record the module failure code and
    /// advance to Error.
    pub fn apply_ack(&mut self, ack: &ModuleAck) {
        match ack.result {
            labrig_modules::AckResult::Ok => {
                match (&mut self.kind, ack.payload) {
                    (TaskKind::Motor(data), AckPayload::MotorPosition(pos)) => {
                        data.act_position = Some(pos);
                    }
                    (TaskKind::Motor(data), AckPayload::MotorSpeed(speed)) => {
                        data.act_speed = Some(speed);
                    }
                    (TaskKind::DigitalInput(data), AckPayload::DigitalValue(value)) => {
                        data.act_value = Some(value);
                    }
                    (TaskKind::DigitalOutput(data), AckPayload::DigitalValue(value)) => {
                        data.act_value = Some(value);
                    }
                    (TaskKind::TemperatureControl(data), AckPayload::Temperature(celsius)) => {
                        data.act_temperature = Some(celsius);
                    }
                    (TaskKind::Rfid(data), AckPayload::RfidData(value)) => {
                        data.data = Some(value);
                    }
                    (TaskKind::Rfid(data), AckPayload::RfidTag(value)) => {
                        data.tag = Some(value);
                    }
                    _ => {}
                }
                self.state = TaskState::Finished;
            }
            labrig_modules::AckResult::Failed(code) => {
                self.fault = Some(TaskFault::ModuleFailure(code));
                self.state = TaskState::Error;
            }
        }
    }

    /// Whether the task has exceeded its timeout budget
    pub fn timed_out(&self, now: Instant) -> bool {
        match (self.state, self.started_at) {
            (TaskState::Progress, Some(started_at)) => {
                now.saturating_duration_since(started_at) > self.timeout
            }
            _ => false,
        }
    }

    /// Reset the task back to Init, clearing run state and write-back fields
    pub fn reset(&mut self) {
        self.state = TaskState::Init;
        self.started_at = None;
        self.fault = None;
        match &mut self.kind {
            TaskKind::Motor(data) => {
                data.act_position = None;
                data.act_speed = None;
            }
            TaskKind::DigitalInput(data) => data.act_value = None,
            TaskKind::DigitalOutput(data) => data.act_value = None,
            TaskKind::TemperatureControl(data) => data.act_temperature = None,
            TaskKind::Rfid(data) => {
                data.data = None;
                data.tag = None;
            }
        }
    }
}

/// Lifecycle state of one device task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTaskState {
    /// Never activated since the last reset
    Unused,
    /// Activated, not yet ticked
    Start,
    /// At least one tick has run with tasks in flight
    Progress,
    /// All module tasks completed successfully
    Finished,
    /// At least one module task ended in Error
    Error,
}

/// A named, repeatable device operation: an ordered set of module tasks
/// keyed by a small integer index. Insertion order defines the sibling
/// numbering referenced by [`StartTrigger::AfterSibling`].
#[derive(Debug, Clone)]
pub struct DeviceTask {
    /// The operation name
    pub key: Id,
    /// Lifecycle state
    pub state: DeviceTaskState,
    /// The module tasks by index
    pub tasks: BTreeMap<u8, ModuleTask>,
}

impl DeviceTask {
    /// Create a new, empty device task
    pub fn new<K: Into<Id>>(key: K) -> Self {
        Self {
            key: key.into(),
            state: DeviceTaskState::Unused,
            tasks: BTreeMap::new(),
        }
    }

    /// Add a module task under the given index
    pub fn with_task(mut self, index: u8, task: ModuleTask) -> Self {
        self.tasks.insert(index, task);
        self
    }

    /// Activate the device task: reset every module task to Init and enter
    /// the Start state. Only a task in the Unused state may be activated.
    pub fn activate(&mut self) -> Result<(), crate::error::DeviceError> {
        self.activate_subset(None)
    }

    /// Activate only the selected module tasks; the remaining siblings are
    /// parked as Finished so the startup scan skips them. `None` selects all.
    pub fn activate_subset(
        &mut self,
        selected: Option<&[u8]>,
    ) -> Result<(), crate::error::DeviceError> {
        if self.state != DeviceTaskState::Unused {
            return Err(crate::error::DeviceError::invalid_state(format!(
                "Device task {} is not reusable in state {:?}",
                self.key, self.state
            )));
        }

        for (index, task) in self.tasks.iter_mut() {
            task.reset();
            if let Some(selected) = selected {
                if !selected.contains(index) {
                    task.state = TaskState::Finished;
                }
            }
        }
        self.state = DeviceTaskState::Start;
        Ok(())
    }

    /// Reset the device task and all module tasks, preparing the next
    /// activation. Idempotent.
    pub fn reset(&mut self) {
        for task in self.tasks.values_mut() {
            task.reset();
        }
        self.state = DeviceTaskState::Unused;
    }

    /// The index and fault of the first module task in Error, if any
    pub fn first_fault(&self) -> Option<(u8, TaskFault)> {
        self.tasks.iter().find_map(|(index, task)| {
            if task.state == TaskState::Error {
                Some((*index, task.fault.unwrap_or(TaskFault::StartFailed)))
            } else {
                None
            }
        })
    }
}
