/*!
 * Agitation (shaker) device.
 *
 * Drives one stepper motor in continuous rotation. Agitation speed is
 * expressed in device units and mapped linearly to motor half-steps per
 * second.
 */
use std::time::Duration;

use tracing::warn;

use labrig_core::config::DeviceConfig;
use labrig_core::types::Id;
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::ModuleHandle;

use crate::devices::{MOTION_TIMEOUT, READ_TIMEOUT};
use crate::error::{DeviceError, Result};
use crate::runtime::{Activation, Device, DeviceLogic, Reporter, TaskOutcome};
use crate::task::{DeviceTask, ModuleTask, MotorSubtask, MotorTaskData, StartTrigger, TaskKind};

/// Error group for agitation faults
pub const AGITATION_ERROR_GROUP: u16 = 0x0011;

/// Operation key: homing run
pub const TASK_REFERENCE_RUN: &str = "reference-run";
/// Operation key: set the agitation speed
pub const TASK_SET_SPEED: &str = "set-speed";
/// Operation key: read back the actual agitation speed
pub const TASK_REQUEST_SPEED: &str = "request-speed";

/// Motor half-steps per second per agitation speed unit
pub const HALF_STEPS_PER_SPEED_UNIT: i16 = 20;

/// Motor speed for an agitation speed in device units
pub fn motor_speed_from_agitation_speed(speed: u8) -> i16 {
    i16::from(speed) * HALF_STEPS_PER_SPEED_UNIT
}

/// Agitation speed in device units for a motor speed (rounded down)
pub fn agitation_speed_from_motor_speed(motor_speed: i16) -> u8 {
    (motor_speed / HALF_STEPS_PER_SPEED_UNIT).unsigned_abs().min(u16::from(u8::MAX)) as u8
}

/// Agitation device logic
pub struct AgitationLogic {
    config: DeviceConfig,
    motor_key: Id,
    motor: Option<ModuleHandle>,
    profile: u8,
    act_speed: Option<u8>,
}

impl AgitationLogic {
    /// Create agitation logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let motor_key = config
            .modules
            .get("motor")
            .cloned()
            .unwrap_or_else(|| "agitation.motor".to_string())
            .into();
        let profile = config.profile("agitation").unwrap_or(0);
        Self {
            config,
            motor_key,
            motor: None,
            profile,
            act_speed: None,
        }
    }

    fn motor_task(
        &self,
        subtask: MotorSubtask,
        trigger: StartTrigger,
        timeout: Duration,
    ) -> Result<ModuleTask> {
        let motor = self
            .motor
            .ok_or_else(|| DeviceError::null_handle("agitation motor unresolved"))?;
        Ok(ModuleTask::new(
            TaskKind::Motor(MotorTaskData {
                subtask,
                profile: self.profile,
                act_position: None,
                act_speed: None,
            }),
            trigger,
            timeout,
        )
        .bind(motor))
    }
}

fn last_motor_speed(task: &DeviceTask) -> Option<i16> {
    task.tasks.values().rev().find_map(|module_task| {
        if let TaskKind::Motor(data) = &module_task.kind {
            data.act_speed
        } else {
            None
        }
    })
}

impl DeviceLogic for AgitationLogic {
    fn device_type(&self) -> &'static str {
        "agitation"
    }

    fn error_group(&self) -> u16 {
        AGITATION_ERROR_GROUP
    }

    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()> {
        self.motor = registry.lookup(&self.motor_key);
        self.motor.map(|_| ()).ok_or_else(|| {
            DeviceError::config(format!("Module {} not registered", self.motor_key))
        })
    }

    fn module_handles(&self) -> Vec<ModuleHandle> {
        self.motor.into_iter().collect()
    }

    fn build_tasks(&self) -> Result<Vec<DeviceTask>> {
        Ok(vec![
            DeviceTask::new(TASK_REFERENCE_RUN)
                .with_task(
                    0,
                    self.motor_task(
                        MotorSubtask::SetState { enabled: true },
                        StartTrigger::First,
                        self.config.timeout("motor_state", READ_TIMEOUT),
                    )?,
                )
                .with_task(
                    1,
                    self.motor_task(
                        MotorSubtask::ReferenceRun,
                        StartTrigger::AfterSibling(0),
                        self.config.timeout("reference_run", MOTION_TIMEOUT),
                    )?,
                ),
            DeviceTask::new(TASK_SET_SPEED).with_task(
                0,
                self.motor_task(
                    // Speed is filled in per request
                    MotorSubtask::MoveAtSpeed { speed: 0 },
                    StartTrigger::First,
                    self.config.timeout("set_speed", MOTION_TIMEOUT),
                )?,
            ),
            DeviceTask::new(TASK_REQUEST_SPEED).with_task(
                0,
                self.motor_task(
                    MotorSubtask::RequestSpeed,
                    StartTrigger::First,
                    self.config.timeout("request_speed", READ_TIMEOUT),
                )?,
            ),
        ])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_REFERENCE_RUN => {
                if success {
                    self.act_speed = Some(0);
                }
                reporter.operation_finished(&task.key, success, serde_json::json!(null));
            }
            TASK_SET_SPEED | TASK_REQUEST_SPEED => {
                if success {
                    if let Some(motor_speed) = last_motor_speed(task) {
                        self.act_speed = Some(agitation_speed_from_motor_speed(motor_speed));
                    }
                }
                reporter.operation_finished(&task.key, success, serde_json::json!(self.act_speed));
            }
            other => warn!("Agitation resolved unknown task {}", other),
        }
    }

    fn clear_on_reset(&mut self) {
        self.motor = None;
        self.act_speed = None;
    }
}

/// An agitation device instance
pub type Agitation = Device<AgitationLogic>;

impl Device<AgitationLogic> {
    /// Request a reference run
    pub fn reference_run(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REFERENCE_RUN), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Request a new agitation speed in device units
    pub fn set_speed(&self, speed: u8) -> Result<()> {
        self.submit(&Id::from(TASK_SET_SPEED), |_logic, task| {
            let motor_speed = motor_speed_from_agitation_speed(speed);
            if let Some(module_task) = task.tasks.get_mut(&0) {
                if let TaskKind::Motor(data) = &mut module_task.kind {
                    data.subtask = MotorSubtask::MoveAtSpeed { speed: motor_speed };
                }
            }
            Ok(Activation::All)
        })
    }

    /// Request a read-back of the actual agitation speed
    pub fn request_speed(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_SPEED), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Last known agitation speed in device units
    pub fn speed(&self) -> Option<u8> {
        self.with_logic(|logic| logic.act_speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_mapping_round_trip() {
        for speed in [0u8, 1, 10, 25] {
            let motor_speed = motor_speed_from_agitation_speed(speed);
            assert_eq!(agitation_speed_from_motor_speed(motor_speed), speed);
        }
    }

    #[test]
    fn test_speed_mapping_saturates() {
        assert_eq!(agitation_speed_from_motor_speed(i16::MAX), u8::MAX);
    }

    #[test]
    fn test_task_table_shape() {
        let mut logic = AgitationLogic::new(DeviceConfig::default());
        logic.motor = Some(ModuleHandle::new(1));

        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks
            .iter()
            .any(|task| task.key.as_str() == TASK_SET_SPEED));
    }
}
