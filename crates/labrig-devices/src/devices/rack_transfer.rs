/*!
 * Rack-transfer device.
 *
 * Drives one stepper motor moving racks between named stations. Station
 * positions come from the device configuration table and are addressed by
 * name at request time.
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

/// Error group for rack-transfer faults
pub const RACK_TRANSFER_ERROR_GROUP: u16 = 0x0012;

/// Operation key: homing run
pub const TASK_REFERENCE_RUN: &str = "reference-run";
/// Operation key: move to a named station position
pub const TASK_SET_TRANSFER_POSITION: &str = "set-transfer-position";
/// Operation key: read back the actual transfer position
pub const TASK_REQUEST_TRANSFER_POSITION: &str = "request-transfer-position";

/// Rack-transfer device logic
pub struct RackTransferLogic {
    config: DeviceConfig,
    motor_key: Id,
    motor: Option<ModuleHandle>,
    profile: u8,
    act_position: Option<i32>,
}

impl RackTransferLogic {
    /// Create rack-transfer logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let motor_key = config
            .modules
            .get("motor")
            .cloned()
            .unwrap_or_else(|| "rack_transfer.motor".to_string())
            .into();
        let profile = config.profile("transfer").unwrap_or(0);
        Self {
            config,
            motor_key,
            motor: None,
            profile,
            act_position: None,
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
            .ok_or_else(|| DeviceError::null_handle("rack-transfer motor unresolved"))?;
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

fn last_motor_position(task: &DeviceTask) -> Option<i32> {
    task.tasks.values().rev().find_map(|module_task| {
        if let TaskKind::Motor(data) = &module_task.kind {
            data.act_position
        } else {
            None
        }
    })
}

impl DeviceLogic for RackTransferLogic {
    fn device_type(&self) -> &'static str {
        "rack_transfer"
    }

    fn error_group(&self) -> u16 {
        RACK_TRANSFER_ERROR_GROUP
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
            DeviceTask::new(TASK_SET_TRANSFER_POSITION).with_task(
                0,
                self.motor_task(
                    // Target is filled in per request
                    MotorSubtask::MoveToPosition { target: 0 },
                    StartTrigger::First,
                    self.config.timeout("move", MOTION_TIMEOUT),
                )?,
            ),
            DeviceTask::new(TASK_REQUEST_TRANSFER_POSITION).with_task(
                0,
                self.motor_task(
                    MotorSubtask::RequestPosition,
                    StartTrigger::First,
                    self.config.timeout("request_position", READ_TIMEOUT),
                )?,
            ),
        ])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_REFERENCE_RUN | TASK_SET_TRANSFER_POSITION | TASK_REQUEST_TRANSFER_POSITION => {
                if success {
                    if let Some(position) = last_motor_position(task) {
                        self.act_position = Some(position);
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!(self.act_position),
                );
            }
            other => warn!("Rack transfer resolved unknown task {}", other),
        }
    }

    fn clear_on_reset(&mut self) {
        self.motor = None;
        self.act_position = None;
    }
}

/// A rack-transfer device instance
pub type RackTransfer = Device<RackTransferLogic>;

impl Device<RackTransferLogic> {
    /// Request a reference run
    pub fn reference_run(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REFERENCE_RUN), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Request a move to a named station position from the configuration
    pub fn set_transfer_position(&self, station: &str) -> Result<()> {
        self.submit(&Id::from(TASK_SET_TRANSFER_POSITION), |logic, task| {
            let target = logic.config.position(station)?;
            if let Some(module_task) = task.tasks.get_mut(&0) {
                if let TaskKind::Motor(data) = &mut module_task.kind {
                    data.subtask = MotorSubtask::MoveToPosition { target };
                }
            }
            Ok(Activation::All)
        })
    }

    /// Request a read-back of the actual transfer position
    pub fn request_transfer_position(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_TRANSFER_POSITION), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Last known transfer position in half-steps
    pub fn transfer_position(&self) -> Option<i32> {
        self.with_logic(|logic| logic.act_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_table_shape() {
        let mut logic = RackTransferLogic::new(DeviceConfig::default());
        logic.motor = Some(ModuleHandle::new(1));

        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 3);

        let reference_run = tasks
            .iter()
            .find(|task| task.key.as_str() == TASK_REFERENCE_RUN)
            .unwrap();
        assert_eq!(
            reference_run.tasks[&1].trigger,
            StartTrigger::AfterSibling(0)
        );
    }

    #[test]
    fn test_unresolved_motor_is_rejected() {
        let logic = RackTransferLogic::new(DeviceConfig::default());
        assert!(logic.build_tasks().is_err());
    }
}
