/*!
 * Loader (drawer) device.
 *
 * Drives one stepper motor and one RFID reader. The drawer moves between two
 * configured endpoint positions; motor positions are classified back into a
 * discrete [`LoaderPosition`] within a fixed deviation tolerance.
 */
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use labrig_core::config::DeviceConfig;
use labrig_core::types::Id;
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::ModuleHandle;

use crate::devices::{MOTION_TIMEOUT, READ_TIMEOUT};
use crate::error::{DeviceError, Result};
use crate::runtime::{Activation, Device, DeviceLogic, Reporter, TaskOutcome};
use crate::task::{
    DeviceTask, ModuleTask, MotorSubtask, MotorTaskData, RfidSubtask, RfidTaskData, StartTrigger,
    TaskKind,
};

/// Error group for loader faults
pub const LOADER_ERROR_GROUP: u16 = 0x0010;

/// Operation key: homing run to the mechanical reference point
pub const TASK_REFERENCE_RUN: &str = "reference-run";
/// Operation key: move the drawer to a named position
pub const TASK_SET_DRAWER_POSITION: &str = "set-drawer-position";
/// Operation key: read back the actual drawer position
pub const TASK_REQUEST_DRAWER_POSITION: &str = "request-drawer-position";
/// Operation key: read the RFID user data block
pub const TASK_READ_RFID_DATA: &str = "read-rfid-data";
/// Operation key: read the RFID tag ID
pub const TASK_READ_RFID_TAG: &str = "read-rfid-tag";

const DEFAULT_CLOSED_POSITION: i32 = 100;
const DEFAULT_OPEN_POSITION: i32 = 2000;

/// Acceptable deviation around a drawer endpoint, in half-steps
pub const POSITION_TOLERANCE: i32 = 50;

/// Discrete drawer position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoaderPosition {
    /// Drawer closed (at the reference endpoint)
    Closed,
    /// Drawer fully open
    Open,
}

/// Classify a motor position against the configured drawer endpoints.
/// Positions outside both tolerance bands yield `None`.
pub fn drawer_position_from_motor_pos(
    motor_pos: i32,
    closed: i32,
    open: i32,
) -> Option<LoaderPosition> {
    if (motor_pos - closed).abs() <= POSITION_TOLERANCE {
        Some(LoaderPosition::Closed)
    } else if (motor_pos - open).abs() <= POSITION_TOLERANCE {
        Some(LoaderPosition::Open)
    } else {
        None
    }
}

/// The motor target for a named drawer position
pub fn motor_pos_from_drawer_position(position: LoaderPosition, closed: i32, open: i32) -> i32 {
    match position {
        LoaderPosition::Closed => closed,
        LoaderPosition::Open => open,
    }
}

/// Loader device logic: module handles, task wiring and cached actuals
pub struct LoaderLogic {
    config: DeviceConfig,
    motor_key: Id,
    rfid_key: Id,
    motor: Option<ModuleHandle>,
    rfid: Option<ModuleHandle>,
    closed_position: i32,
    open_position: i32,
    profile: u8,
    act_motor_position: Option<i32>,
    act_drawer_position: Option<LoaderPosition>,
    rfid_data: Option<u32>,
    rfid_tag: Option<u64>,
}

impl LoaderLogic {
    /// Create loader logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let motor_key = config
            .modules
            .get("motor")
            .cloned()
            .unwrap_or_else(|| "loader.motor".to_string())
            .into();
        let rfid_key = config
            .modules
            .get("rfid")
            .cloned()
            .unwrap_or_else(|| "loader.rfid".to_string())
            .into();
        let closed_position = config.position("drawer_closed").unwrap_or(DEFAULT_CLOSED_POSITION);
        let open_position = config.position("drawer_open").unwrap_or(DEFAULT_OPEN_POSITION);
        let profile = config.profile("drawer").unwrap_or(0);
        Self {
            config,
            motor_key,
            rfid_key,
            motor: None,
            rfid: None,
            closed_position,
            open_position,
            profile,
            act_motor_position: None,
            act_drawer_position: None,
            rfid_data: None,
            rfid_tag: None,
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
            .ok_or_else(|| DeviceError::null_handle("loader motor unresolved"))?;
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

    fn rfid_task(&self, subtask: RfidSubtask) -> Result<ModuleTask> {
        let rfid = self
            .rfid
            .ok_or_else(|| DeviceError::null_handle("loader RFID reader unresolved"))?;
        Ok(ModuleTask::new(
            TaskKind::Rfid(RfidTaskData {
                subtask,
                data: None,
                tag: None,
            }),
            StartTrigger::First,
            self.config.timeout("rfid", READ_TIMEOUT),
        )
        .bind(rfid))
    }
}

/// The last motor position written back into a resolved device task
fn last_motor_position(task: &DeviceTask) -> Option<i32> {
    task.tasks.values().rev().find_map(|module_task| {
        if let TaskKind::Motor(data) = &module_task.kind {
            data.act_position
        } else {
            None
        }
    })
}

impl DeviceLogic for LoaderLogic {
    fn device_type(&self) -> &'static str {
        "loader"
    }

    fn error_group(&self) -> u16 {
        LOADER_ERROR_GROUP
    }

    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()> {
        self.motor = registry.lookup(&self.motor_key);
        self.rfid = registry.lookup(&self.rfid_key);
        if self.motor.is_none() {
            return Err(DeviceError::config(format!(
                "Module {} not registered",
                self.motor_key
            )));
        }
        if self.rfid.is_none() {
            return Err(DeviceError::config(format!(
                "Module {} not registered",
                self.rfid_key
            )));
        }
        Ok(())
    }

    fn module_handles(&self) -> Vec<ModuleHandle> {
        self.motor.into_iter().chain(self.rfid).collect()
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
            DeviceTask::new(TASK_SET_DRAWER_POSITION).with_task(
                0,
                self.motor_task(
                    // Target is filled in per request
                    MotorSubtask::MoveToPosition { target: 0 },
                    StartTrigger::First,
                    self.config.timeout("move", MOTION_TIMEOUT),
                )?,
            ),
            DeviceTask::new(TASK_REQUEST_DRAWER_POSITION).with_task(
                0,
                self.motor_task(
                    MotorSubtask::RequestPosition,
                    StartTrigger::First,
                    self.config.timeout("request_position", READ_TIMEOUT),
                )?,
            ),
            DeviceTask::new(TASK_READ_RFID_DATA)
                .with_task(0, self.rfid_task(RfidSubtask::RequestData)?),
            DeviceTask::new(TASK_READ_RFID_TAG)
                .with_task(0, self.rfid_task(RfidSubtask::RequestTag)?),
        ])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_REFERENCE_RUN | TASK_SET_DRAWER_POSITION | TASK_REQUEST_DRAWER_POSITION => {
                if success {
                    if let Some(position) = last_motor_position(task) {
                        self.act_motor_position = Some(position);
                        self.act_drawer_position = drawer_position_from_motor_pos(
                            position,
                            self.closed_position,
                            self.open_position,
                        );
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!({
                        "motor_position": self.act_motor_position,
                        "drawer_position": self.act_drawer_position,
                    }),
                );
            }
            TASK_READ_RFID_DATA => {
                if success {
                    if let Some(TaskKind::Rfid(data)) = task.tasks.get(&0).map(|t| &t.kind) {
                        self.rfid_data = data.data;
                    }
                }
                reporter.operation_finished(&task.key, success, serde_json::json!(self.rfid_data));
            }
            TASK_READ_RFID_TAG => {
                if success {
                    if let Some(TaskKind::Rfid(data)) = task.tasks.get(&0).map(|t| &t.kind) {
                        self.rfid_tag = data.tag;
                    }
                }
                reporter.operation_finished(&task.key, success, serde_json::json!(self.rfid_tag));
            }
            other => warn!("Loader resolved unknown task {}", other),
        }
    }

    fn clear_on_reset(&mut self) {
        self.motor = None;
        self.rfid = None;
        self.act_motor_position = None;
        self.act_drawer_position = None;
        self.rfid_data = None;
        self.rfid_tag = None;
    }
}

/// A loader device instance
pub type Loader = Device<LoaderLogic>;

impl Device<LoaderLogic> {
    /// Request a reference run: enable the driver stage, then home
    pub fn reference_run(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REFERENCE_RUN), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Request a drawer move to a named position
    pub fn set_drawer_position(&self, position: LoaderPosition) -> Result<()> {
        self.submit(&Id::from(TASK_SET_DRAWER_POSITION), |logic, task| {
            let target =
                motor_pos_from_drawer_position(position, logic.closed_position, logic.open_position);
            if let Some(module_task) = task.tasks.get_mut(&0) {
                if let TaskKind::Motor(data) = &mut module_task.kind {
                    data.subtask = MotorSubtask::MoveToPosition { target };
                }
            }
            Ok(Activation::All)
        })
    }

    /// Request a read-back of the actual drawer position
    pub fn request_drawer_position(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_DRAWER_POSITION), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Request the RFID user data block
    pub fn read_rfid_data(&self) -> Result<()> {
        self.submit(&Id::from(TASK_READ_RFID_DATA), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Request the RFID tag ID
    pub fn read_rfid_tag(&self) -> Result<()> {
        self.submit(&Id::from(TASK_READ_RFID_TAG), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Last known drawer position classification
    pub fn drawer_position(&self) -> Option<LoaderPosition> {
        self.with_logic(|logic| logic.act_drawer_position)
    }

    /// Last known raw motor position in half-steps
    pub fn motor_position(&self) -> Option<i32> {
        self.with_logic(|logic| logic.act_motor_position)
    }

    /// Last RFID user data block read
    pub fn rfid_data(&self) -> Option<u32> {
        self.with_logic(|logic| logic.rfid_data)
    }

    /// Last RFID tag ID read
    pub fn rfid_tag(&self) -> Option<u64> {
        self.with_logic(|logic| logic.rfid_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use labrig_modules::{
        AckKind, AckPayload, ModuleAck, ModuleBus, ModuleClass, ModuleCommand, ModuleRegistry,
        MotorCommand, SimBus,
    };

    use crate::events::FaultLog;
    use crate::runtime::{ErrorMachineState, MainState, RequestSlot};

    struct Rig {
        loader: Loader,
        registry: Arc<ModuleRegistry>,
        bus: Arc<SimBus>,
        motor: ModuleHandle,
        rfid: ModuleHandle,
    }

    fn rig() -> Rig {
        let registry = Arc::new(ModuleRegistry::new());
        let motor = registry.register_module("loader.motor", ModuleClass::Motor);
        let rfid = registry.register_module("loader.rfid", ModuleClass::Rfid);
        let bus = Arc::new(SimBus::new());
        let loader = Device::new(
            "loader-1",
            LoaderLogic::new(DeviceConfig::default()),
            Arc::clone(&registry),
            bus.clone() as Arc<dyn ModuleBus>,
            Arc::new(FaultLog::new()),
        );
        Rig {
            loader,
            registry,
            bus,
            motor,
            rfid,
        }
    }

    fn bring_to_idle(loader: &Loader, now: Instant) {
        for _ in 0..3 {
            loader.tick(now);
        }
        assert_eq!(loader.main_state(), MainState::Idle);
        assert_eq!(loader.request(), RequestSlot::Free);
    }

    #[test_log::test]
    fn test_reference_run_end_to_end() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.loader, now);

        r.loader.reference_run().unwrap();
        assert_eq!(
            r.loader.request(),
            RequestSlot::Active(Id::from(TASK_REFERENCE_RUN))
        );

        // First tick starts only the enable task
        r.loader.tick(now);
        assert_eq!(
            r.bus.issued_to(r.motor),
            vec![ModuleCommand::Motor(MotorCommand::SetState { enabled: true })]
        );

        // Enable completes; next tick starts the homing run
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.motor,
            AckKind::MotorState,
            AckPayload::None,
        ));
        r.loader.tick(now);
        assert_eq!(
            r.bus.issued_to(r.motor),
            vec![
                ModuleCommand::Motor(MotorCommand::SetState { enabled: true }),
                ModuleCommand::Motor(MotorCommand::ReferenceRun { profile: 0 }),
            ]
        );

        // Homing ends at the closed endpoint
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.motor,
            AckKind::MotorReferenceRun,
            AckPayload::MotorPosition(100),
        ));
        r.loader.tick(now);

        assert_eq!(r.loader.request(), RequestSlot::Free);
        assert_eq!(r.loader.motor_position(), Some(100));
        assert_eq!(r.loader.drawer_position(), Some(LoaderPosition::Closed));
    }

    #[test]
    fn test_second_request_is_rejected_while_in_flight() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.loader, now);

        r.loader.reference_run().unwrap();
        assert!(matches!(
            r.loader.read_rfid_data(),
            Err(DeviceError::InvalidState(_))
        ));
        assert_eq!(
            r.loader.request(),
            RequestSlot::Active(Id::from(TASK_REFERENCE_RUN))
        );
    }

    #[test]
    fn test_homing_timeout_blocks_the_device() {
        let r = rig();
        let start = Instant::now();
        bring_to_idle(&r.loader, start);

        r.loader.reference_run().unwrap();
        r.loader.tick(start);
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.motor,
            AckKind::MotorState,
            AckPayload::None,
        ));
        r.loader.tick(start);

        // Homing run never answers
        let late = start + MOTION_TIMEOUT + Duration::from_millis(1);
        r.loader.tick(late);
        assert_eq!(r.loader.main_state(), MainState::Error);

        r.loader.tick(late);
        r.loader.tick(late);
        r.loader.tick(late);
        assert_eq!(r.loader.error_state(), ErrorMachineState::Idle);
        assert!(matches!(
            r.loader.reference_run(),
            Err(DeviceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rfid_read_updates_cache() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.loader, now);

        r.loader.read_rfid_tag().unwrap();
        r.loader.tick(now);
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.rfid,
            AckKind::RfidTag,
            AckPayload::RfidTag(0xdead_beef_0042),
        ));
        r.loader.tick(now);

        assert_eq!(r.loader.rfid_tag(), Some(0xdead_beef_0042));
        assert_eq!(r.loader.request(), RequestSlot::Free);
    }

    #[test]
    fn test_position_mapping_round_trip() {
        let closed = DEFAULT_CLOSED_POSITION;
        let open = DEFAULT_OPEN_POSITION;

        for position in [LoaderPosition::Closed, LoaderPosition::Open] {
            let motor_pos = motor_pos_from_drawer_position(position, closed, open);
            assert_eq!(
                drawer_position_from_motor_pos(motor_pos, closed, open),
                Some(position)
            );
        }
    }

    #[test]
    fn test_position_classification_tolerance() {
        let closed = 100;
        let open = 2000;

        assert_eq!(
            drawer_position_from_motor_pos(100 + POSITION_TOLERANCE, closed, open),
            Some(LoaderPosition::Closed)
        );
        assert_eq!(
            drawer_position_from_motor_pos(100 + POSITION_TOLERANCE + 1, closed, open),
            None
        );
        assert_eq!(
            drawer_position_from_motor_pos(2000 - POSITION_TOLERANCE, closed, open),
            Some(LoaderPosition::Open)
        );
        assert_eq!(drawer_position_from_motor_pos(1000, closed, open), None);
    }

    #[test]
    fn test_task_table_shape() {
        let mut logic = LoaderLogic::new(DeviceConfig::default());
        logic.motor = Some(ModuleHandle::new(1));
        logic.rfid = Some(ModuleHandle::new(2));

        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 5);

        let reference_run = tasks
            .iter()
            .find(|task| task.key.as_str() == TASK_REFERENCE_RUN)
            .unwrap();
        assert_eq!(reference_run.tasks.len(), 2);
        assert_eq!(reference_run.tasks[&0].trigger, StartTrigger::First);
        assert_eq!(
            reference_run.tasks[&1].trigger,
            StartTrigger::AfterSibling(0)
        );
    }

    #[test]
    fn test_build_tasks_requires_handles() {
        let logic = LoaderLogic::new(DeviceConfig::default());
        assert!(matches!(
            logic.build_tasks(),
            Err(DeviceError::NullHandle(_))
        ));
    }
}
