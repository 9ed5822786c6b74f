/*!
 * Generic per-device engine.
 *
 * [`Device`] composes the main life-cycle state machine, the error
 * sub-machine and the device-task dispatcher, parameterized over a
 * [`DeviceLogic`] implemented by each concrete device type. A host scheduler
 * calls [`Device::tick`] periodically; module completion and fault
 * notifications arrive asynchronously through callbacks registered with the
 * module registry during the Config state. One coarse mutex per device
 * serializes ticks against those callbacks.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use labrig_core::logging::{device_span, operation_span};
use labrig_core::types::{ErrorRecord, Id};
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::{ModuleAck, ModuleBus, ModuleHandle};

use crate::error::{DeviceError, Result};
use crate::events::{DeviceEvent, SharedFaultLog};
use crate::task::{DeviceTask, DeviceTaskState, TaskFault};
use crate::task_manager;

/// Fault code: module handle resolution or task table construction failed
pub const FAULT_CONFIG: u16 = 0x0001;
/// Fault code: the bus rejected a task start synchronously
pub const FAULT_START_FAILED: u16 = 0x0002;
/// Fault code: a module did not answer within its timeout budget
pub const FAULT_TIMEOUT: u16 = 0x0003;
/// Fault code: internal precondition violation (unknown request id)
pub const FAULT_INVALID_STATE: u16 = 0x0004;
/// Fault code: a module answered an operation with a failure code
pub const FAULT_MODULE_FAILURE: u16 = 0x0005;

/// Main life-cycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MainState {
    /// Created, nothing resolved yet
    Start,
    /// Resolving module handles from the registry
    Init,
    /// Registering module callbacks and building the fixed device-task table
    Config,
    /// Ready; dispatching the pending request, if any
    Idle,
    /// Faulted; the error sub-machine is in charge
    Error,
}

/// State of the error sub-machine, nested under [`MainState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorMachineState {
    /// No error
    Free,
    /// Surface the fault to the external interface
    ReportIface,
    /// Forward the fault to the shared device-processing log
    ReportDevProc,
    /// Hold; blocks new requests until an explicit clear
    Idle,
    /// Clear handles and cached state, then re-enter main Start
    Reset,
}

/// The per-device request slot; acts as a mutex over external requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSlot {
    /// No request in flight
    Free,
    /// The named operation is in flight
    Active(Id),
    /// The device is faulted; requests are rejected
    Error,
}

/// How the active device task resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every module task finished successfully
    Success,
    /// A module task failed; carries the first failing index and its fault
    Failed {
        /// Index of the first module task in Error
        task_index: u8,
        /// Why it failed
        fault: TaskFault,
    },
}

/// Which module tasks a request activates
#[derive(Debug, Clone)]
pub enum Activation {
    /// Every module task of the device task
    All,
    /// Only the listed indexes; the rest are parked as Finished
    Subset(Vec<u8>),
}

/// Upward reporting handle passed to [`DeviceLogic`] hooks
pub struct Reporter<'a> {
    instance: &'a Id,
    sender: &'a broadcast::Sender<DeviceEvent>,
}

impl<'a> Reporter<'a> {
    /// The reporting device instance
    pub fn instance(&self) -> &Id {
        self.instance
    }

    /// Publish a consolidated operation result
    pub fn operation_finished(&self, operation: &Id, success: bool, value: serde_json::Value) {
        let _ = self.sender.send(DeviceEvent::OperationFinished {
            instance: self.instance.clone(),
            operation: operation.clone(),
            success,
            value,
        });
    }

    /// Publish an unsolicited observation
    pub fn value_changed(&self, property: &str, value: serde_json::Value) {
        let _ = self.sender.send(DeviceEvent::ValueChanged {
            instance: self.instance.clone(),
            property: property.to_string(),
            value,
        });
    }
}

/// The contract each concrete device type implements.
///
/// The logic owns the resolved module handles, the cached actual values and
/// the device-specific task wiring; the surrounding [`Device`] owns the state
/// machines and drives the logic through these hooks.
pub trait DeviceLogic: Send + 'static {
    /// Device type name, used in logs
    fn device_type(&self) -> &'static str;

    /// Error group for fault records reported by this device
    fn error_group(&self) -> u16;

    /// Resolve every required module handle by symbolic key (Init state)
    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()>;

    /// The resolved handles, used for callback wiring and reset
    fn module_handles(&self) -> Vec<ModuleHandle>;

    /// Build the fixed device-task table (Config state)
    fn build_tasks(&self) -> Result<Vec<DeviceTask>>;

    /// Consolidate a resolved device task: update cached actuals and publish
    /// the operation result. `task` still carries the write-back payloads;
    /// it is reset right after this hook returns.
    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>);

    /// Handle a completion that matched no in-progress task (unsolicited
    /// module notification, e.g. an input level change)
    fn unsolicited_ack(&mut self, _ack: &ModuleAck, _reporter: &Reporter<'_>) {}

    /// Drop resolved handles and cached actuals (error-machine Reset)
    fn clear_on_reset(&mut self);
}

/// Mutable per-device state behind the device mutex
pub(crate) struct DeviceCore<L: DeviceLogic> {
    instance: Id,
    main_state: MainState,
    error_state: ErrorMachineState,
    last_error: Option<ErrorRecord>,
    pending_faults: VecDeque<ErrorRecord>,
    request: RequestSlot,
    tasks: HashMap<Id, DeviceTask>,
    pub(crate) logic: L,
}

impl<L: DeviceLogic> DeviceCore<L> {
    fn set_main_state(&mut self, new_state: MainState, events: &broadcast::Sender<DeviceEvent>) {
        let old_state = self.main_state;
        if old_state == new_state {
            return;
        }
        self.main_state = new_state;
        info!(
            "Device {} ({}) main state {:?} -> {:?}",
            self.instance,
            self.logic.device_type(),
            old_state,
            new_state
        );
        let _ = events.send(DeviceEvent::StateChanged {
            instance: self.instance.clone(),
            old_state,
            new_state,
        });
    }

    fn enter_error(&mut self, record: ErrorRecord, events: &broadcast::Sender<DeviceEvent>) {
        warn!("Device {} entering error state: {}", self.instance, record);
        // A fault arriving while an earlier one is still mid-report must not
        // displace it; the error machine drains the queue after ReportDevProc.
        if self.main_state == MainState::Error
            && matches!(
                self.error_state,
                ErrorMachineState::ReportIface | ErrorMachineState::ReportDevProc
            )
        {
            self.pending_faults.push_back(record);
            return;
        }
        self.last_error = Some(record);
        self.request = RequestSlot::Error;
        self.error_state = ErrorMachineState::ReportIface;
        self.set_main_state(MainState::Error, events);
    }
}

/// A device instance: the generic engine plus its concrete logic
pub struct Device<L: DeviceLogic> {
    core: Arc<Mutex<DeviceCore<L>>>,
    registry: Arc<ModuleRegistry>,
    bus: Arc<dyn ModuleBus>,
    fault_log: SharedFaultLog,
    events: broadcast::Sender<DeviceEvent>,
}

impl<L: DeviceLogic> Clone for Device<L> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            fault_log: Arc::clone(&self.fault_log),
            events: self.events.clone(),
        }
    }
}

impl<L: DeviceLogic> std::fmt::Debug for Device<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.lock_core();
        f.debug_struct("Device")
            .field("instance", &core.instance)
            .field("type", &core.logic.device_type())
            .field("main_state", &core.main_state)
            .field("request", &core.request)
            .finish()
    }
}

impl<L: DeviceLogic> Device<L> {
    /// Create a new device in the Start state
    pub fn new<I: Into<Id>>(
        instance: I,
        logic: L,
        registry: Arc<ModuleRegistry>,
        bus: Arc<dyn ModuleBus>,
        fault_log: SharedFaultLog,
    ) -> Self {
        let (events, _) = crate::events::device_event_channel();
        Self {
            core: Arc::new(Mutex::new(DeviceCore {
                instance: instance.into(),
                main_state: MainState::Start,
                error_state: ErrorMachineState::Free,
                last_error: None,
                pending_faults: VecDeque::new(),
                request: RequestSlot::Free,
                tasks: HashMap::new(),
                logic,
            })),
            registry,
            bus,
            fault_log,
            events,
        }
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, DeviceCore<L>> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The device instance ID
    pub fn instance(&self) -> Id {
        self.lock_core().instance.clone()
    }

    /// The current main life-cycle state
    pub fn main_state(&self) -> MainState {
        self.lock_core().main_state
    }

    /// The current error sub-machine state
    pub fn error_state(&self) -> ErrorMachineState {
        self.lock_core().error_state
    }

    /// The current request slot
    pub fn request(&self) -> RequestSlot {
        self.lock_core().request.clone()
    }

    /// The most recent fault, if the device has faulted
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.lock_core().last_error.clone()
    }

    /// Subscribe to this device's events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Read a cached value through the concrete logic
    pub(crate) fn with_logic<R>(&self, f: impl FnOnce(&L) -> R) -> R {
        f(&self.lock_core().logic)
    }

    /// Drive the device by one cooperative step
    pub fn tick(&self, now: Instant) {
        let mut core = self.lock_core();
        let _span = device_span(core.logic.device_type(), core.instance.as_str()).entered();
        match core.main_state {
            MainState::Start => {
                core.set_main_state(MainState::Init, &self.events);
            }
            MainState::Init => match core.logic.resolve_modules(self.registry.as_ref()) {
                Ok(()) => core.set_main_state(MainState::Config, &self.events),
                Err(e) => {
                    error!("Device {} module resolution failed: {}", core.instance, e);
                    let record = ErrorRecord::new(core.logic.error_group(), FAULT_CONFIG, 0);
                    core.enter_error(record, &self.events);
                }
            },
            MainState::Config => {
                for handle in core.logic.module_handles() {
                    self.register_callbacks(handle);
                }
                match core.logic.build_tasks() {
                    Ok(tasks) => {
                        core.tasks = tasks
                            .into_iter()
                            .map(|task| (task.key.clone(), task))
                            .collect();
                        core.request = RequestSlot::Free;
                        core.set_main_state(MainState::Idle, &self.events);
                    }
                    Err(e) => {
                        error!("Device {} task table build failed: {}", core.instance, e);
                        let record = ErrorRecord::new(core.logic.error_group(), FAULT_CONFIG, 0);
                        core.enter_error(record, &self.events);
                    }
                }
            }
            MainState::Idle => self.dispatch(&mut core, now),
            MainState::Error => self.step_error_machine(&mut core),
        }
    }

    /// Request an explicit error reset. Accepted only while the error
    /// sub-machine holds in Idle; the next tick performs the reset and
    /// restarts the main machine from Start.
    pub fn clear_error(&self) -> Result<()> {
        let mut core = self.lock_core();
        if core.main_state == MainState::Error && core.error_state == ErrorMachineState::Idle {
            info!("Device {} error reset requested", core.instance);
            core.error_state = ErrorMachineState::Reset;
            Ok(())
        } else {
            Err(DeviceError::invalid_state(format!(
                "Device {} has no clearable error (main {:?}, error {:?})",
                core.instance, core.main_state, core.error_state
            )))
        }
    }

    /// Claim the request slot and activate a device task.
    ///
    /// `prepare` fills the request parameters into the (still Unused) device
    /// task and decides which module tasks to activate. Rejected with
    /// `InvalidState` unless the device is Idle with a free request slot.
    pub(crate) fn submit<F>(&self, key: &Id, prepare: F) -> Result<()>
    where
        F: FnOnce(&mut L, &mut DeviceTask) -> Result<Activation>,
    {
        let mut core = self.lock_core();
        if core.main_state != MainState::Idle {
            return Err(DeviceError::invalid_state(format!(
                "Device {} is not idle ({:?})",
                core.instance, core.main_state
            )));
        }
        if core.request != RequestSlot::Free {
            return Err(DeviceError::invalid_state(format!(
                "Device {} already has a request in flight ({:?})",
                core.instance, core.request
            )));
        }

        let DeviceCore {
            tasks,
            logic,
            instance,
            ..
        } = &mut *core;
        let _span = operation_span(key.as_str(), logic.device_type()).entered();
        let task = tasks.get_mut(key).ok_or_else(|| {
            DeviceError::not_found(format!("Device {} has no operation {}", instance, key))
        })?;

        let activation = prepare(logic, task)?;
        match activation {
            Activation::All => task.activate()?,
            Activation::Subset(selected) => task.activate_subset(Some(&selected))?,
        }

        debug!("Device {} accepted request {}", core.instance, key);
        core.request = RequestSlot::Active(key.clone());
        Ok(())
    }

    fn register_callbacks(&self, handle: ModuleHandle) {
        let core = Arc::clone(&self.core);
        let events = self.events.clone();
        self.registry.on_completion(
            handle,
            Arc::new(move |ack| {
                let mut core = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                apply_completion(&mut core, ack, &events);
            }),
        );

        let core = Arc::clone(&self.core);
        let events = self.events.clone();
        self.registry.on_error(
            handle,
            Arc::new(move |module_error| {
                let mut core = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                warn!(
                    "Device {} received module fault from {}: {}",
                    core.instance, module_error.handle, module_error.record
                );
                let record = module_error.record.clone();
                core.enter_error(record, &events);
            }),
        );
    }

    fn dispatch(&self, core: &mut DeviceCore<L>, now: Instant) {
        let key = match &core.request {
            RequestSlot::Active(key) => key.clone(),
            RequestSlot::Free | RequestSlot::Error => return,
        };

        if !core.tasks.contains_key(&key) {
            // Should be unreachable: the request slot only ever holds keys
            // from the device's own task table.
            error!("Device {} has unknown active request {}", core.instance, key);
            let record = ErrorRecord::new(core.logic.error_group(), FAULT_INVALID_STATE, 0);
            core.enter_error(record, &self.events);
            return;
        }

        let DeviceCore {
            tasks,
            logic,
            instance,
            ..
        } = &mut *core;
        let task = match tasks.get_mut(&key) {
            Some(task) => task,
            None => return,
        };

        match task.state {
            DeviceTaskState::Start => task.state = DeviceTaskState::Progress,
            DeviceTaskState::Progress => {}
            other => {
                warn!(
                    "Device {} dispatching {} in unexpected state {:?}",
                    instance, key, other
                );
            }
        }

        task_manager::check_timeouts(task, now);

        loop {
            let scan = task_manager::startup_scan(task);
            let Some(index) = scan.next else { break };
            if let Some(module_task) = task.tasks.get_mut(&index) {
                task_manager::start_task(module_task, self.bus.as_ref(), now);
            }
        }

        let scan = task_manager::startup_scan(task);
        let outcome = if scan.any_errored {
            let (task_index, fault) = task
                .first_fault()
                .unwrap_or((0, TaskFault::StartFailed));
            task.state = DeviceTaskState::Error;
            Some(TaskOutcome::Failed { task_index, fault })
        } else if scan.all_finished() {
            task.state = DeviceTaskState::Finished;
            Some(TaskOutcome::Success)
        } else {
            None
        };

        let Some(outcome) = outcome else { return };

        let reporter = Reporter {
            instance,
            sender: &self.events,
        };
        logic.task_resolved(task, &outcome, &reporter);
        task_manager::reset_tasks(task);

        match outcome {
            TaskOutcome::Success => {
                debug!("Device {} finished request {}", core.instance, key);
                core.request = RequestSlot::Free;
            }
            TaskOutcome::Failed { task_index, fault } => {
                let (code, data) = match fault {
                    TaskFault::StartFailed => (FAULT_START_FAILED, u16::from(task_index)),
                    TaskFault::Timeout => (FAULT_TIMEOUT, u16::from(task_index)),
                    TaskFault::ModuleFailure(module_code) => (FAULT_MODULE_FAILURE, module_code),
                };
                let record = ErrorRecord::new(core.logic.error_group(), code, data);
                core.enter_error(record, &self.events);
            }
        }
    }

    fn step_error_machine(&self, core: &mut DeviceCore<L>) {
        match core.error_state {
            ErrorMachineState::Free => {
                warn!(
                    "Device {} in Error state with free error machine",
                    core.instance
                );
            }
            ErrorMachineState::ReportIface => {
                if let Some(record) = core.last_error.clone() {
                    let _ = self.events.send(DeviceEvent::Fault {
                        instance: core.instance.clone(),
                        record,
                    });
                }
                core.error_state = ErrorMachineState::ReportDevProc;
            }
            ErrorMachineState::ReportDevProc => {
                if let Some(record) = core.last_error.clone() {
                    self.fault_log.report(&core.instance, &record);
                }
                // Faults queued while this one was being reported take the
                // machine through another ReportIface/ReportDevProc pass.
                core.error_state = match core.pending_faults.pop_front() {
                    Some(next) => {
                        core.last_error = Some(next);
                        ErrorMachineState::ReportIface
                    }
                    None => ErrorMachineState::Idle,
                };
            }
            ErrorMachineState::Idle => {}
            ErrorMachineState::Reset => {
                info!("Device {} resetting after error", core.instance);
                for handle in core.logic.module_handles() {
                    self.registry.clear_callbacks(handle);
                }
                core.logic.clear_on_reset();
                core.tasks.clear();
                core.request = RequestSlot::Free;
                core.last_error = None;
                core.pending_faults.clear();
                core.error_state = ErrorMachineState::Free;
                core.set_main_state(MainState::Start, &self.events);
            }
        }
    }
}

/// Apply a completion notification to the device.
///
/// Locates the in-progress module task matching the notification's handle
/// and sub-operation kind (several tasks may share one module instance) and
/// applies the result; notifications matching no task are handed to the
/// logic as unsolicited.
fn apply_completion<L: DeviceLogic>(
    core: &mut DeviceCore<L>,
    ack: &ModuleAck,
    events: &broadcast::Sender<DeviceEvent>,
) {
    if let RequestSlot::Active(key) = core.request.clone() {
        if let Some(task) = core.tasks.get_mut(&key) {
            let mut cursor = None;
            while let Some(index) = task_manager::next_task_for_module(task, ack.handle, cursor) {
                cursor = Some(index);
                if let Some(module_task) = task.tasks.get_mut(&index) {
                    if module_task.matches_ack(ack) {
                        debug!(
                            "Device {} applying {:?} completion to {}[{}]",
                            core.instance, ack.kind, key, index
                        );
                        module_task.apply_ack(ack);
                        return;
                    }
                }
            }
        }
    }

    let reporter = Reporter {
        instance: &core.instance,
        sender: events,
    };
    core.logic.unsolicited_ack(ack, &reporter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use labrig_modules::{
        AckKind, AckPayload, ModuleClass, ModuleError, MotorCommand, SimBus,
    };

    use crate::events::FaultLog;
    use crate::task::{ModuleTask, MotorSubtask, MotorTaskData, StartTrigger, TaskKind};

    const TEST_GROUP: u16 = 0x00ff;

    /// Minimal single-motor logic used to exercise the generic engine
    struct TestLogic {
        motor_key: Id,
        motor: Option<ModuleHandle>,
        act_position: Option<i32>,
    }

    impl TestLogic {
        fn new() -> Self {
            Self {
                motor_key: "test.motor".into(),
                motor: None,
                act_position: None,
            }
        }
    }

    impl DeviceLogic for TestLogic {
        fn device_type(&self) -> &'static str {
            "test"
        }

        fn error_group(&self) -> u16 {
            TEST_GROUP
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
            let motor = self
                .motor
                .ok_or_else(|| DeviceError::null_handle("motor unresolved"))?;
            Ok(vec![DeviceTask::new("request-position").with_task(
                0,
                ModuleTask::new(
                    TaskKind::Motor(MotorTaskData {
                        subtask: MotorSubtask::RequestPosition,
                        profile: 0,
                        act_position: None,
                        act_speed: None,
                    }),
                    StartTrigger::First,
                    Duration::from_millis(500),
                )
                .bind(motor),
            )])
        }

        fn task_resolved(
            &mut self,
            task: &DeviceTask,
            outcome: &TaskOutcome,
            reporter: &Reporter<'_>,
        ) {
            if let TaskOutcome::Success = outcome {
                if let Some(ModuleTask {
                    kind: TaskKind::Motor(data),
                    ..
                }) = task.tasks.get(&0)
                {
                    self.act_position = data.act_position;
                }
            }
            reporter.operation_finished(
                &task.key,
                matches!(outcome, TaskOutcome::Success),
                serde_json::json!(self.act_position),
            );
        }

        fn clear_on_reset(&mut self) {
            self.motor = None;
            self.act_position = None;
        }
    }

    struct Fixture {
        device: Device<TestLogic>,
        registry: Arc<ModuleRegistry>,
        bus: Arc<SimBus>,
        fault_log: SharedFaultLog,
        motor: ModuleHandle,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ModuleRegistry::new());
        let motor = registry.register_module("test.motor", ModuleClass::Motor);
        let bus = Arc::new(SimBus::new());
        let fault_log: SharedFaultLog = Arc::new(FaultLog::new());
        let device = Device::new(
            "test-1",
            TestLogic::new(),
            Arc::clone(&registry),
            bus.clone() as Arc<dyn ModuleBus>,
            Arc::clone(&fault_log),
        );
        Fixture {
            device,
            registry,
            bus,
            fault_log,
            motor,
        }
    }

    fn bring_to_idle(device: &Device<TestLogic>, now: Instant) {
        for _ in 0..3 {
            device.tick(now);
        }
        assert_eq!(device.main_state(), MainState::Idle);
        assert_eq!(device.request(), RequestSlot::Free);
    }

    #[test]
    fn test_lifecycle_reaches_idle_in_three_ticks() {
        let f = fixture();
        let now = Instant::now();

        assert_eq!(f.device.main_state(), MainState::Start);
        f.device.tick(now);
        assert_eq!(f.device.main_state(), MainState::Init);
        f.device.tick(now);
        assert_eq!(f.device.main_state(), MainState::Config);
        f.device.tick(now);
        assert_eq!(f.device.main_state(), MainState::Idle);
        assert_eq!(f.device.request(), RequestSlot::Free);
    }

    #[test]
    fn test_missing_module_faults_the_device() {
        let registry = Arc::new(ModuleRegistry::new());
        let bus = Arc::new(SimBus::new());
        let fault_log: SharedFaultLog = Arc::new(FaultLog::new());
        let device = Device::new(
            "test-1",
            TestLogic::new(),
            registry,
            bus as Arc<dyn ModuleBus>,
            Arc::clone(&fault_log),
        );

        let now = Instant::now();
        device.tick(now); // Start -> Init
        device.tick(now); // Init fails
        assert_eq!(device.main_state(), MainState::Error);
        assert_eq!(device.error_state(), ErrorMachineState::ReportIface);

        device.tick(now);
        device.tick(now);
        assert_eq!(device.error_state(), ErrorMachineState::Idle);
        assert_eq!(fault_log.count(), 1);
        assert_eq!(fault_log.entries()[0].record.code, FAULT_CONFIG);
    }

    #[test]
    fn test_request_round_trip() {
        let f = fixture();
        let now = Instant::now();
        bring_to_idle(&f.device, now);

        let key: Id = "request-position".into();
        f.device
            .submit(&key, |_logic, _task| Ok(Activation::All))
            .unwrap();
        assert_eq!(f.device.request(), RequestSlot::Active(key.clone()));

        // Second request while one is in flight is rejected
        let err = f.device.submit(&key, |_logic, _task| Ok(Activation::All));
        assert!(matches!(err, Err(DeviceError::InvalidState(_))));

        f.device.tick(now);
        assert_eq!(
            f.bus.issued_to(f.motor),
            vec![labrig_modules::ModuleCommand::Motor(MotorCommand::RequestPosition)]
        );

        f.registry.dispatch_completion(&ModuleAck::ok(
            f.motor,
            AckKind::MotorActPosition,
            AckPayload::MotorPosition(321),
        ));
        f.device.tick(now);

        assert_eq!(f.device.request(), RequestSlot::Free);
        assert_eq!(f.device.with_logic(|logic| logic.act_position), Some(321));
    }

    #[test]
    fn test_timeout_routes_through_error_machine() {
        let f = fixture();
        let start = Instant::now();
        bring_to_idle(&f.device, start);

        let key: Id = "request-position".into();
        f.device
            .submit(&key, |_logic, _task| Ok(Activation::All))
            .unwrap();
        f.device.tick(start);

        // No answer within the budget
        let late = start + Duration::from_millis(501);
        f.device.tick(late);
        assert_eq!(f.device.main_state(), MainState::Error);
        assert_eq!(f.device.request(), RequestSlot::Error);
        let record = f.device.last_error().unwrap();
        assert_eq!(record.code, FAULT_TIMEOUT);
        assert_eq!(record.group, TEST_GROUP);

        // Requests are rejected while faulted
        let err = f.device.submit(&key, |_logic, _task| Ok(Activation::All));
        assert!(matches!(err, Err(DeviceError::InvalidState(_))));

        // ReportIface -> ReportDevProc -> Idle within three ticks
        f.device.tick(late);
        f.device.tick(late);
        f.device.tick(late);
        assert_eq!(f.device.error_state(), ErrorMachineState::Idle);
        assert_eq!(f.fault_log.count(), 1);
    }

    #[test]
    fn test_clear_error_resets_to_start() {
        let f = fixture();
        let start = Instant::now();
        bring_to_idle(&f.device, start);

        let key: Id = "request-position".into();
        f.device
            .submit(&key, |_logic, _task| Ok(Activation::All))
            .unwrap();
        f.device.tick(start);
        let late = start + Duration::from_millis(501);
        f.device.tick(late);
        f.device.tick(late);
        f.device.tick(late);
        assert_eq!(f.device.error_state(), ErrorMachineState::Idle);

        // clear_error is only accepted in error-machine Idle
        f.device.clear_error().unwrap();
        assert!(f.device.clear_error().is_err());

        f.device.tick(late); // Reset
        assert_eq!(f.device.main_state(), MainState::Start);
        assert_eq!(f.device.request(), RequestSlot::Free);
        assert_eq!(f.device.last_error(), None);
        assert_eq!(f.device.with_logic(|logic| logic.motor), None);

        // The device re-initializes all the way back to Idle
        bring_to_idle(&f.device, late);
    }

    #[test]
    fn test_module_fault_escalates_immediately() {
        let f = fixture();
        let now = Instant::now();
        bring_to_idle(&f.device, now);

        f.registry.dispatch_error(&ModuleError {
            handle: f.motor,
            record: ErrorRecord::new(0x0021, 0x0007, 0),
        });

        assert_eq!(f.device.main_state(), MainState::Error);
        assert_eq!(f.device.last_error().unwrap().group, 0x0021);
    }

    #[test]
    fn test_fault_during_reporting_is_not_dropped() {
        let f = fixture();
        let now = Instant::now();
        bring_to_idle(&f.device, now);

        f.registry.dispatch_error(&ModuleError {
            handle: f.motor,
            record: ErrorRecord::new(TEST_GROUP, 0x00aa, 0),
        });
        f.device.tick(now);
        assert_eq!(f.device.error_state(), ErrorMachineState::ReportDevProc);

        // A second module fault lands while the first is still being reported
        f.registry.dispatch_error(&ModuleError {
            handle: f.motor,
            record: ErrorRecord::new(TEST_GROUP, 0x00bb, 0),
        });

        f.device.tick(now); // logs the first fault, second takes over
        f.device.tick(now);
        f.device.tick(now);
        assert_eq!(f.device.error_state(), ErrorMachineState::Idle);

        let codes: Vec<u16> = f
            .fault_log
            .entries()
            .iter()
            .map(|entry| entry.record.code)
            .collect();
        assert_eq!(codes, vec![0x00aa, 0x00bb]);
        assert_eq!(f.device.last_error().unwrap().code, 0x00bb);
    }

    #[test]
    fn test_clear_error_rejected_without_error() {
        let f = fixture();
        bring_to_idle(&f.device, Instant::now());
        assert!(f.device.clear_error().is_err());
    }
}
