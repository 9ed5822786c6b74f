/*!
 * Hood-sensor device.
 *
 * Watches one digital input wired to the instrument hood switch. Besides the
 * explicit status request, the slave pushes unsolicited input-change
 * notifications; those update the cached hood state and are surfaced as
 * value-change events.
 */
use serde::Serialize;
use tracing::warn;

use labrig_core::config::DeviceConfig;
use labrig_core::types::Id;
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::{AckKind, AckPayload, ModuleAck, ModuleHandle};

use crate::devices::READ_TIMEOUT;
use crate::error::{DeviceError, Result};
use crate::runtime::{Activation, Device, DeviceLogic, Reporter, TaskOutcome};
use crate::task::{DeviceTask, DigitalInputTaskData, ModuleTask, StartTrigger, TaskKind};

/// Error group for hood-sensor faults
pub const HOOD_SENSOR_ERROR_GROUP: u16 = 0x0014;

/// Operation key: read the hood switch
pub const TASK_REQUEST_HOOD_STATUS: &str = "request-hood-status";

/// Hood state derived from the switch input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HoodState {
    /// Hood closed (input low)
    Closed,
    /// Hood open (input high)
    Open,
}

impl HoodState {
    fn from_input(value: u16) -> Self {
        if value == 0 {
            HoodState::Closed
        } else {
            HoodState::Open
        }
    }
}

/// Hood-sensor device logic
pub struct HoodSensorLogic {
    config: DeviceConfig,
    input_key: Id,
    input: Option<ModuleHandle>,
    hood_state: Option<HoodState>,
}

impl HoodSensorLogic {
    /// Create hood-sensor logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let input_key = config
            .modules
            .get("input")
            .cloned()
            .unwrap_or_else(|| "hood.input".to_string())
            .into();
        Self {
            config,
            input_key,
            input: None,
            hood_state: None,
        }
    }
}

impl DeviceLogic for HoodSensorLogic {
    fn device_type(&self) -> &'static str {
        "hood_sensor"
    }

    fn error_group(&self) -> u16 {
        HOOD_SENSOR_ERROR_GROUP
    }

    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()> {
        self.input = registry.lookup(&self.input_key);
        self.input.map(|_| ()).ok_or_else(|| {
            DeviceError::config(format!("Module {} not registered", self.input_key))
        })
    }

    fn module_handles(&self) -> Vec<ModuleHandle> {
        self.input.into_iter().collect()
    }

    fn build_tasks(&self) -> Result<Vec<DeviceTask>> {
        let input = self
            .input
            .ok_or_else(|| DeviceError::null_handle("hood input unresolved"))?;
        Ok(vec![DeviceTask::new(TASK_REQUEST_HOOD_STATUS).with_task(
            0,
            ModuleTask::new(
                TaskKind::DigitalInput(DigitalInputTaskData::default()),
                StartTrigger::First,
                self.config.timeout("request_status", READ_TIMEOUT),
            )
            .bind(input),
        )])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_REQUEST_HOOD_STATUS => {
                if success {
                    if let Some(TaskKind::DigitalInput(data)) =
                        task.tasks.get(&0).map(|t| &t.kind)
                    {
                        if let Some(value) = data.act_value {
                            self.hood_state = Some(HoodState::from_input(value));
                        }
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!(self.hood_state),
                );
            }
            other => warn!("Hood sensor resolved unknown task {}", other),
        }
    }

    fn unsolicited_ack(&mut self, ack: &ModuleAck, reporter: &Reporter<'_>) {
        if Some(ack.handle) != self.input || ack.kind != AckKind::DigitalInputValue {
            return;
        }
        if !ack.result.is_ok() {
            return;
        }
        if let AckPayload::DigitalValue(value) = ack.payload {
            let state = HoodState::from_input(value);
            if self.hood_state != Some(state) {
                self.hood_state = Some(state);
                reporter.value_changed("hood", serde_json::json!(state));
            }
        }
    }

    fn clear_on_reset(&mut self) {
        self.input = None;
        self.hood_state = None;
    }
}

/// A hood-sensor device instance
pub type HoodSensor = Device<HoodSensorLogic>;

impl Device<HoodSensorLogic> {
    /// Request a fresh read of the hood switch
    pub fn request_hood_status(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_HOOD_STATUS), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Last known hood state
    pub fn hood_state(&self) -> Option<HoodState> {
        self.with_logic(|logic| logic.hood_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use labrig_modules::{ModuleBus, ModuleClass, SimBus};

    use crate::events::{DeviceEvent, FaultLog, SharedFaultLog};
    use crate::runtime::{MainState, RequestSlot};

    struct Rig {
        device: HoodSensor,
        registry: Arc<ModuleRegistry>,
        input: ModuleHandle,
    }

    fn rig() -> Rig {
        let registry = Arc::new(ModuleRegistry::new());
        let input = registry.register_module("hood.input", ModuleClass::DigitalInput);
        let bus = Arc::new(SimBus::new());
        let fault_log: SharedFaultLog = Arc::new(FaultLog::new());
        let device = HoodSensor::new(
            "hood-1",
            HoodSensorLogic::new(DeviceConfig::default()),
            Arc::clone(&registry),
            bus as Arc<dyn ModuleBus>,
            fault_log,
        );
        Rig {
            device,
            registry,
            input,
        }
    }

    fn bring_to_idle(device: &HoodSensor, now: Instant) {
        for _ in 0..3 {
            device.tick(now);
        }
        assert_eq!(device.main_state(), MainState::Idle);
    }

    #[test]
    fn test_input_classification() {
        assert_eq!(HoodState::from_input(0), HoodState::Closed);
        assert_eq!(HoodState::from_input(1), HoodState::Open);
        assert_eq!(HoodState::from_input(0xffff), HoodState::Open);
    }

    #[test]
    fn test_unsolicited_input_change_updates_state() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.device, now);
        assert_eq!(r.device.hood_state(), None);

        // The slave pushes an input change with no request in flight
        let mut events = r.device.subscribe();
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.input,
            AckKind::DigitalInputValue,
            AckPayload::DigitalValue(1),
        ));
        assert_eq!(r.device.hood_state(), Some(HoodState::Open));
        assert_eq!(r.device.request(), RequestSlot::Free);
        match events.try_recv() {
            Ok(DeviceEvent::ValueChanged {
                property, value, ..
            }) => {
                assert_eq!(property, "hood");
                assert_eq!(value, serde_json::json!(HoodState::Open));
            }
            other => panic!("expected a value-change event, got {:?}", other),
        }

        // Repeating the same value is not re-published
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.input,
            AckKind::DigitalInputValue,
            AckPayload::DigitalValue(1),
        ));
        assert!(events.try_recv().is_err());

        r.registry.dispatch_completion(&ModuleAck::ok(
            r.input,
            AckKind::DigitalInputValue,
            AckPayload::DigitalValue(0),
        ));
        assert_eq!(r.device.hood_state(), Some(HoodState::Closed));
    }

    #[test]
    fn test_status_request_round_trip() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.device, now);

        r.device.request_hood_status().unwrap();
        r.device.tick(now);
        r.registry.dispatch_completion(&ModuleAck::ok(
            r.input,
            AckKind::DigitalInputValue,
            AckPayload::DigitalValue(0),
        ));
        r.device.tick(now);

        assert_eq!(r.device.request(), RequestSlot::Free);
        assert_eq!(r.device.hood_state(), Some(HoodState::Closed));
    }

    #[test]
    fn test_task_table_shape() {
        let mut logic = HoodSensorLogic::new(DeviceConfig::default());
        logic.input = Some(ModuleHandle::new(1));

        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key.as_str(), TASK_REQUEST_HOOD_STATUS);
    }
}
