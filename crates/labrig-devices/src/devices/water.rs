/*!
 * Water device.
 *
 * Drives six valve outputs and one liquid-level input. Valve requests can
 * target one valve or all of them; the slave echoes the applied output value
 * in its completion, which is written back into the cached valve states.
 */
use tracing::warn;

use labrig_core::config::DeviceConfig;
use labrig_core::types::Id;
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::ModuleHandle;

use crate::devices::READ_TIMEOUT;
use crate::error::{DeviceError, Result};
use crate::runtime::{Activation, Device, DeviceLogic, Reporter, TaskOutcome};
use crate::task::{
    DeviceTask, DigitalInputTaskData, DigitalOutputSubtask, DigitalOutputTaskData, ModuleTask,
    StartTrigger, TaskKind,
};

/// Error group for water-device faults
pub const WATER_ERROR_GROUP: u16 = 0x0015;

/// Number of valves
pub const VALVE_COUNT: usize = 6;

/// Operation key: open or close valves
pub const TASK_SET_VALVE: &str = "set-valve";
/// Operation key: read the liquid-level input
pub const TASK_REQUEST_LIQUID_LEVEL: &str = "request-liquid-level";

/// Which valves a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveTarget {
    /// One valve by index (0-based)
    Single(u8),
    /// Every valve
    All,
}

impl ValveTarget {
    fn activation(self) -> Result<Activation> {
        match self {
            ValveTarget::Single(index) => {
                if usize::from(index) >= VALVE_COUNT {
                    return Err(DeviceError::not_found(format!(
                        "Valve index {} out of range",
                        index
                    )));
                }
                Ok(Activation::Subset(vec![index]))
            }
            ValveTarget::All => Ok(Activation::All),
        }
    }
}

/// Water device logic
pub struct WaterLogic {
    config: DeviceConfig,
    valve_keys: [Id; VALVE_COUNT],
    level_key: Id,
    valves: [Option<ModuleHandle>; VALVE_COUNT],
    level: Option<ModuleHandle>,
    valve_states: [Option<bool>; VALVE_COUNT],
    liquid_level: Option<u16>,
}

impl WaterLogic {
    /// Create water-device logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let valve_keys = std::array::from_fn(|index| {
            config
                .modules
                .get(&format!("valve_{}", index))
                .cloned()
                .unwrap_or_else(|| format!("water.valve.{}", index))
                .into()
        });
        let level_key = config
            .modules
            .get("level")
            .cloned()
            .unwrap_or_else(|| "water.level".to_string())
            .into();
        Self {
            config,
            valve_keys,
            level_key,
            valves: [None; VALVE_COUNT],
            level: None,
            valve_states: [None; VALVE_COUNT],
            liquid_level: None,
        }
    }
}

impl DeviceLogic for WaterLogic {
    fn device_type(&self) -> &'static str {
        "water"
    }

    fn error_group(&self) -> u16 {
        WATER_ERROR_GROUP
    }

    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()> {
        for (index, key) in self.valve_keys.iter().enumerate() {
            let handle = registry.lookup(key).ok_or_else(|| {
                DeviceError::config(format!("Module {} not registered", key))
            })?;
            self.valves[index] = Some(handle);
        }
        self.level = registry.lookup(&self.level_key);
        self.level.map(|_| ()).ok_or_else(|| {
            DeviceError::config(format!("Module {} not registered", self.level_key))
        })
    }

    fn module_handles(&self) -> Vec<ModuleHandle> {
        self.valves
            .iter()
            .copied()
            .flatten()
            .chain(self.level)
            .collect()
    }

    fn build_tasks(&self) -> Result<Vec<DeviceTask>> {
        let mut set_valve = DeviceTask::new(TASK_SET_VALVE);
        for (index, valve) in self.valves.iter().enumerate() {
            let valve = valve.ok_or_else(|| {
                DeviceError::null_handle(format!("Valve {} module unresolved", index))
            })?;
            set_valve = set_valve.with_task(
                index as u8,
                ModuleTask::new(
                    TaskKind::DigitalOutput(DigitalOutputTaskData {
                        subtask: DigitalOutputSubtask::SetValue { value: 0 },
                        act_value: None,
                    }),
                    StartTrigger::First,
                    self.config.timeout("set_valve", READ_TIMEOUT),
                )
                .bind(valve),
            );
        }

        let level = self
            .level
            .ok_or_else(|| DeviceError::null_handle("liquid-level input unresolved"))?;
        let request_level = DeviceTask::new(TASK_REQUEST_LIQUID_LEVEL).with_task(
            0,
            ModuleTask::new(
                TaskKind::DigitalInput(DigitalInputTaskData::default()),
                StartTrigger::First,
                self.config.timeout("request_level", READ_TIMEOUT),
            )
            .bind(level),
        );

        Ok(vec![set_valve, request_level])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_SET_VALVE => {
                // Only tasks the request actually ran carry a write-back value
                for (index, module_task) in task.tasks.iter() {
                    if let TaskKind::DigitalOutput(data) = &module_task.kind {
                        if let Some(value) = data.act_value {
                            self.valve_states[usize::from(*index)] = Some(value != 0);
                        }
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!(self.valve_states),
                );
            }
            TASK_REQUEST_LIQUID_LEVEL => {
                if success {
                    if let Some(TaskKind::DigitalInput(data)) =
                        task.tasks.get(&0).map(|t| &t.kind)
                    {
                        if let Some(value) = data.act_value {
                            self.liquid_level = Some(value);
                        }
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!(self.liquid_level),
                );
            }
            other => warn!("Water device resolved unknown task {}", other),
        }
    }

    fn clear_on_reset(&mut self) {
        self.valves = [None; VALVE_COUNT];
        self.level = None;
        self.valve_states = [None; VALVE_COUNT];
        self.liquid_level = None;
    }
}

/// A water device instance
pub type Water = Device<WaterLogic>;

impl Device<WaterLogic> {
    /// Open or close one valve or all of them
    pub fn set_valve(&self, open: bool, target: ValveTarget) -> Result<()> {
        self.submit(&Id::from(TASK_SET_VALVE), |_logic, task| {
            let value = u16::from(open);
            for module_task in task.tasks.values_mut() {
                if let TaskKind::DigitalOutput(data) = &mut module_task.kind {
                    data.subtask = DigitalOutputSubtask::SetValue { value };
                }
            }
            target.activation()
        })
    }

    /// Request a read of the liquid-level input
    pub fn request_liquid_level(&self) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_LIQUID_LEVEL), |_logic, _task| {
            Ok(Activation::All)
        })
    }

    /// Last known open/closed state of one valve
    pub fn valve_state(&self, index: usize) -> Option<bool> {
        self.with_logic(|logic| logic.valve_states.get(index).copied().flatten())
    }

    /// Last known raw liquid-level input value
    pub fn liquid_level(&self) -> Option<u16> {
        self.with_logic(|logic| logic.liquid_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_logic() -> WaterLogic {
        let mut logic = WaterLogic::new(DeviceConfig::default());
        for index in 0..VALVE_COUNT {
            logic.valves[index] = Some(ModuleHandle::new(index as u32 + 1));
        }
        logic.level = Some(ModuleHandle::new(10));
        logic
    }

    #[test]
    fn test_task_table_shape() {
        let logic = resolved_logic();
        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 2);

        let set_valve = tasks
            .iter()
            .find(|task| task.key.as_str() == TASK_SET_VALVE)
            .unwrap();
        assert_eq!(set_valve.tasks.len(), VALVE_COUNT);
    }

    #[test]
    fn test_valve_target_activation() {
        assert!(matches!(
            ValveTarget::Single(5).activation(),
            Ok(Activation::Subset(indexes)) if indexes == vec![5]
        ));
        assert!(ValveTarget::Single(6).activation().is_err());
        assert!(matches!(ValveTarget::All.activation(), Ok(Activation::All)));
    }

    #[test]
    fn test_missing_level_input_rejects_task_build() {
        let mut logic = resolved_logic();
        logic.level = None;
        assert!(matches!(
            logic.build_tasks(),
            Err(DeviceError::NullHandle(_))
        ));
    }
}
