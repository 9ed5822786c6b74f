/*!
 * Heated-vessels device.
 *
 * Drives four temperature-controller modules, one per vessel. Every
 * operation can target a single vessel or all of them; an ALL request
 * fans out over the per-vessel module tasks of one shared device task.
 */
use tracing::warn;

use labrig_core::config::DeviceConfig;
use labrig_core::types::Id;
use labrig_modules::registry::ModuleRegistry;
use labrig_modules::{ModuleHandle, TempOperatingMode};

use crate::devices::READ_TIMEOUT;
use crate::error::{DeviceError, Result};
use crate::runtime::{Activation, Device, DeviceLogic, Reporter, TaskOutcome};
use crate::task::{DeviceTask, ModuleTask, StartTrigger, TaskKind, TempSubtask, TempTaskData};

/// Error group for heated-vessels faults
pub const HEATED_VESSELS_ERROR_GROUP: u16 = 0x0013;

/// Number of vessels
pub const VESSEL_COUNT: usize = 4;

/// Operation key: set the nominal temperature
pub const TASK_SET_TEMPERATURE: &str = "set-temperature";
/// Operation key: read back the actual temperature
pub const TASK_REQUEST_TEMPERATURE: &str = "request-temperature";
/// Operation key: switch temperature regulation on or off
pub const TASK_SET_STATUS: &str = "set-status";
/// Operation key: select the regulation operating mode
pub const TASK_SET_OPERATING_MODE: &str = "set-operating-mode";

/// Which vessels a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VesselTarget {
    /// One vessel by index (0-based)
    Single(u8),
    /// Every vessel
    All,
}

impl VesselTarget {
    fn activation(self) -> Result<Activation> {
        match self {
            VesselTarget::Single(index) => {
                if usize::from(index) >= VESSEL_COUNT {
                    return Err(DeviceError::not_found(format!(
                        "Vessel index {} out of range",
                        index
                    )));
                }
                Ok(Activation::Subset(vec![index]))
            }
            VesselTarget::All => Ok(Activation::All),
        }
    }
}

/// Heated-vessels device logic
pub struct HeatedVesselsLogic {
    config: DeviceConfig,
    vessel_keys: [Id; VESSEL_COUNT],
    vessels: [Option<ModuleHandle>; VESSEL_COUNT],
    act_temperature: [Option<f32>; VESSEL_COUNT],
}

impl HeatedVesselsLogic {
    /// Create heated-vessels logic from its configuration table
    pub fn new(config: DeviceConfig) -> Self {
        let vessel_keys = std::array::from_fn(|index| {
            config
                .modules
                .get(&format!("temp_{}", index))
                .cloned()
                .unwrap_or_else(|| format!("vessel.temp.{}", index))
                .into()
        });
        Self {
            config,
            vessel_keys,
            vessels: [None; VESSEL_COUNT],
            act_temperature: [None; VESSEL_COUNT],
        }
    }

    /// A device task with one module task of the given subtask per vessel
    fn fan_out_task(&self, key: &str, subtask: TempSubtask) -> Result<DeviceTask> {
        let mut task = DeviceTask::new(key);
        for (index, vessel) in self.vessels.iter().enumerate() {
            let vessel = vessel.ok_or_else(|| {
                DeviceError::null_handle(format!("Vessel {} module unresolved", index))
            })?;
            task = task.with_task(
                index as u8,
                ModuleTask::new(
                    TaskKind::TemperatureControl(TempTaskData {
                        subtask,
                        act_temperature: None,
                    }),
                    StartTrigger::First,
                    self.config.timeout(key, READ_TIMEOUT),
                )
                .bind(vessel),
            );
        }
        Ok(task)
    }
}

/// Overwrite each temperature task's subtask, keeping write-back fields
fn fill_subtask(task: &mut DeviceTask, subtask: TempSubtask) {
    for module_task in task.tasks.values_mut() {
        if let TaskKind::TemperatureControl(data) = &mut module_task.kind {
            data.subtask = subtask;
        }
    }
}

impl DeviceLogic for HeatedVesselsLogic {
    fn device_type(&self) -> &'static str {
        "heated_vessels"
    }

    fn error_group(&self) -> u16 {
        HEATED_VESSELS_ERROR_GROUP
    }

    fn resolve_modules(&mut self, registry: &ModuleRegistry) -> Result<()> {
        for (index, key) in self.vessel_keys.iter().enumerate() {
            let handle = registry.lookup(key).ok_or_else(|| {
                DeviceError::config(format!("Module {} not registered", key))
            })?;
            self.vessels[index] = Some(handle);
        }
        Ok(())
    }

    fn module_handles(&self) -> Vec<ModuleHandle> {
        self.vessels.iter().copied().flatten().collect()
    }

    fn build_tasks(&self) -> Result<Vec<DeviceTask>> {
        Ok(vec![
            self.fan_out_task(
                TASK_SET_TEMPERATURE,
                TempSubtask::SetTemperature { celsius: 0.0 },
            )?,
            self.fan_out_task(TASK_REQUEST_TEMPERATURE, TempSubtask::RequestTemperature)?,
            self.fan_out_task(TASK_SET_STATUS, TempSubtask::SetStatus { on: false })?,
            self.fan_out_task(
                TASK_SET_OPERATING_MODE,
                TempSubtask::SetOperatingMode {
                    mode: TempOperatingMode::Full,
                },
            )?,
        ])
    }

    fn task_resolved(&mut self, task: &DeviceTask, outcome: &TaskOutcome, reporter: &Reporter<'_>) {
        let success = matches!(outcome, TaskOutcome::Success);
        match task.key.as_str() {
            TASK_SET_TEMPERATURE | TASK_REQUEST_TEMPERATURE | TASK_SET_STATUS
            | TASK_SET_OPERATING_MODE => {
                for (index, module_task) in task.tasks.iter() {
                    if let TaskKind::TemperatureControl(data) = &module_task.kind {
                        if let Some(celsius) = data.act_temperature {
                            self.act_temperature[usize::from(*index)] = Some(celsius);
                        }
                    }
                }
                reporter.operation_finished(
                    &task.key,
                    success,
                    serde_json::json!(self.act_temperature),
                );
            }
            other => warn!("Heated vessels resolved unknown task {}", other),
        }
    }

    fn clear_on_reset(&mut self) {
        self.vessels = [None; VESSEL_COUNT];
        self.act_temperature = [None; VESSEL_COUNT];
    }
}

/// A heated-vessels device instance
pub type HeatedVessels = Device<HeatedVesselsLogic>;

impl Device<HeatedVesselsLogic> {
    /// Request a nominal temperature for one vessel or all of them
    pub fn set_temperature(&self, celsius: f32, target: VesselTarget) -> Result<()> {
        self.submit(&Id::from(TASK_SET_TEMPERATURE), |_logic, task| {
            fill_subtask(task, TempSubtask::SetTemperature { celsius });
            target.activation()
        })
    }

    /// Request a read-back of the actual temperature
    pub fn request_temperature(&self, target: VesselTarget) -> Result<()> {
        self.submit(&Id::from(TASK_REQUEST_TEMPERATURE), |_logic, task| {
            fill_subtask(task, TempSubtask::RequestTemperature);
            target.activation()
        })
    }

    /// Switch temperature regulation on or off
    pub fn set_status(&self, on: bool, target: VesselTarget) -> Result<()> {
        self.submit(&Id::from(TASK_SET_STATUS), |_logic, task| {
            fill_subtask(task, TempSubtask::SetStatus { on });
            target.activation()
        })
    }

    /// Select the regulation operating mode
    pub fn set_operating_mode(&self, mode: TempOperatingMode, target: VesselTarget) -> Result<()> {
        self.submit(&Id::from(TASK_SET_OPERATING_MODE), |_logic, task| {
            fill_subtask(task, TempSubtask::SetOperatingMode { mode });
            target.activation()
        })
    }

    /// Last known actual temperature of one vessel
    pub fn vessel_temperature(&self, index: usize) -> Option<f32> {
        self.with_logic(|logic| logic.act_temperature.get(index).copied().flatten())
    }

    /// Last known actual temperatures of every vessel
    pub fn temperatures(&self) -> [Option<f32>; VESSEL_COUNT] {
        self.with_logic(|logic| logic.act_temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use labrig_modules::{
        AckKind, AckPayload, ModuleAck, ModuleBus, ModuleClass, ModuleRegistry, SimBus,
        TempCommand,
    };

    use crate::events::FaultLog;
    use crate::runtime::{MainState, RequestSlot, FAULT_START_FAILED};

    struct Rig {
        device: HeatedVessels,
        registry: Arc<ModuleRegistry>,
        bus: Arc<SimBus>,
        vessels: Vec<ModuleHandle>,
    }

    fn rig() -> Rig {
        let registry = Arc::new(ModuleRegistry::new());
        let vessels: Vec<ModuleHandle> = (0..VESSEL_COUNT)
            .map(|index| {
                registry.register_module(
                    format!("vessel.temp.{}", index),
                    ModuleClass::TemperatureControl,
                )
            })
            .collect();
        let bus = Arc::new(SimBus::new());
        let device = Device::new(
            "vessels-1",
            HeatedVesselsLogic::new(DeviceConfig::default()),
            Arc::clone(&registry),
            bus.clone() as Arc<dyn ModuleBus>,
            Arc::new(FaultLog::new()),
        );
        Rig {
            device,
            registry,
            bus,
            vessels,
        }
    }

    fn bring_to_idle(device: &HeatedVessels, now: Instant) {
        for _ in 0..3 {
            device.tick(now);
        }
        assert_eq!(device.main_state(), MainState::Idle);
    }

    #[test]
    fn test_all_target_fans_out_to_every_vessel() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.device, now);

        r.device.set_temperature(37.0, VesselTarget::All).unwrap();
        r.device.tick(now);

        for vessel in &r.vessels {
            assert_eq!(
                r.bus.issued_to(*vessel),
                vec![labrig_modules::ModuleCommand::Temperature(
                    TempCommand::SetTemperature { celsius: 37.0 }
                )]
            );
        }

        for vessel in &r.vessels {
            r.registry.dispatch_completion(&ModuleAck::ok(
                *vessel,
                AckKind::TempTemperature,
                AckPayload::Temperature(37.0),
            ));
        }
        r.device.tick(now);
        assert_eq!(r.device.request(), RequestSlot::Free);
        assert_eq!(r.device.temperatures(), [Some(37.0); VESSEL_COUNT]);
    }

    #[test]
    fn test_single_target_only_touches_its_vessel() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.device, now);

        r.device
            .set_temperature(60.0, VesselTarget::Single(1))
            .unwrap();
        r.device.tick(now);

        assert_eq!(r.bus.issued_to(r.vessels[0]), vec![]);
        assert_eq!(r.bus.issued_to(r.vessels[1]).len(), 1);
        assert_eq!(r.bus.issued_to(r.vessels[2]), vec![]);

        r.registry.dispatch_completion(&ModuleAck::ok(
            r.vessels[1],
            AckKind::TempTemperature,
            AckPayload::Temperature(60.0),
        ));
        r.device.tick(now);
        assert_eq!(r.device.vessel_temperature(1), Some(60.0));
        assert_eq!(r.device.vessel_temperature(0), None);
    }

    #[test_log::test]
    fn test_fan_out_failure_surfaces_failing_vessel() {
        let r = rig();
        let now = Instant::now();
        bring_to_idle(&r.device, now);

        // Vessel 2 rejects synchronously; vessels 0 and 1 were already issued
        r.bus.set_failing(r.vessels[2], true);
        r.device.set_temperature(37.0, VesselTarget::All).unwrap();
        r.device.tick(now);

        assert_eq!(r.bus.issued_to(r.vessels[0]).len(), 1);
        assert_eq!(r.bus.issued_to(r.vessels[1]).len(), 1);
        assert_eq!(r.bus.issued_to(r.vessels[2]), vec![]);

        assert_eq!(r.device.main_state(), MainState::Error);
        let record = r.device.last_error().unwrap();
        assert_eq!(record.group, HEATED_VESSELS_ERROR_GROUP);
        assert_eq!(record.code, FAULT_START_FAILED);
        assert_eq!(record.data, 2);
    }

    fn resolved_logic() -> HeatedVesselsLogic {
        let mut logic = HeatedVesselsLogic::new(DeviceConfig::default());
        for index in 0..VESSEL_COUNT {
            logic.vessels[index] = Some(ModuleHandle::new(index as u32 + 1));
        }
        logic
    }

    #[test]
    fn test_fan_out_covers_every_vessel() {
        let logic = resolved_logic();
        let tasks = logic.build_tasks().unwrap();
        assert_eq!(tasks.len(), 4);
        for task in &tasks {
            assert_eq!(task.tasks.len(), VESSEL_COUNT);
        }
    }

    #[test]
    fn test_single_target_activation() {
        assert!(matches!(
            VesselTarget::Single(2).activation(),
            Ok(Activation::Subset(indexes)) if indexes == vec![2]
        ));
        assert!(VesselTarget::Single(4).activation().is_err());
        assert!(matches!(VesselTarget::All.activation(), Ok(Activation::All)));
    }

    #[test]
    fn test_missing_vessel_rejects_task_build() {
        let mut logic = resolved_logic();
        logic.vessels[2] = None;
        assert!(matches!(
            logic.build_tasks(),
            Err(DeviceError::NullHandle(_))
        ));
    }
}
