/*!
 * Generic driver over one device task's module-task map.
 *
 * Every device type drives its active [`DeviceTask`] through the same small
 * set of operations: scan for the next startable task, issue its command on
 * the bus, convert exceeded timeout budgets into task errors, and reset the
 * map once the device task has been fully consumed.
 */
use std::time::Instant;

use tracing::{debug, warn};

use labrig_modules::ModuleBus;

use crate::task::{DeviceTask, ModuleTask, StartTrigger, TaskFault, TaskState};

/// Result of one startup scan over a device task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// The first startable task (Init with a satisfied trigger), if any
    pub next: Option<u8>,
    /// Whether any task is currently in Progress
    pub any_in_progress: bool,
    /// Whether any task has ended in Error
    pub any_errored: bool,
}

impl ScanOutcome {
    /// Whether the device task has been fully consumed without error
    pub fn all_finished(&self) -> bool {
        self.next.is_none() && !self.any_in_progress && !self.any_errored
    }
}

/// Scan the task map in index order.
///
/// Returns the first task in Init whose start trigger is satisfied, plus
/// whether any sibling is still in flight or has errored. Fail-fast: once
/// any sibling is in Error no further task is reported startable.
pub fn startup_scan(device_task: &DeviceTask) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    for (index, task) in device_task.tasks.iter() {
        match task.state {
            TaskState::Progress => outcome.any_in_progress = true,
            TaskState::Error => outcome.any_errored = true,
            TaskState::Init => {
                if outcome.next.is_none() && trigger_satisfied(device_task, task.trigger) {
                    outcome.next = Some(*index);
                }
            }
            TaskState::Finished => {}
        }
    }

    if outcome.any_errored {
        outcome.next = None;
    }
    outcome
}

fn trigger_satisfied(device_task: &DeviceTask, trigger: StartTrigger) -> bool {
    match trigger {
        StartTrigger::First => true,
        StartTrigger::AfterSibling(sibling) => device_task
            .tasks
            .get(&sibling)
            .map(|task| task.state == TaskState::Finished)
            .unwrap_or_else(|| {
                warn!(
                    "Task in {} references missing sibling {}",
                    device_task.key, sibling
                );
                false
            }),
    }
}

/// Issue a task's command on the bus.
///
/// Flips Init -> Progress and stamps `started_at` on success; Init -> Error
/// with [`TaskFault::StartFailed`] if the bus rejects the command.
pub fn start_task(task: &mut ModuleTask, bus: &dyn ModuleBus, now: Instant) -> bool {
    let Some(module) = task.module else {
        warn!("Task has no resolved module handle; marking it failed");
        task.fault = Some(TaskFault::StartFailed);
        task.state = TaskState::Error;
        return false;
    };

    match bus.start(module, task.command()) {
        Ok(()) => {
            debug!("Started {:?} on {}", task.expected_ack(), module);
            task.started_at = Some(now);
            task.state = TaskState::Progress;
            true
        }
        Err(e) => {
            warn!("Start on {} rejected: {}", module, e);
            task.fault = Some(TaskFault::StartFailed);
            task.state = TaskState::Error;
            false
        }
    }
}

/// Convert exceeded timeout budgets into task errors.
///
/// Returns whether any task timed out during this check. This is the only
/// path that produces [`TaskFault::Timeout`].
pub fn check_timeouts(device_task: &mut DeviceTask, now: Instant) -> bool {
    let mut any_timed_out = false;
    for (index, task) in device_task.tasks.iter_mut() {
        if task.timed_out(now) {
            warn!(
                "Task {} of {} timed out after {:?}",
                index, device_task.key, task.timeout
            );
            task.fault = Some(TaskFault::Timeout);
            task.state = TaskState::Error;
            any_timed_out = true;
        }
    }
    any_timed_out
}

/// Reset every module task back to Init, once the device task has been
/// fully consumed (reported Finished or Error).
pub fn reset_tasks(device_task: &mut DeviceTask) {
    device_task.reset();
}

/// Enumerate tasks bound to a module handle, starting after `cursor`.
///
/// Completion callbacks use this to walk candidate tasks when several tasks
/// of one device task share the same module instance.
pub fn next_task_for_module(
    device_task: &DeviceTask,
    handle: labrig_modules::ModuleHandle,
    cursor: Option<u8>,
) -> Option<u8> {
    device_task
        .tasks
        .iter()
        .filter(|(index, task)| {
            task.module == Some(handle) && cursor.map_or(true, |cursor| **index > cursor)
        })
        .map(|(index, _)| *index)
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use labrig_modules::{ModuleHandle, SimBus};

    use crate::task::{MotorSubtask, MotorTaskData, TaskKind};

    fn motor_task(subtask: MotorSubtask, trigger: StartTrigger, handle: u32) -> ModuleTask {
        ModuleTask::new(
            TaskKind::Motor(MotorTaskData {
                subtask,
                profile: 0,
                act_position: None,
                act_speed: None,
            }),
            trigger,
            Duration::from_millis(500),
        )
        .bind(ModuleHandle::new(handle))
    }

    fn chain() -> DeviceTask {
        let mut device_task = DeviceTask::new("reference-run")
            .with_task(
                0,
                motor_task(MotorSubtask::SetState { enabled: true }, StartTrigger::First, 1),
            )
            .with_task(
                1,
                motor_task(MotorSubtask::ReferenceRun, StartTrigger::AfterSibling(0), 1),
            );
        device_task.activate().unwrap();
        device_task
    }

    #[test]
    fn test_chain_ordering() {
        let mut device_task = chain();

        // B never startable while A is not Finished
        let scan = startup_scan(&device_task);
        assert_eq!(scan.next, Some(0));

        device_task.tasks.get_mut(&0).unwrap().state = TaskState::Progress;
        let scan = startup_scan(&device_task);
        assert_eq!(scan.next, None);
        assert!(scan.any_in_progress);

        // Once A is Finished, the very next scan returns B
        device_task.tasks.get_mut(&0).unwrap().state = TaskState::Finished;
        let scan = startup_scan(&device_task);
        assert_eq!(scan.next, Some(1));
        assert!(!scan.any_in_progress);
    }

    #[test]
    fn test_fail_fast_blocks_further_starts() {
        let mut device_task = DeviceTask::new("fan-out")
            .with_task(0, motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 1))
            .with_task(1, motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 2))
            .with_task(2, motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 3));
        device_task.activate().unwrap();

        device_task.tasks.get_mut(&0).unwrap().state = TaskState::Finished;
        device_task.tasks.get_mut(&1).unwrap().state = TaskState::Error;

        let scan = startup_scan(&device_task);
        assert!(scan.any_errored);
        assert_eq!(scan.next, None);
    }

    #[test]
    fn test_start_task_success_and_rejection() {
        let bus = Arc::new(SimBus::new());
        let now = Instant::now();

        let mut task = motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 1);
        assert!(start_task(&mut task, bus.as_ref(), now));
        assert_eq!(task.state, TaskState::Progress);
        assert_eq!(task.started_at, Some(now));

        bus.set_failing(ModuleHandle::new(2), true);
        let mut task = motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 2);
        assert!(!start_task(&mut task, bus.as_ref(), now));
        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.fault, Some(TaskFault::StartFailed));
    }

    #[test]
    fn test_unbound_task_fails_to_start() {
        let bus = SimBus::new();
        let mut task = ModuleTask::new(
            TaskKind::DigitalInput(Default::default()),
            StartTrigger::First,
            Duration::from_millis(500),
        );
        assert!(!start_task(&mut task, &bus, Instant::now()));
        assert_eq!(task.fault, Some(TaskFault::StartFailed));
    }

    #[test]
    fn test_timeout_conversion_only_for_exceeded_budget() {
        let mut device_task = chain();
        let start = Instant::now();
        let bus = SimBus::new();

        let task = device_task.tasks.get_mut(&0).unwrap();
        start_task(task, &bus, start);

        assert!(!check_timeouts(&mut device_task, start + Duration::from_millis(499)));
        assert_eq!(device_task.tasks[&0].state, TaskState::Progress);

        assert!(check_timeouts(&mut device_task, start + Duration::from_millis(501)));
        assert_eq!(device_task.tasks[&0].state, TaskState::Error);
        assert_eq!(device_task.tasks[&0].fault, Some(TaskFault::Timeout));
    }

    #[test]
    fn test_cursor_enumeration_over_shared_module() {
        let device_task = DeviceTask::new("double-move")
            .with_task(0, motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 7))
            .with_task(1, motor_task(MotorSubtask::RequestPosition, StartTrigger::AfterSibling(0), 7))
            .with_task(2, motor_task(MotorSubtask::RequestPosition, StartTrigger::First, 9));

        let handle = ModuleHandle::new(7);
        assert_eq!(next_task_for_module(&device_task, handle, None), Some(0));
        assert_eq!(next_task_for_module(&device_task, handle, Some(0)), Some(1));
        assert_eq!(next_task_for_module(&device_task, handle, Some(1)), None);
    }
}
