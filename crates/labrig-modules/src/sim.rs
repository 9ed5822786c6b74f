/*!
 * Simulated function-module bus.
 *
 * `SimBus` stands in for the real CAN transport: it records every issued
 * command and supports synchronous-failure injection per handle. Tests and
 * demos pair it with a [`ModuleRegistry`](crate::registry::ModuleRegistry)
 * and feed completions back through `dispatch_completion`.
 */
use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use crate::module::{BusError, ModuleBus, ModuleCommand, ModuleHandle};

/// A recorded command issue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IssuedCommand {
    /// The addressed module
    pub handle: ModuleHandle,
    /// The issued command
    pub command: ModuleCommand,
}

/// Simulated bus transport
#[derive(Debug, Default)]
pub struct SimBus {
    issued: Mutex<Vec<IssuedCommand>>,
    failing: Mutex<HashSet<ModuleHandle>>,
}

impl SimBus {
    /// Create a new simulated bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command to a handle fail synchronously
    pub fn set_failing(&self, handle: ModuleHandle, failing: bool) {
        let mut set = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing {
            set.insert(handle);
        } else {
            set.remove(&handle);
        }
    }

    /// All commands issued so far, in order
    pub fn issued(&self) -> Vec<IssuedCommand> {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Commands issued to one handle, in order
    pub fn issued_to(&self, handle: ModuleHandle) -> Vec<ModuleCommand> {
        self.issued()
            .into_iter()
            .filter(|issue| issue.handle == handle)
            .map(|issue| issue.command)
            .collect()
    }

    /// Drain the record of issued commands
    pub fn take_issued(&self) -> Vec<IssuedCommand> {
        let mut issued = self
            .issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *issued)
    }
}

impl ModuleBus for SimBus {
    fn start(&self, handle: ModuleHandle, command: ModuleCommand) -> Result<(), BusError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&handle);
        if failing {
            return Err(BusError::Rejected(
                handle,
                "simulated transmit failure".to_string(),
            ));
        }

        debug!("SimBus: {} <- {:?}", handle, command);
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(IssuedCommand { handle, command });
        Ok(())
    }
}
