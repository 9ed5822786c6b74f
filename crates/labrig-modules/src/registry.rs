/*!
 * Function-module registry for labrig.
 *
 * The registry hands out module handles by symbolic key ("loader.motor",
 * "vessel.temp.0", ...) and routes completion and fault notifications from
 * the transport receive path to the callbacks devices register at
 * configuration time.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use labrig_core::types::Id;

use crate::module::{ModuleAck, ModuleClass, ModuleError, ModuleHandle};

/// Callback invoked when a module completion notification arrives
pub type CompletionCallback = Arc<dyn Fn(&ModuleAck) + Send + Sync>;

/// Callback invoked when a module reports an unsolicited fault
pub type ErrorCallback = Arc<dyn Fn(&ModuleError) + Send + Sync>;

/// Event types for the module registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A module was registered
    ModuleRegistered {
        /// The symbolic key
        key: Id,
        /// The assigned handle
        handle: ModuleHandle,
        /// The module class
        class: ModuleClass,
    },
}

/// One registered function module
#[derive(Debug, Clone)]
struct ModuleEntry {
    handle: ModuleHandle,
    class: ModuleClass,
}

/// Module registry
pub struct ModuleRegistry {
    /// Registered modules by symbolic key
    modules: RwLock<HashMap<Id, ModuleEntry>>,
    /// Completion callbacks by module handle
    completion_callbacks: RwLock<HashMap<ModuleHandle, Vec<CompletionCallback>>>,
    /// Error callbacks by module handle
    error_callbacks: RwLock<HashMap<ModuleHandle, Vec<ErrorCallback>>>,
    /// Handle allocator
    next_handle: AtomicU32,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules)
            .finish()
    }
}

impl ModuleRegistry {
    /// Create a new module registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            modules: RwLock::new(HashMap::new()),
            completion_callbacks: RwLock::new(HashMap::new()),
            error_callbacks: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            event_sender,
        }
    }

    /// Register a function module under a symbolic key, allocating its handle
    pub fn register_module<K: Into<Id>>(&self, key: K, class: ModuleClass) -> ModuleHandle {
        let key = key.into();
        let mut modules = self
            .modules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = modules.get(&key) {
            warn!("Module {} already registered as {}", key, entry.handle);
            return entry.handle;
        }

        let handle = ModuleHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        modules.insert(key.clone(), ModuleEntry { handle, class });
        let _ = self.event_sender.send(RegistryEvent::ModuleRegistered {
            key: key.clone(),
            handle,
            class,
        });
        debug!("Registered module {} as {} ({})", key, handle, class);

        handle
    }

    /// Look up a module handle by symbolic key
    pub fn lookup(&self, key: &Id) -> Option<ModuleHandle> {
        let modules = self
            .modules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        modules.get(key).map(|entry| entry.handle)
    }

    /// Get the class of a registered module
    pub fn class_of(&self, handle: ModuleHandle) -> Option<ModuleClass> {
        let modules = self
            .modules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        modules
            .values()
            .find(|entry| entry.handle == handle)
            .map(|entry| entry.class)
    }

    /// Register a completion callback for a module
    pub fn on_completion(&self, handle: ModuleHandle, callback: CompletionCallback) {
        let mut callbacks = self
            .completion_callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.entry(handle).or_default().push(callback);
    }

    /// Register an error callback for a module
    pub fn on_error(&self, handle: ModuleHandle, callback: ErrorCallback) {
        let mut callbacks = self
            .error_callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.entry(handle).or_default().push(callback);
    }

    /// Drop every callback registered for a module.
    ///
    /// Used by the device error-reset path before the device re-registers
    /// during its next configuration pass. Every function module belongs to
    /// exactly one device, so the owning device may drop the handle's whole
    /// callback list without affecting its peers.
    pub fn clear_callbacks(&self, handle: ModuleHandle) {
        self.completion_callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&handle);
        self.error_callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&handle);
    }

    /// Deliver a completion notification to the registered callbacks.
    ///
    /// The callback list is cloned out of the lock before invocation so no
    /// registry lock is held while a device callback runs.
    pub fn dispatch_completion(&self, ack: &ModuleAck) {
        let callbacks: Vec<CompletionCallback> = {
            let map = self
                .completion_callbacks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.get(&ack.handle).cloned().unwrap_or_default()
        };

        if callbacks.is_empty() {
            warn!("No completion callback registered for {}", ack.handle);
            return;
        }

        debug!("Dispatching {:?} completion for {}", ack.kind, ack.handle);
        for callback in callbacks {
            callback(ack);
        }
    }

    /// Deliver an unsolicited module fault to the registered callbacks
    pub fn dispatch_error(&self, error: &ModuleError) {
        let callbacks: Vec<ErrorCallback> = {
            let map = self
                .error_callbacks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.get(&error.handle).cloned().unwrap_or_default()
        };

        if callbacks.is_empty() {
            warn!(
                "No error callback registered for {}; fault dropped: {}",
                error.handle, error.record
            );
            return;
        }

        for callback in callbacks {
            callback(error);
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Count registered modules
    pub fn count_modules(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
