//! The host-provided-function registry and the parameter/return
//! accessors a host callback uses once `CallHost` has invoked it
//! (§4.7).

use std::rc::Rc;

use crate::error::{Fault, ScriptHandle};
use crate::opcode::GLOBAL_HOST_FUNCTION;
use crate::value::RuntimeValue;
use crate::vm::VirtualMachine;

/// Minimum registry capacity required by §3.
pub const MINIMUM_CAPACITY: usize = 256;

pub type HostFunction = Rc<dyn Fn(&mut VirtualMachine, ScriptHandle)>;

struct HostFunctionEntry {
    name: String,
    /// `None` means visible to every script (`GLOBAL_HOST_FUNCTION`);
    /// `Some(handle)` restricts it to one script.
    visible_to: Option<ScriptHandle>,
    function: HostFunction,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("host function registry is full")]
    RegistryFull,
    #[error("host function name exceeds 255 bytes")]
    NameTooLong,
}

/// Process-wide table of callable host functions (§3). Written only
/// during registration; read by any script thread executing
/// `CallHost`.
#[derive(Default)]
pub struct HostFunctionRegistry {
    entries: Vec<Option<HostFunctionEntry>>,
}

impl HostFunctionRegistry {
    pub fn new() -> HostFunctionRegistry {
        HostFunctionRegistry::with_capacity(MINIMUM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> HostFunctionRegistry {
        let capacity = capacity.max(MINIMUM_CAPACITY);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        HostFunctionRegistry { entries }
    }

    /// Inserts `name` into the first free slot, visible either
    /// globally (`visible_to == None`) or only to one script.
    pub fn register(
        &mut self,
        visible_to: Option<ScriptHandle>,
        name: &str,
        function: HostFunction,
    ) -> Result<(), RegisterError> {
        if name.len() >= 256 {
            return Err(RegisterError::NameTooLong);
        }
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(RegisterError::RegistryFull)?;
        self.entries[slot] = Some(HostFunctionEntry {
            name: name.to_string(),
            visible_to,
            function,
        });
        Ok(())
    }

    /// Finds the function named `name` callable by `script`: either a
    /// global registration, or one scoped to exactly that script.
    /// Case-insensitive, per §9.
    pub fn find(&self, script: ScriptHandle, name: &str) -> Option<HostFunction> {
        self.entries.iter().flatten().find_map(|entry| {
            let visible = match entry.visible_to {
                None => true,
                Some(handle) => handle == script,
            };
            if visible && entry.name.eq_ignore_ascii_case(name) {
                Some(Rc::clone(&entry.function))
            } else {
                None
            }
        })
    }
}

/// Sentinel accepted at the public API boundary for "every script,"
/// mirroring [`GLOBAL_HOST_FUNCTION`] at the binary-format layer.
pub fn is_global(visible_to: u32) -> bool {
    visible_to == GLOBAL_HOST_FUNCTION
}

/// Reads parameter `index`, counting down from the current
/// `top_index` as described in §4.7, coercing with `coerce`.
pub(crate) fn parameter<T>(
    script: &crate::script::Script,
    index: u32,
    coerce: impl Fn(&RuntimeValue) -> Result<T, crate::value::CoercionError>,
) -> Result<T, Fault> {
    let slot = script
        .stack
        .top_index()
        .checked_sub(index as usize + 1)
        .ok_or(Fault::StackUnderflow)?;
    let value = script.stack.get(slot).ok_or(Fault::StackUnderflow)?;
    coerce(value).map_err(Fault::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_find_is_case_insensitive() {
        let mut registry = HostFunctionRegistry::new();
        registry
            .register(None, "Print", Rc::new(|_, _| {}))
            .unwrap();
        assert!(registry.find(0, "print").is_some());
        assert!(registry.find(0, "Missing").is_none());
    }

    #[test]
    fn scoped_registration_is_invisible_to_other_scripts() {
        let mut registry = HostFunctionRegistry::new();
        registry.register(Some(3), "Secret", Rc::new(|_, _| {})).unwrap();
        assert!(registry.find(3, "Secret").is_some());
        assert!(registry.find(4, "Secret").is_none());
    }

    #[test]
    fn registry_reports_full_once_exhausted() {
        let mut registry = HostFunctionRegistry::with_capacity(1);
        registry.register(None, "One", Rc::new(|_, _| {})).unwrap();
        let err = registry.register(None, "Two", Rc::new(|_, _| {})).unwrap_err();
        assert!(matches!(err, RegisterError::RegistryFull));
    }
}
