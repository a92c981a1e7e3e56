//! Fixed-capacity table of loaded scripts, addressed by opaque
//! handle (§3).

use crate::error::{LoadError, ScriptHandle};
use crate::script::Script;

/// Minimum capacity required by §3; the VM may be configured larger
/// but never smaller.
pub const MINIMUM_CAPACITY: usize = 1024;

/// Owns every loaded [`Script`]. A handle is simply the slot index,
/// so handle comparison and lookup are both `O(1)` and handles from
/// disjoint registries are never accidentally compatible (there is
/// only ever one registry per VM).
pub struct ScriptRegistry {
    slots: Vec<Option<Script>>,
}

impl ScriptRegistry {
    pub fn new() -> ScriptRegistry {
        ScriptRegistry::with_capacity(MINIMUM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> ScriptRegistry {
        let capacity = capacity.max(MINIMUM_CAPACITY);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        ScriptRegistry { slots }
    }

    /// Inserts `script` into the first free slot, returning its
    /// handle. Fails with [`LoadError::ThreadsExhausted`] if every
    /// slot is occupied.
    pub fn insert(&mut self, script: Script) -> Result<ScriptHandle, LoadError> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(LoadError::ThreadsExhausted)?;
        self.slots[index] = Some(script);
        Ok(index as ScriptHandle)
    }

    /// Frees the slot for `handle`, dropping the script and every
    /// owned string it held (stack, registers, operand literals).
    pub fn remove(&mut self, handle: ScriptHandle) -> Option<Script> {
        self.slots.get_mut(handle as usize).and_then(Option::take)
    }

    pub fn get(&self, handle: ScriptHandle) -> Option<&Script> {
        self.slots.get(handle as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: ScriptHandle) -> Option<&mut Script> {
        self.slots.get_mut(handle as usize).and_then(Option::as_mut)
    }

    pub fn is_loaded(&self, handle: ScriptHandle) -> bool {
        self.get(handle).map(|s| s.state.loaded).unwrap_or(false)
    }

    /// Handles of every slot that is both loaded and executing, in
    /// slot order — the scheduler's round-robin candidate set.
    pub fn runnable_handles(&self) -> Vec<ScriptHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(script) if script.state.loaded && script.state.executing => {
                    Some(i as ScriptHandle)
                }
                _ => None,
            })
            .collect()
    }
}

impl Default for ScriptRegistry {
    fn default() -> ScriptRegistry {
        ScriptRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionStream;
    use crate::script::{ScriptState, TimeSlice};
    use crate::stack::Stack;
    use crate::value::RuntimeValue;

    fn empty_script() -> Script {
        Script {
            instructions: InstructionStream::new(vec![]),
            functions: vec![],
            host_function_names: vec![],
            main_index: None,
            time_slice: TimeSlice {
                priority: crate::opcode::ThreadPriority::Low,
                milliseconds: 20,
            },
            global_data_size: 0,
            stack: Stack::new(16),
            registers: [RuntimeValue::Null, RuntimeValue::Null, RuntimeValue::Null],
            instruction_pointer: 0,
            state: ScriptState::default(),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut registry = ScriptRegistry::new();
        let handle = registry.insert(empty_script()).unwrap();
        assert!(registry.get(handle).is_some());
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let mut registry = ScriptRegistry::with_capacity(1024);
        let handle = registry.insert(empty_script()).unwrap();
        registry.remove(handle);
        assert!(registry.get(handle).is_none());
        let reused = registry.insert(empty_script()).unwrap();
        assert_eq!(reused, handle);
    }

    #[test]
    fn runnable_handles_excludes_stopped_scripts() {
        let mut registry = ScriptRegistry::with_capacity(4);
        let mut script = empty_script();
        script.state.loaded = true;
        script.state.executing = true;
        let running = registry.insert(script).unwrap();

        let mut stopped = empty_script();
        stopped.state.loaded = true;
        stopped.state.executing = false;
        registry.insert(stopped).unwrap();

        assert_eq!(registry.runnable_handles(), vec![running]);
    }
}
