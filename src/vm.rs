//! The embedding surface (§6): a single [`VirtualMachine`] a host
//! application creates once, loads scripts into, and drives with
//! [`VirtualMachine::run_scripts`].

use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, info};

use crate::error::{Fault, LoadError, ScriptHandle};
use crate::host::{HostFunction, HostFunctionRegistry, RegisterError};
use crate::interpreter::{self, Step};
use crate::loader::{self, HostIdentity};
use crate::opcode::GLOBAL_HOST_FUNCTION;
use crate::rand::Lcg;
use crate::registry::ScriptRegistry;
use crate::scheduler::{Scheduler, ThreadingMode, TickOutcome};
use crate::value::RuntimeValue;

/// Duration accepted by [`VirtualMachine::run_scripts`] meaning "run
/// until nothing is runnable," never preempting on a wall-clock
/// budget.
pub const INFINITE: u64 = u64::MAX;

pub struct VirtualMachine {
    pub(crate) registry: ScriptRegistry,
    pub(crate) host_functions: HostFunctionRegistry,
    scheduler: Scheduler,
    rng: Lcg,
    host: HostIdentity,
    now_ms: u64,
    /// Set by `Ret` unwinding a stack-base marker while in
    /// single-thread mode; makes `run_scripts` stop promptly.
    single_thread_exit: bool,
}

impl VirtualMachine {
    pub fn new(host_name: impl Into<String>, host_major: u8, host_minor: u8) -> VirtualMachine {
        VirtualMachine {
            registry: ScriptRegistry::new(),
            host_functions: HostFunctionRegistry::new(),
            scheduler: Scheduler::new(),
            rng: Lcg::from_system_time(),
            host: HostIdentity { name: host_name.into(), version: (host_major, host_minor) },
            now_ms: 0,
            single_thread_exit: false,
        }
    }

    /// Advances the VM's notion of wall-clock time. A host embedding
    /// this runtime calls this once per real tick; tests call it
    /// directly to drive the scheduler deterministically.
    pub fn advance_clock(&mut self, delta_ms: u64) {
        self.now_ms += delta_ms;
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn load_script(&mut self, path: impl AsRef<Path>) -> Result<ScriptHandle, LoadError> {
        let executable = agni_image::read_file(path).map_err(LoadError::BadExecutable)?;
        self.load_executable(&executable)
    }

    pub fn load_executable(&mut self, executable: &agni_image::Executable) -> Result<ScriptHandle, LoadError> {
        let script = loader::load(executable, &self.host)?;
        let handle = self.registry.insert(script)?;
        info!(handle, "script registered");
        Ok(handle)
    }

    pub fn unload_script(&mut self, handle: ScriptHandle) {
        self.registry.remove(handle);
    }

    pub fn start_script(&mut self, handle: ScriptHandle) {
        if let Some(script) = self.registry.get_mut(handle) {
            script.state.executing = true;
            script.state.thread_activation_ms = self.now_ms;
        }
    }

    pub fn stop_script(&mut self, handle: ScriptHandle) {
        if let Some(script) = self.registry.get_mut(handle) {
            script.state.executing = false;
        }
    }

    pub fn pause_script(&mut self, handle: ScriptHandle, duration_ms: u64) {
        if let Some(script) = self.registry.get_mut(handle) {
            script.state.paused = true;
            script.state.pause_end_ms = self.now_ms + duration_ms;
        }
    }

    pub fn unpause_script(&mut self, handle: ScriptHandle) {
        if let Some(script) = self.registry.get_mut(handle) {
            script.state.paused = false;
        }
    }

    /// Clears the stack, re-pushes the globals frame, and rewinds the
    /// instruction pointer to `Main`'s entry point (if one exists),
    /// per §4.8.
    pub fn reset_script(&mut self, handle: ScriptHandle) {
        if let Some(script) = self.registry.get_mut(handle) {
            let capacity = script.stack.capacity();
            script.stack = crate::stack::Stack::new(capacity);
            for _ in 0..script.global_data_size {
                let _ = script.stack.push(RuntimeValue::Integer(0));
            }
            script.state.paused = false;
            if let Some(main_index) = script.main_index {
                let _ = interpreter::call(script, main_index, true);
            }
        }
    }

    pub fn register_host_function(
        &mut self,
        visible_to: Option<ScriptHandle>,
        name: &str,
        function: HostFunction,
    ) -> Result<(), RegisterError> {
        self.host_functions.register(visible_to, name, function)
    }

    /// `run_scripts(duration_ms)`: drives the scheduler until either
    /// nothing is runnable, the duration has elapsed, or a
    /// single-thread (synchronous) call has unwound (§4.8).
    pub fn run_scripts(&mut self, duration_ms: u64) {
        let slice_start = self.now_ms;
        loop {
            if self.single_thread_exit {
                self.single_thread_exit = false;
                break;
            }
            if duration_ms != INFINITE && self.now_ms > slice_start + duration_ms {
                break;
            }
            match self.tick() {
                TickOutcome::Idle => break,
                TickOutcome::SingleThreadExited => break,
                TickOutcome::Ran(_) => {}
            }
        }
    }

    fn tick(&mut self) -> TickOutcome {
        let now = self.now_ms;
        let handle = match self.scheduler.select(&mut self.registry, now) {
            Some(handle) => handle,
            None => return TickOutcome::Idle,
        };

        if let Some(script) = self.registry.get_mut(handle) {
            if script.state.paused && crate::scheduler::pause_elapsed(now, script.state.pause_end_ms) {
                script.state.paused = false;
            }
        }

        let outcome = {
            let script = match self.registry.get_mut(handle) {
                Some(script) => script,
                None => return TickOutcome::Idle,
            };
            interpreter::step(script, &mut self.rng)
        };

        match outcome {
            Ok(Step::Next) => {
                if let Some(script) = self.registry.get_mut(handle) {
                    script.instruction_pointer += 1;
                }
            }
            Ok(Step::Jumped) => {}
            Ok(Step::Exited) => {
                if let Some(script) = self.registry.get_mut(handle) {
                    script.state.executing = false;
                }
                if self.scheduler.mode == ThreadingMode::Single(handle) {
                    self.scheduler.mode = ThreadingMode::Multiple;
                    return TickOutcome::SingleThreadExited;
                }
            }
            Ok(Step::Unwound) => {
                if self.scheduler.mode == ThreadingMode::Single(handle) {
                    self.scheduler.mode = ThreadingMode::Multiple;
                    self.single_thread_exit = true;
                    return TickOutcome::SingleThreadExited;
                }
                // An asynchronous host-initiated call finished; there is
                // nothing to jump to, but the instruction pointer must
                // still move off the consumed `Ret` before the next tick.
                if let Some(script) = self.registry.get_mut(handle) {
                    script.instruction_pointer += 1;
                }
            }
            Ok(Step::HostCall(name)) => {
                self.dispatch_host_call(handle, &name);
                if let Some(script) = self.registry.get_mut(handle) {
                    script.instruction_pointer += 1;
                }
            }
            Ok(Step::Paused(duration_ms)) => {
                if let Some(script) = self.registry.get_mut(handle) {
                    script.state.paused = true;
                    script.state.pause_end_ms = now + duration_ms;
                    script.instruction_pointer += 1;
                }
            }
            Err(fault) => {
                error!(handle, ?fault, "script thread faulted");
                if let Some(script) = self.registry.get_mut(handle) {
                    script.state.executing = false;
                }
            }
        }

        TickOutcome::Ran(handle)
    }

    fn dispatch_host_call(&mut self, handle: ScriptHandle, name: &str) {
        match self.host_functions.find(handle, name) {
            Some(function) => function(self, handle),
            None => debug!(handle, name, "CallHost targeted an unregistered name; no-op"),
        }
    }

    /// Pushes a host-initiated call (§4.7). `synchronous == false`
    /// performs `CallFunction`: it only pushes the frame, leaving the
    /// scheduler to interleave it with every other runnable thread.
    /// `synchronous == true` performs `CallFunctionSynchronously`: it
    /// pins the VM to this script in single-thread mode and runs until
    /// the call unwinds, so a return value is available immediately
    /// after this call returns.
    pub fn call_function(&mut self, handle: ScriptHandle, function_name: &str, synchronous: bool) -> Result<(), Fault> {
        let function_index = {
            let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
            script
                .functions
                .iter()
                .position(|f| f.name.eq_ignore_ascii_case(function_name))
                .ok_or(Fault::InvalidCoercion)? as u32
        };

        {
            let script = self.registry.get_mut(handle).ok_or(Fault::InvalidCoercion)?;
            // A host-initiated call never resumes a caller instruction on
            // `Ret`, synchronous or not, so it always gets a stack-base
            // marker rather than a normal call frame.
            interpreter::call(script, function_index, true)?;
        }

        if synchronous {
            let previous_mode = self.scheduler.mode;
            let previous_thread = self.scheduler.current_thread;
            self.scheduler.mode = ThreadingMode::Single(handle);
            self.scheduler.current_thread = Some(handle);
            self.run_scripts(INFINITE);
            self.scheduler.mode = previous_mode;
            self.scheduler.current_thread = previous_thread;
        }
        Ok(())
    }

    pub fn pass_integer_parameter(&mut self, handle: ScriptHandle, value: i32) -> Result<(), Fault> {
        self.push_parameter(handle, RuntimeValue::Integer(value))
    }

    pub fn pass_float_parameter(&mut self, handle: ScriptHandle, value: f32) -> Result<(), Fault> {
        self.push_parameter(handle, RuntimeValue::Float(value))
    }

    pub fn pass_string_parameter(&mut self, handle: ScriptHandle, value: impl Into<String>) -> Result<(), Fault> {
        self.push_parameter(handle, RuntimeValue::String(value.into()))
    }

    fn push_parameter(&mut self, handle: ScriptHandle, value: RuntimeValue) -> Result<(), Fault> {
        let script = self.registry.get_mut(handle).ok_or(Fault::InvalidCoercion)?;
        script.stack.push(value)
    }

    pub fn get_parameter_as_integer(&self, handle: ScriptHandle, index: u32) -> Result<i32, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        crate::host::parameter(script, index, RuntimeValue::to_integer)
    }

    pub fn get_parameter_as_float(&self, handle: ScriptHandle, index: u32) -> Result<f32, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        crate::host::parameter(script, index, RuntimeValue::to_float)
    }

    pub fn get_parameter_as_string(&self, handle: ScriptHandle, index: u32) -> Result<String, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        crate::host::parameter(script, index, RuntimeValue::to_text)
    }

    /// Pops `parameter_count` arguments and, if `value` is given,
    /// writes it into the Return register (§4.7).
    pub fn return_from_host(&mut self, handle: ScriptHandle, parameter_count: u32, value: Option<RuntimeValue>) -> Result<(), Fault> {
        let script = self.registry.get_mut(handle).ok_or(Fault::InvalidCoercion)?;
        for _ in 0..parameter_count {
            script.stack.pop()?;
        }
        if let Some(value) = value {
            *script.register_mut(crate::opcode::RegisterId::Return) = value;
        }
        Ok(())
    }

    pub fn get_return_value_as_integer(&self, handle: ScriptHandle) -> Result<i32, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        script.register(crate::opcode::RegisterId::Return).to_integer().map_err(Fault::from)
    }

    pub fn get_return_value_as_float(&self, handle: ScriptHandle) -> Result<f32, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        script.register(crate::opcode::RegisterId::Return).to_float().map_err(Fault::from)
    }

    pub fn get_return_value_as_string(&self, handle: ScriptHandle) -> Result<String, Fault> {
        let script = self.registry.get(handle).ok_or(Fault::InvalidCoercion)?;
        script.register(crate::opcode::RegisterId::Return).to_text().map_err(Fault::from)
    }
}

/// Helper mirroring the reference `GLOBAL_HOST_FUNCTION` sentinel at
/// the public API: pass this instead of `Some(handle)` to
/// [`VirtualMachine::register_host_function`]'s `visible_to` when
/// registering via the raw handle-or-global convention.
pub fn global_host_function() -> u32 {
    GLOBAL_HOST_FUNCTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    fn two_tight_loop_scripts() -> agni_image::Executable {
        use agni_image::{Executable, FunctionEntry, InstructionRecord, MainHeader, Operand};
        let instructions = vec![InstructionRecord {
            opcode: Opcode::Jmp as u16,
            operands: vec![Operand::IndexInstruction(0)],
        }];
        let mut exe = Executable {
            header: MainHeader {
                available_agni_version: (0, 94),
                required_agni_version: (0, 94),
                host_string_index: agni_image::NONE_INDEX,
                host_version: (0, 0),
                checksum: 0,
                stack_size: agni_image::NONE_INDEX,
                global_data_size: 0,
                main_index: 0,
                thread_priority_type: 1,
                thread_priority_user_ms: 0,
            },
            instructions,
            strings: vec![],
            functions: vec![FunctionEntry {
                entry_point: 0,
                parameter_count: 0,
                local_data_size: 0,
                name: "Main".into(),
            }],
            host_functions: vec![],
        };
        let zeroed = agni_image::to_bytes_with_checksum_zeroed(&exe).unwrap();
        exe.header.checksum = agni_image::checksum::compute(&zeroed);
        exe
    }

    fn pausing_then_looping_script() -> agni_image::Executable {
        use agni_image::{Executable, FunctionEntry, InstructionRecord, MainHeader, Operand};
        let instructions = vec![
            InstructionRecord { opcode: Opcode::Pause as u16, operands: vec![Operand::Integer(50)] },
            InstructionRecord { opcode: Opcode::Jmp as u16, operands: vec![Operand::IndexInstruction(1)] },
        ];
        let mut exe = Executable {
            header: MainHeader {
                available_agni_version: (0, 94),
                required_agni_version: (0, 94),
                host_string_index: agni_image::NONE_INDEX,
                host_version: (0, 0),
                checksum: 0,
                stack_size: agni_image::NONE_INDEX,
                global_data_size: 0,
                main_index: 0,
                thread_priority_type: 1,
                thread_priority_user_ms: 0,
            },
            instructions,
            strings: vec![],
            functions: vec![FunctionEntry {
                entry_point: 0,
                parameter_count: 0,
                local_data_size: 0,
                name: "Main".into(),
            }],
            host_functions: vec![],
        };
        let zeroed = agni_image::to_bytes_with_checksum_zeroed(&exe).unwrap();
        exe.header.checksum = agni_image::checksum::compute(&zeroed);
        exe
    }

    #[test]
    fn s6_cooperative_pause_scenario() {
        let mut vm = VirtualMachine::new("TestHost", 1, 0);
        let a = vm.load_executable(&pausing_then_looping_script()).unwrap();
        let b = vm.load_executable(&two_tight_loop_scripts()).unwrap();
        vm.start_script(a);
        vm.start_script(b);

        // First tick runs A's `Pause 50`, putting it to sleep until t=50.
        match vm.tick() {
            TickOutcome::Ran(handle) => assert_eq!(handle, a),
            other => panic!("unexpected tick outcome: {:?}", other),
        }
        assert!(vm.registry.get(a).unwrap().state.paused);

        // Over [0, 50) ms, A is skipped and only B is ever selected.
        for _ in 0..20 {
            match vm.tick() {
                TickOutcome::Ran(handle) => assert_eq!(handle, b),
                other => panic!("unexpected tick outcome: {:?}", other),
            }
        }

        // Once A wakes, each thread now runs for its own uninterrupted
        // 20ms slice before the scheduler switches, so advancing in
        // small steps is needed to see both sides of the handoff
        // rather than a single jump landing mid-slice.
        let (mut saw_a, mut saw_b) = (false, false);
        for _ in 0..100 {
            vm.advance_clock(3);
            if let TickOutcome::Ran(handle) = vm.tick() {
                saw_a |= handle == a;
                saw_b |= handle == b;
            }
        }
        assert!(saw_a && saw_b);
        assert!(!vm.registry.get(a).unwrap().state.paused);
    }

    #[test]
    fn s5_host_callback_scenario() {
        let mut vm = VirtualMachine::new("TestHost", 1, 0);
        let received = StdRc::new(Cell::new((String::new(), 0)));
        let captured = StdRc::clone(&received);
        vm.register_host_function(
            None,
            "Print",
            Rc::new(move |vm: &mut VirtualMachine, handle| {
                // Parameter 0 is the most recently pushed argument (the
                // integer); parameter 1 is the string pushed before it.
                let n = vm.get_parameter_as_integer(handle, 0).unwrap();
                let s = vm.get_parameter_as_string(handle, 1).unwrap();
                captured.set((s, n));
                vm.return_from_host(handle, 2, None).unwrap();
            }),
        )
        .unwrap();

        let exe = two_tight_loop_scripts();
        let handle = vm.load_executable(&exe).unwrap();
        vm.pass_string_parameter(handle, "hi").unwrap();
        vm.pass_integer_parameter(handle, 3).unwrap();
        let script = vm.registry.get(handle).unwrap();
        let top_before = script.stack.top_index();
        vm.dispatch_host_call(handle, "Print");
        assert_eq!(received.take(), ("hi".to_string(), 3));
        let script = vm.registry.get(handle).unwrap();
        assert_eq!(script.stack.top_index(), top_before - 2);
    }
}
