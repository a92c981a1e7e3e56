//! The loaded-script record (§3) and its function/host-function
//! tables.

use crate::instruction::InstructionStream;
use crate::opcode::{RegisterId, ThreadPriority};
use crate::stack::Stack;
use crate::value::RuntimeValue;

/// Name, entry point, and frame geometry of one function, as recorded
/// by the assembler and consumed by `Call`/`Ret` (§4.5).
#[derive(Clone, Debug)]
pub struct FunctionDescriptor {
    pub name: String,
    pub entry_point: u32,
    pub parameter_count: u8,
    pub local_data_size: u32,
}

/// A name the script may invoke with `CallHost`; interned at assemble
/// time, resolved against the process-wide registry at call time.
#[derive(Clone, Debug)]
pub struct HostFunctionName {
    pub name: String,
}

/// The thread-priority kind and its resolved time slice (§4.4). A
/// `None` slice means "never preempt" (`Infinite`, reserved for the
/// host's `run_scripts` duration rather than a stored priority).
#[derive(Clone, Copy, Debug)]
pub struct TimeSlice {
    pub priority: ThreadPriority,
    pub milliseconds: u32,
}

/// Scheduling status of one loaded script.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptState {
    pub loaded: bool,
    pub executing: bool,
    pub paused: bool,
    pub pause_end_ms: u64,
    pub thread_activation_ms: u64,
}

/// A fully loaded program instance: everything a scheduler tick and
/// the interpreter need to run one more instruction.
pub struct Script {
    pub instructions: InstructionStream,
    pub functions: Vec<FunctionDescriptor>,
    pub host_function_names: Vec<HostFunctionName>,
    pub main_index: Option<u32>,
    pub time_slice: TimeSlice,
    /// Number of stack slots reserved for globals at the bottom of
    /// `stack`; `reset_script` needs this to re-reserve them after
    /// clearing the stack (§4.8).
    pub global_data_size: u32,
    pub stack: Stack,
    pub registers: [RuntimeValue; 3],
    pub instruction_pointer: u32,
    pub state: ScriptState,
}

impl Script {
    pub fn register(&self, id: RegisterId) -> &RuntimeValue {
        &self.registers[register_slot(id)]
    }

    pub fn register_mut(&mut self, id: RegisterId) -> &mut RuntimeValue {
        &mut self.registers[register_slot(id)]
    }
}

fn register_slot(id: RegisterId) -> usize {
    match id {
        RegisterId::T0 => 0,
        RegisterId::T1 => 1,
        RegisterId::Return => 2,
    }
}
