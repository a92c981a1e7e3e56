//! Turns a decoded [`agni_image::Executable`] into a runnable
//! [`Script`] (§4.4).

use agni_image::{to_bytes_with_checksum_zeroed, Executable, Operand, DEFAULT_STACK_SIZE, NONE_INDEX};
use tracing::{info, warn};

use crate::error::LoadError;
use crate::instruction::{Instruction, InstructionStream};
use crate::opcode::{RegisterId, ThreadPriority};
use crate::script::{FunctionDescriptor, HostFunctionName, Script, ScriptState, TimeSlice};
use crate::stack::Stack;
use crate::value::{RelativeStackIndex, RuntimeValue};
use num_traits::FromPrimitive;

/// Identity the VM presents to executables that declare a required
/// host (§4.4).
#[derive(Clone, Debug)]
pub struct HostIdentity {
    pub name: String,
    pub version: (u8, u8),
}

/// Agni runtime version this VM implements; compared against an
/// executable's `required_agni_version` field.
pub const AGNI_VERSION: (u8, u8) = (0, 94);

fn time_slice_for(priority_byte: u8, user_ms: u32) -> Result<TimeSlice, LoadError> {
    let priority: ThreadPriority =
        FromPrimitive::from_u8(priority_byte).ok_or(LoadError::BadExecutable(
            agni_image::ImageError::BadSignature,
        ))?;
    let milliseconds = match priority {
        ThreadPriority::Low => 20,
        ThreadPriority::Medium => 40,
        ThreadPriority::High => 80,
        ThreadPriority::User => user_ms,
    };
    Ok(TimeSlice { priority, milliseconds })
}

fn operand_to_runtime_value(operand: &Operand) -> RuntimeValue {
    match operand {
        Operand::Null => RuntimeValue::Null,
        Operand::Integer(v) => RuntimeValue::Integer(*v),
        Operand::Float(v) => RuntimeValue::Float(*v),
        // Rewritten to an inline owned string below, once the string
        // table is available; placeholder only reached for operands
        // this assembler never emits.
        Operand::IndexString(v) => RuntimeValue::Integer(*v),
        Operand::IndexStackAbsolute(v) => RuntimeValue::StackIndexAbsolute(*v),
        Operand::IndexStackRelative(base, offset) => {
            RuntimeValue::StackIndexRelative(RelativeStackIndex {
                base: *base,
                offset_slot: *offset,
            })
        }
        Operand::IndexInstruction(v) => RuntimeValue::InstructionIndex(*v as u32),
        Operand::IndexFunction(v) => RuntimeValue::FunctionIndex(*v as u32),
        Operand::IndexFunctionHost(v) => RuntimeValue::HostFunctionIndex(*v as u32),
        Operand::Register(r) => {
            RuntimeValue::Register(FromPrimitive::from_u8(*r).unwrap_or(RegisterId::T0))
        }
        Operand::StackBaseMarker => RuntimeValue::StackBaseMarker,
    }
}

/// Validates and materializes `executable` into a [`Script`]. See
/// §4.4 for the exact validation order; on any failure nothing is
/// left allocated (the caller receives only an error).
pub fn load(executable: &Executable, host: &HostIdentity) -> Result<Script, LoadError> {
    let header = &executable.header;

    if header.available_agni_version < header.required_agni_version {
        warn!("executable requires a newer Agni runtime than this one provides");
        return Err(LoadError::OldAgniRuntime);
    }

    if header.host_string_index != NONE_INDEX {
        let declared_host = executable
            .strings
            .get(header.host_string_index as usize)
            .ok_or(LoadError::BadExecutable(agni_image::ImageError::BadSignature))?;
        if !declared_host.eq_ignore_ascii_case(&host.name) {
            warn!(declared = %declared_host, configured = %host.name, "host name mismatch");
            return Err(LoadError::WrongHost);
        }
        if host.version < header.host_version {
            warn!("executable requires a newer host version than this host provides");
            return Err(LoadError::OldHost);
        }
    }

    let recomputed = {
        let zeroed = to_bytes_with_checksum_zeroed(executable)
            .map_err(LoadError::BadExecutable)?;
        agni_image::checksum::compute(&zeroed)
    };
    if recomputed != header.checksum {
        warn!("checksum mismatch");
        return Err(LoadError::BadChecksum);
    }

    let stack_size = if header.stack_size == NONE_INDEX {
        DEFAULT_STACK_SIZE
    } else {
        header.stack_size
    };
    let time_slice = time_slice_for(header.thread_priority_type, header.thread_priority_user_ms)?;

    let instructions = executable
        .instructions
        .iter()
        .map(|record| {
            let opcode = num_traits::FromPrimitive::from_u16(record.opcode)
                .ok_or(LoadError::BadExecutable(agni_image::ImageError::BadSignature))?;
            let operands = record
                .operands
                .iter()
                .map(|operand| {
                    // Rewrite string-index operands into inline owned
                    // strings, per §4.4, so the interpreter never
                    // needs the string table at dispatch time.
                    if matches!(operand, Operand::IndexString(_)) {
                        if let Operand::IndexString(index) = operand {
                            let text = executable
                                .strings
                                .get(*index as usize)
                                .cloned()
                                .unwrap_or_default();
                            return Ok(RuntimeValue::String(text));
                        }
                    }
                    Ok(operand_to_runtime_value(operand))
                })
                .collect::<Result<Vec<_>, LoadError>>()?;
            Ok(Instruction::new(opcode, operands))
        })
        .collect::<Result<Vec<_>, LoadError>>()?;

    let functions = executable
        .functions
        .iter()
        .map(|f| FunctionDescriptor {
            name: f.name.clone(),
            entry_point: f.entry_point,
            parameter_count: f.parameter_count,
            local_data_size: f.local_data_size,
        })
        .collect();

    let host_function_names = executable
        .host_functions
        .iter()
        .map(|h| HostFunctionName { name: h.name.clone() })
        .collect();

    let main_index = if header.main_index == NONE_INDEX {
        None
    } else {
        Some(header.main_index)
    };

    // Global data occupies the bottom of the stack, ascending from
    // index zero; reserve it up front so user code's first absolute
    // index lands past it.
    let mut stack = Stack::new(stack_size as usize);
    for _ in 0..header.global_data_size {
        stack.push(RuntimeValue::Integer(0)).map_err(|_| {
            LoadError::BadExecutable(agni_image::ImageError::BadSignature)
        })?;
    }

    info!(functions = functions.len(), instructions = instructions.len(), "script loaded");

    let mut script = Script {
        instructions: InstructionStream::new(instructions),
        functions,
        host_function_names,
        main_index,
        time_slice,
        global_data_size: header.global_data_size,
        stack,
        registers: [RuntimeValue::Null, RuntimeValue::Null, RuntimeValue::Null],
        instruction_pointer: 0,
        state: ScriptState {
            loaded: true,
            executing: false,
            paused: false,
            pause_end_ms: 0,
            thread_activation_ms: 0,
        },
    };
    if let Some(main_index) = script.main_index {
        // `Main` is entered the same way any host-initiated call is
        // (§4.1): it needs its own locals frame, just with nothing to
        // resume on `Ret`.
        crate::interpreter::call(&mut script, main_index, true)
            .map_err(|_| LoadError::BadExecutable(agni_image::ImageError::BadSignature))?;
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agni_image::{Executable, FunctionEntry, InstructionRecord, MainHeader};

    fn host() -> HostIdentity {
        HostIdentity { name: "TestHost".into(), version: (1, 0) }
    }

    fn minimal_executable() -> Executable {
        let mut exe = Executable {
            header: MainHeader {
                available_agni_version: (0, 94),
                required_agni_version: (0, 94),
                host_string_index: NONE_INDEX,
                host_version: (0, 0),
                checksum: 0,
                stack_size: NONE_INDEX,
                global_data_size: 0,
                main_index: 0,
                thread_priority_type: 1,
                thread_priority_user_ms: 0,
            },
            instructions: vec![InstructionRecord { opcode: 34, operands: vec![] }],
            strings: vec![],
            functions: vec![FunctionEntry {
                entry_point: 0,
                parameter_count: 0,
                local_data_size: 0,
                name: "Main".into(),
            }],
            host_functions: vec![],
        };
        let zeroed = to_bytes_with_checksum_zeroed(&exe).unwrap();
        exe.header.checksum = agni_image::checksum::compute(&zeroed);
        exe
    }

    #[test]
    fn loads_a_well_formed_executable() {
        let exe = minimal_executable();
        let script = load(&exe, &host()).unwrap();
        assert!(script.state.loaded);
        assert_eq!(script.instructions.len(), 1);
        assert_eq!(script.stack.capacity(), DEFAULT_STACK_SIZE as usize);
    }

    #[test]
    fn rejects_tampered_checksum() {
        let mut exe = minimal_executable();
        exe.header.global_data_size = 1;
        let err = load(&exe, &host()).unwrap_err();
        assert!(matches!(err, LoadError::BadChecksum));
    }
}
