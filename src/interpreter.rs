//! Opcode dispatch: executes exactly one instruction against a
//! script's registers and stack (§4.1, §4.6).

use crate::error::Fault;
use crate::opcode::Opcode;
use crate::rand::Lcg;
use crate::script::Script;
use crate::value::RuntimeValue;

/// Where an operand ultimately lives, once register/stack-index
/// indirection has been resolved. Literal operands have no mutable
/// location; writing through one is an internal error the assembler
/// is responsible for never emitting (§4.1).
enum Location {
    Register(crate::opcode::RegisterId),
    Stack(usize),
    ReadOnly(RuntimeValue),
}

fn resolve(script: &mut Script, operand: &RuntimeValue) -> Result<Location, Fault> {
    Ok(match operand {
        RuntimeValue::Register(id) => Location::Register(*id),
        RuntimeValue::StackIndexAbsolute(index) => {
            Location::Stack(script.stack.resolve_absolute(*index))
        }
        RuntimeValue::StackIndexRelative(rel) => {
            Location::Stack(script.stack.resolve_relative(*rel)?)
        }
        literal => Location::ReadOnly(literal.clone()),
    })
}

fn read(script: &Script, location: &Location) -> Result<RuntimeValue, Fault> {
    Ok(match location {
        Location::Register(id) => script.register(*id).clone(),
        Location::Stack(index) => script
            .stack
            .get(*index)
            .cloned()
            .ok_or(Fault::StackUnderflow)?,
        Location::ReadOnly(value) => value.clone(),
    })
}

fn write(script: &mut Script, location: &Location, value: RuntimeValue) -> Result<(), Fault> {
    match location {
        Location::Register(id) => {
            *script.register_mut(*id) = value;
        }
        Location::Stack(index) => {
            *script.stack.get_mut(*index).ok_or(Fault::StackUnderflow)? = value;
        }
        Location::ReadOnly(_) => return Err(Fault::InvalidCoercion),
    }
    Ok(())
}

/// What the caller (scheduler) should do with the instruction pointer
/// after one instruction has executed.
pub enum Step {
    /// Advance the instruction pointer by one (the common case).
    Next,
    /// The instruction itself set a new instruction pointer (`Jmp`, a
    /// taken conditional jump, `Call`, or the resumption point of
    /// `Ret`); do not also advance it.
    Jumped,
    /// `Ret` popped a stack-base marker: the interpreter loop waiting
    /// on this call (or, at top level, the script itself) should
    /// stop.
    Unwound,
    /// `Exit` was reached.
    Exited,
    /// `Pause duration_ms` ran; the scheduler must suspend this
    /// thread for the given duration before it runs again.
    Paused(u64),
    /// `CallHost` targeted a function; the host must run it before
    /// execution can continue (parameters are already on the stack).
    HostCall(String),
}

/// Sentinel `caller_frame_top` meaning "no caller instruction to
/// resume" — a host-initiated call, synchronous or not, still needs
/// its own frame for locals/params bookkeeping but has nothing to jump
/// back to on `Ret` (§4.1/§4.5).
const NO_CALLER: u32 = u32::MAX;

/// Looks up the function whose frame begins at `marker_function_index`
/// and restores the caller on `Ret`. Exposed so [`crate::scheduler`]
/// can drive `Call`/`Ret` without duplicating the frame arithmetic.
///
/// Stack order for the new frame, bottom to top: the parameters
/// (already pushed by the caller), the return address, the locals
/// (zero-initialized here), then the frame marker itself. Locals sit
/// below the marker so they resolve with the same negative,
/// frame-relative addressing as parameters (§4.1/§4.5).
pub fn call(script: &mut Script, function_index: u32, as_synchronous_entry: bool) -> Result<(), Fault> {
    let function = script
        .functions
        .get(function_index as usize)
        .cloned()
        .ok_or(Fault::InvalidCoercion)?;

    script
        .stack
        .push(RuntimeValue::InstructionIndex(script.instruction_pointer + 1))?;

    for _ in 0..function.local_data_size {
        script.stack.push(RuntimeValue::Integer(0))?;
    }

    let caller_frame_top = if as_synchronous_entry {
        NO_CALLER
    } else {
        script.stack.current_frame_top_index() as u32
    };
    script
        .stack
        .push(RuntimeValue::CallFrameMarker { function_index, caller_frame_top })?;
    let new_frame_top = script.stack.top_index() - 1;

    script.stack.set_current_frame_top_index(new_frame_top);
    script.instruction_pointer = function.entry_point;
    Ok(())
}

fn do_ret(script: &mut Script) -> Result<Step, Fault> {
    let frame_top = script.stack.current_frame_top_index();
    // Discard any temporaries pushed above the marker during execution.
    while script.stack.top_index() > frame_top + 1 {
        script.stack.pop()?;
    }
    let marker = script.stack.pop()?;
    match marker {
        RuntimeValue::CallFrameMarker { function_index, caller_frame_top } => {
            let function = script
                .functions
                .get(function_index as usize)
                .cloned()
                .ok_or(Fault::InvalidCoercion)?;
            for _ in 0..function.local_data_size {
                script.stack.pop()?;
            }
            let return_address = script.stack.pop()?.to_integer().map_err(Fault::from)? as u32;
            for _ in 0..function.parameter_count {
                script.stack.pop()?;
            }
            if caller_frame_top == NO_CALLER {
                Ok(Step::Unwound)
            } else {
                script.stack.set_current_frame_top_index(caller_frame_top as usize);
                script.instruction_pointer = return_address;
                Ok(Step::Jumped)
            }
        }
        // Never emitted by `call` anymore, but decoded executables
        // could in principle carry one; treat it the same as an
        // already-unwound host frame.
        RuntimeValue::StackBaseMarker => Ok(Step::Unwound),
        _ => Err(Fault::InvalidCoercion),
    }
}

fn string_compare(a: &str, b: &str) -> std::cmp::Ordering {
    a.cmp(b)
}

fn values_equal(a: &RuntimeValue, b: &RuntimeValue) -> Result<bool, Fault> {
    Ok(match (a, b) {
        (RuntimeValue::String(x), RuntimeValue::String(y)) => x == y,
        _ => {
            let af = a.to_float().map_err(Fault::from)?;
            let bf = b.to_float().map_err(Fault::from)?;
            af == bf
        }
    })
}

fn values_order(a: &RuntimeValue, b: &RuntimeValue) -> Result<std::cmp::Ordering, Fault> {
    Ok(match (a, b) {
        (RuntimeValue::String(x), RuntimeValue::String(y)) => string_compare(x, y),
        _ => {
            let af = a.to_float().map_err(Fault::from)?;
            let bf = b.to_float().map_err(Fault::from)?;
            af.partial_cmp(&bf).ok_or(Fault::InvalidCoercion)?
        }
    })
}

/// Executes the instruction currently addressed by
/// `script.instruction_pointer`, mutating `script` in place.
pub fn step(script: &mut Script, rng: &mut Lcg) -> Result<Step, Fault> {
    let instruction = script
        .instructions
        .get(script.instruction_pointer)
        .cloned()
        .ok_or(Fault::InvalidCoercion)?;
    let operands = instruction.operands;

    macro_rules! loc {
        ($i:expr) => {
            resolve(script, &operands[$i])?
        };
    }

    use std::cmp::Ordering;
    use Opcode::*;

    Ok(match instruction.opcode {
        Mov => {
            let src = read(script, &loc!(1))?;
            write(script, &loc!(0), src)?;
            Step::Next
        }
        Add | Sub | Mul | Div | Exp => {
            let dst_loc = loc!(0);
            let dst = read(script, &dst_loc)?;
            let src = read(script, &loc!(1))?;
            let result = arithmetic(instruction.opcode, &dst, &src)?;
            write(script, &dst_loc, result)?;
            Step::Next
        }
        Mod => {
            let dst_loc = loc!(0);
            let dst = read(script, &dst_loc)?.to_integer().map_err(Fault::from)?;
            let src = read(script, &loc!(1))?.to_integer().map_err(Fault::from)?;
            if src == 0 {
                return Err(Fault::InvalidCoercion);
            }
            write(script, &dst_loc, RuntimeValue::Integer(dst % src))?;
            Step::Next
        }
        Neg => {
            let dst_loc = loc!(0);
            let result = match read(script, &dst_loc)? {
                RuntimeValue::Integer(i) => RuntimeValue::Integer(i.wrapping_neg()),
                RuntimeValue::Float(f) => RuntimeValue::Float(-f),
                _ => return Err(Fault::InvalidCoercion),
            };
            write(script, &dst_loc, result)?;
            Step::Next
        }
        Inc | Dec => {
            let dst_loc = loc!(0);
            let delta = if matches!(instruction.opcode, Inc) { 1 } else { -1 };
            let result = match read(script, &dst_loc)? {
                RuntimeValue::Integer(i) => RuntimeValue::Integer(i.wrapping_add(delta)),
                RuntimeValue::Float(f) => RuntimeValue::Float(f + delta as f32),
                _ => return Err(Fault::InvalidCoercion),
            };
            write(script, &dst_loc, result)?;
            Step::Next
        }
        And | Or | Xor | Shl | Shr => {
            let dst_loc = loc!(0);
            let dst = read(script, &dst_loc)?.to_integer().map_err(Fault::from)?;
            let src = read(script, &loc!(1))?.to_integer().map_err(Fault::from)?;
            let result = match instruction.opcode {
                And => dst & src,
                Or => dst | src,
                Xor => dst ^ src,
                Shl => ((dst as u32) << (src as u32 & 31)) as i32,
                Shr => ((dst as u32) >> (src as u32 & 31)) as i32,
                _ => unreachable!(),
            };
            write(script, &dst_loc, RuntimeValue::Integer(result))?;
            Step::Next
        }
        Not => {
            let dst_loc = loc!(0);
            let dst = read(script, &dst_loc)?.to_integer().map_err(Fault::from)?;
            write(script, &dst_loc, RuntimeValue::Integer(!dst))?;
            Step::Next
        }
        Concat => {
            let dst_loc = loc!(0);
            let mut text = match read(script, &dst_loc)? {
                RuntimeValue::String(s) => s,
                _ => return Err(Fault::InvalidCoercion),
            };
            let appended = read(script, &loc!(1))?.to_text().map_err(Fault::from)?;
            text.push_str(&appended);
            write(script, &dst_loc, RuntimeValue::String(text))?;
            Step::Next
        }
        GetChar => {
            let dst_loc = loc!(0);
            let src = match read(script, &loc!(1))? {
                RuntimeValue::String(s) => s,
                _ => return Err(Fault::InvalidCoercion),
            };
            let index = read(script, &loc!(2))?.to_integer().map_err(Fault::from)? as usize;
            let ch = src.as_bytes().get(index).ok_or(Fault::InvalidCoercion)?;
            write(script, &dst_loc, RuntimeValue::String((*ch as char).to_string()))?;
            Step::Next
        }
        SetChar => {
            let dst_loc = loc!(0);
            let index = read(script, &loc!(1))?.to_integer().map_err(Fault::from)? as usize;
            let replacement = read(script, &loc!(2))?.to_text().map_err(Fault::from)?;
            let byte = replacement.as_bytes().first().copied().ok_or(Fault::InvalidCoercion)?;
            let mut text = match read(script, &dst_loc)? {
                RuntimeValue::String(s) => s,
                _ => return Err(Fault::InvalidCoercion),
            };
            let mut bytes = text.into_bytes();
            *bytes.get_mut(index).ok_or(Fault::InvalidCoercion)? = byte;
            text = String::from_utf8(bytes).map_err(|_| Fault::InvalidCoercion)?;
            write(script, &dst_loc, RuntimeValue::String(text))?;
            Step::Next
        }
        Jmp => {
            let target = read(script, &loc!(0))?;
            jump_to(script, target)?;
            Step::Jumped
        }
        Je | Jne | Jg | Jl | Jge | Jle => {
            let a = read(script, &loc!(0))?;
            let b = read(script, &loc!(1))?;
            let taken = match instruction.opcode {
                Je => values_equal(&a, &b)?,
                Jne => !values_equal(&a, &b)?,
                Jg => values_order(&a, &b)? == Ordering::Greater,
                Jl => values_order(&a, &b)? == Ordering::Less,
                Jge => values_order(&a, &b)? != Ordering::Less,
                Jle => values_order(&a, &b)? != Ordering::Greater,
                _ => unreachable!(),
            };
            if taken {
                let target = read(script, &loc!(2))?;
                jump_to(script, target)?;
                Step::Jumped
            } else {
                Step::Next
            }
        }
        Push => {
            let value = read(script, &loc!(0))?;
            script.stack.push(value)?;
            Step::Next
        }
        Pop => {
            let dst_loc = loc!(0);
            let value = script.stack.pop()?;
            write(script, &dst_loc, value)?;
            Step::Next
        }
        Call => {
            let target = read(script, &loc!(0))?;
            let function_index = match target {
                RuntimeValue::FunctionIndex(i) => i,
                other => other.to_integer().map_err(Fault::from)? as u32,
            };
            call(script, function_index, false)?;
            Step::Jumped
        }
        Ret => do_ret(script)?,
        CallHost => {
            let target = read(script, &loc!(0))?;
            let name = match target {
                RuntimeValue::HostFunctionIndex(i) => script
                    .host_function_names
                    .get(i as usize)
                    .map(|h| h.name.clone())
                    .ok_or(Fault::InvalidCoercion)?,
                RuntimeValue::String(s) => s,
                _ => return Err(Fault::InvalidCoercion),
            };
            Step::HostCall(name)
        }
        Rand => {
            let dst_loc = loc!(0);
            let range = read(script, &loc!(1))?.to_integer().map_err(Fault::from)?;
            let value = rng.next_in_range(range);
            write(script, &dst_loc, RuntimeValue::Integer(value))?;
            Step::Next
        }
        Pause => {
            // The scheduler owns wall-clock time, so it turns this
            // into `state.paused`/`pause_end_ms`; we only read the
            // requested duration off the operand.
            let duration_ms = read(script, &loc!(0))?.to_integer().map_err(Fault::from)?.max(0) as u64;
            Step::Paused(duration_ms)
        }
        Exit => Step::Exited,
    })
}

fn jump_to(script: &mut Script, target: RuntimeValue) -> Result<(), Fault> {
    let index = match target {
        RuntimeValue::InstructionIndex(i) => i,
        other => other.to_integer().map_err(Fault::from)? as u32,
    };
    script.instruction_pointer = index;
    Ok(())
}

fn arithmetic(opcode: Opcode, dst: &RuntimeValue, src: &RuntimeValue) -> Result<RuntimeValue, Fault> {
    use Opcode::*;
    // Dispatches on the *source*'s type, writing into the
    // destination's matching representation (§4.6).
    if src.is_float() {
        let a = dst.to_float().map_err(Fault::from)?;
        let b = src.to_float().map_err(Fault::from)?;
        let result = match opcode {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => a / b,
            Exp => a.powf(b),
            _ => unreachable!(),
        };
        Ok(RuntimeValue::Float(result))
    } else {
        let a = dst.to_integer().map_err(Fault::from)?;
        let b = src.to_integer().map_err(Fault::from)?;
        let result = match opcode {
            Add => a.wrapping_add(b),
            Sub => a.wrapping_sub(b),
            Mul => a.wrapping_mul(b),
            Div => {
                if b == 0 {
                    return Err(Fault::InvalidCoercion);
                }
                a.wrapping_div(b)
            }
            Exp => (a as f64).powi(b) as i32,
            _ => unreachable!(),
        };
        Ok(RuntimeValue::Integer(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, InstructionStream};
    use crate::opcode::RegisterId;
    use crate::script::{FunctionDescriptor, ScriptState, TimeSlice};
    use crate::stack::Stack;

    fn script_with(instructions: Vec<Instruction>) -> Script {
        Script {
            instructions: InstructionStream::new(instructions),
            functions: vec![FunctionDescriptor {
                name: "Twice".into(),
                entry_point: 0,
                parameter_count: 1,
                local_data_size: 0,
            }],
            host_function_names: vec![],
            main_index: Some(0),
            time_slice: TimeSlice { priority: crate::opcode::ThreadPriority::Low, milliseconds: 20 },
            global_data_size: 0,
            stack: Stack::new(64),
            registers: [RuntimeValue::Null, RuntimeValue::Null, RuntimeValue::Null],
            instruction_pointer: 0,
            state: ScriptState { loaded: true, executing: true, ..Default::default() },
        }
    }

    #[test]
    fn s1_arithmetic_scenario() {
        let mut script = script_with(vec![
            Instruction::new(
                Opcode::Mov,
                vec![RuntimeValue::Register(RegisterId::T0), RuntimeValue::Integer(3)],
            ),
            Instruction::new(
                Opcode::Add,
                vec![RuntimeValue::Register(RegisterId::T0), RuntimeValue::Integer(4)],
            ),
            Instruction::new(Opcode::Exit, vec![]),
        ]);
        let mut rng = Lcg::seeded(1);
        loop {
            match step(&mut script, &mut rng).unwrap() {
                Step::Next => script.instruction_pointer += 1,
                Step::Exited => break,
                _ => panic!("unexpected step"),
            }
        }
        assert_eq!(script.register(RegisterId::T0).to_integer().unwrap(), 7);
    }

    #[test]
    fn s2_string_concat_scenario() {
        let mut script = script_with(vec![
            Instruction::new(
                Opcode::Mov,
                vec![RuntimeValue::Register(RegisterId::T0), RuntimeValue::String("foo".into())],
            ),
            Instruction::new(
                Opcode::Concat,
                vec![RuntimeValue::Register(RegisterId::T0), RuntimeValue::String("bar".into())],
            ),
        ]);
        let mut rng = Lcg::seeded(1);
        step(&mut script, &mut rng).unwrap();
        script.instruction_pointer += 1;
        step(&mut script, &mut rng).unwrap();
        assert_eq!(
            script.register(RegisterId::T0).clone(),
            RuntimeValue::String("foobar".into())
        );
    }

    #[test]
    fn s3_conditional_jump_scenario() {
        // Jl 3, 4, L(=3) ; Push 0 ; Jmp E(=5) ; L: Push 1 ; E: Pop T0
        let mut script = script_with(vec![
            Instruction::new(
                Opcode::Jl,
                vec![RuntimeValue::Integer(3), RuntimeValue::Integer(4), RuntimeValue::InstructionIndex(3)],
            ),
            Instruction::new(Opcode::Push, vec![RuntimeValue::Integer(0)]),
            Instruction::new(Opcode::Jmp, vec![RuntimeValue::InstructionIndex(4)]),
            Instruction::new(Opcode::Push, vec![RuntimeValue::Integer(1)]),
            Instruction::new(Opcode::Pop, vec![RuntimeValue::Register(RegisterId::T0)]),
        ]);
        let mut rng = Lcg::seeded(1);
        loop {
            match step(&mut script, &mut rng).unwrap() {
                Step::Next => script.instruction_pointer += 1,
                Step::Jumped => {}
                _ => break,
            }
            if script.instruction_pointer as usize >= script.instructions.len() {
                break;
            }
        }
        assert_eq!(script.register(RegisterId::T0).to_integer().unwrap(), 1);
    }

    #[test]
    fn s4_call_ret_scenario() {
        // Main: Push 21 ; Call Twice ; Mov T0, Return ; Exit
        // Twice(x): Mul x, 2 ; Mov Return, x ; Ret
        let mut script = Script {
            instructions: InstructionStream::new(vec![
                Instruction::new(Opcode::Push, vec![RuntimeValue::Integer(21)]),
                Instruction::new(Opcode::Call, vec![RuntimeValue::FunctionIndex(1)]),
                Instruction::new(
                    Opcode::Mov,
                    vec![RuntimeValue::Register(RegisterId::T0), RuntimeValue::Register(RegisterId::Return)],
                ),
                Instruction::new(Opcode::Exit, vec![]),
                // Twice's sole parameter sits at slot -2 (§4.1/§4.5: order 0,
                // param_count 1, local_size 0 => 0 - 1 - 0 - 1).
                Instruction::new(Opcode::Mul, vec![RuntimeValue::StackIndexAbsolute(-2), RuntimeValue::Integer(2)]),
                Instruction::new(
                    Opcode::Mov,
                    vec![RuntimeValue::Register(RegisterId::Return), RuntimeValue::StackIndexAbsolute(-2)],
                ),
                Instruction::new(Opcode::Ret, vec![]),
            ]),
            functions: vec![
                FunctionDescriptor { name: "Main".into(), entry_point: 0, parameter_count: 0, local_data_size: 0 },
                FunctionDescriptor { name: "Twice".into(), entry_point: 4, parameter_count: 1, local_data_size: 0 },
            ],
            host_function_names: vec![],
            main_index: Some(0),
            time_slice: TimeSlice { priority: crate::opcode::ThreadPriority::Low, milliseconds: 20 },
            global_data_size: 0,
            stack: Stack::new(64),
            registers: [RuntimeValue::Null, RuntimeValue::Null, RuntimeValue::Null],
            instruction_pointer: 0,
            state: ScriptState { loaded: true, executing: true, ..Default::default() },
        };
        call(&mut script, 0, true).unwrap();
        let top_before_push = script.stack.top_index();

        let mut rng = Lcg::seeded(1);
        loop {
            match step(&mut script, &mut rng).unwrap() {
                Step::Next => script.instruction_pointer += 1,
                Step::Jumped => {}
                Step::Exited => break,
                other => panic!("unexpected step: {:?}", other),
            }
        }
        assert_eq!(script.register(RegisterId::T0).to_integer().unwrap(), 42);
        assert_eq!(script.stack.top_index(), top_before_push);
    }
}
