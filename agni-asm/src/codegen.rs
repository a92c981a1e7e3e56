//! Pass 2 (§4.3): resolves every pending instruction's raw operand
//! tokens against the symbol table built by pass 1, interns string and
//! host-function-name literals, and assembles a complete executable
//! with its checksum patched in.

use std::collections::HashMap;

use agni_image::{Executable, FunctionEntry, HostFunctionEntry, InstructionRecord, MainHeader, Operand, NONE_INDEX};
use agni_vm::loader::AGNI_VERSION;
use agni_vm::opcode::{Opcode, RegisterId};
use num_traits::ToPrimitive;

use crate::error::AssembleError;
use crate::lexer::{Token, TokenKind};
use crate::symbols::{FunctionSymbol, PendingInstruction, SymbolTable};

#[derive(Default)]
struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

#[derive(Default)]
struct HostFunctionTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl HostFunctionTable {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }
}

/// Walks `instr.operands` one logical operand at a time: a bare
/// token, or an identifier followed by a bracketed index.
struct OperandCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: u32,
}

impl<'a> OperandCursor<'a> {
    fn new(tokens: &'a [Token], line: u32) -> OperandCursor<'a> {
        OperandCursor { tokens, pos: 0, line }
    }

    fn done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next_token(&mut self) -> Result<Token, AssembleError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| AssembleError::new(self.line, "expected another operand, found end of line"))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek_open_bracket(&self) -> bool {
        matches!(self.tokens.get(self.pos).map(|t| &t.kind), Some(TokenKind::OpenBracket))
    }

    fn expect_close_bracket(&mut self) -> Result<(), AssembleError> {
        match self.next_token()?.kind {
            TokenKind::CloseBracket => Ok(()),
            other => Err(AssembleError::new(self.line, format!("expected ']', found {:?}", other))),
        }
    }
}

fn register_tag(id: RegisterId) -> u8 {
    id.to_u8().expect("RegisterId always has a numeric encoding")
}

/// Looks up `name` as a local (including a parameter) first, falling
/// back to a global; locals shadow globals with the same name.
fn lookup_variable<'a>(
    function: &'a FunctionSymbol,
    table: &'a SymbolTable,
    name: &str,
    line: u32,
) -> Result<(i32, u32), AssembleError> {
    if let Some(local) = function.locals.get(name) {
        return Ok((local.slot, local.size));
    }
    if let Some(global) = table.globals.get(name) {
        return Ok((global.index as i32, global.size));
    }
    Err(AssembleError::new(line, format!("undefined variable '{}'", name)))
}

fn resolve_variable(
    cursor: &mut OperandCursor,
    function: &FunctionSymbol,
    table: &SymbolTable,
    name: &str,
    line: u32,
) -> Result<Operand, AssembleError> {
    let (base_slot, size) = lookup_variable(function, table, name, line)?;
    if cursor.peek_open_bracket() {
        cursor.next_token()?;
        let index_token = cursor.next_token()?;
        let operand = match index_token.kind {
            TokenKind::Integer(i) => {
                if i < 0 || i as u32 >= size {
                    return Err(AssembleError::new(line, format!("index {} out of range for '{}'", i, name)));
                }
                Operand::IndexStackAbsolute(base_slot + i)
            }
            TokenKind::Identifier(ref index_name) => {
                let (offset_slot, offset_size) = lookup_variable(function, table, index_name, line)?;
                if offset_size != 1 {
                    return Err(AssembleError::new(
                        line,
                        format!("'{}' is an array and cannot be used as an index", index_name),
                    ));
                }
                Operand::IndexStackRelative(base_slot, offset_slot)
            }
            other => return Err(AssembleError::new(line, format!("expected an index, found {:?}", other))),
        };
        cursor.expect_close_bracket()?;
        Ok(operand)
    } else {
        if size != 1 {
            return Err(AssembleError::new(line, format!("'{}' is an array and must be indexed", name)));
        }
        Ok(Operand::IndexStackAbsolute(base_slot))
    }
}

fn resolve_value_operand(
    cursor: &mut OperandCursor,
    function: &FunctionSymbol,
    table: &SymbolTable,
    strings: &mut StringTable,
) -> Result<Operand, AssembleError> {
    let token = cursor.next_token()?;
    match token.kind {
        TokenKind::Register(id) => Ok(Operand::Register(register_tag(id))),
        TokenKind::Integer(v) => Ok(Operand::Integer(v)),
        TokenKind::Float(v) => Ok(Operand::Float(v)),
        TokenKind::String(ref s) => {
            if s.is_empty() {
                Ok(Operand::Integer(0))
            } else {
                Ok(Operand::IndexString(strings.intern(s) as i32))
            }
        }
        TokenKind::Identifier(ref name) => resolve_variable(cursor, function, table, name, token.line),
        other => Err(AssembleError::new(token.line, format!("expected a value, found {:?}", other))),
    }
}

fn resolve_jump_target(
    cursor: &mut OperandCursor,
    function: &FunctionSymbol,
    entry_points: &[u32],
    line: u32,
) -> Result<Operand, AssembleError> {
    let token = cursor.next_token()?;
    match token.kind {
        TokenKind::Identifier(ref label) => {
            let offset = function
                .labels
                .get(label)
                .ok_or_else(|| AssembleError::new(line, format!("undefined label '{}'", label)))?;
            let absolute = entry_points[function.index as usize] + offset;
            Ok(Operand::IndexInstruction(absolute as i32))
        }
        other => Err(AssembleError::new(line, format!("expected a label, found {:?}", other))),
    }
}

fn resolve_function_ref(cursor: &mut OperandCursor, table: &SymbolTable, line: u32) -> Result<Operand, AssembleError> {
    let token = cursor.next_token()?;
    match token.kind {
        TokenKind::Identifier(ref name) => {
            let index = table
                .function_index
                .get(name)
                .ok_or_else(|| AssembleError::new(line, format!("undefined function '{}'", name)))?;
            Ok(Operand::IndexFunction(*index as i32))
        }
        other => Err(AssembleError::new(line, format!("expected a function name, found {:?}", other))),
    }
}

fn resolve_host_ref(cursor: &mut OperandCursor, hosts: &mut HostFunctionTable, line: u32) -> Result<Operand, AssembleError> {
    let token = cursor.next_token()?;
    let name = match token.kind {
        TokenKind::Identifier(ref s) => s.clone(),
        TokenKind::String(ref s) => s.clone(),
        other => return Err(AssembleError::new(line, format!("expected a host function name, found {:?}", other))),
    };
    Ok(Operand::IndexFunctionHost(hosts.intern(&name) as i32))
}

fn resolve_operands(
    instr: &PendingInstruction,
    function: &FunctionSymbol,
    table: &SymbolTable,
    entry_points: &[u32],
    strings: &mut StringTable,
    hosts: &mut HostFunctionTable,
) -> Result<Vec<Operand>, AssembleError> {
    use Opcode::*;
    let mut cursor = OperandCursor::new(&instr.operands, instr.line);

    if instr.opcode == Exit {
        // Any operand is accepted and discarded, per the grammar note
        // that `Exit` ignores its argument.
        return Ok(vec![]);
    }

    let operands = match instr.opcode {
        Mov | Add | Sub | Mul | Div | Mod | Exp | And | Or | Xor | Shl | Shr | Concat | Rand => {
            let a = resolve_value_operand(&mut cursor, function, table, strings)?;
            let b = resolve_value_operand(&mut cursor, function, table, strings)?;
            vec![a, b]
        }
        Neg | Inc | Dec | Not | Push | Pop | Pause => {
            vec![resolve_value_operand(&mut cursor, function, table, strings)?]
        }
        GetChar | SetChar => {
            let a = resolve_value_operand(&mut cursor, function, table, strings)?;
            let b = resolve_value_operand(&mut cursor, function, table, strings)?;
            let c = resolve_value_operand(&mut cursor, function, table, strings)?;
            vec![a, b, c]
        }
        Jmp => vec![resolve_jump_target(&mut cursor, function, entry_points, instr.line)?],
        Je | Jne | Jg | Jl | Jge | Jle => {
            let a = resolve_value_operand(&mut cursor, function, table, strings)?;
            let b = resolve_value_operand(&mut cursor, function, table, strings)?;
            let target = resolve_jump_target(&mut cursor, function, entry_points, instr.line)?;
            vec![a, b, target]
        }
        Call => vec![resolve_function_ref(&mut cursor, table, instr.line)?],
        CallHost => vec![resolve_host_ref(&mut cursor, hosts, instr.line)?],
        Ret => vec![],
        Exit => unreachable!("handled above"),
    };

    if !cursor.done() {
        return Err(AssembleError::new(instr.line, format!("too many operands for {:?}", instr.opcode)));
    }
    Ok(operands)
}

/// Runs pass 2 over the output of [`crate::symbols::analyze`],
/// producing a checksummed, ready-to-write executable.
pub fn generate(table: &SymbolTable, pending: &[PendingInstruction]) -> Result<Executable, AssembleError> {
    let mut entry_points = vec![0u32; table.functions.len()];
    let mut seen = vec![false; table.functions.len()];
    for (i, instr) in pending.iter().enumerate() {
        if !seen[instr.function_index] {
            entry_points[instr.function_index] = i as u32;
            seen[instr.function_index] = true;
        }
    }

    let mut strings = StringTable::default();
    let mut hosts = HostFunctionTable::default();

    let mut instructions = Vec::with_capacity(pending.len());
    for instr in pending {
        let function = &table.functions[instr.function_index];
        let operands = resolve_operands(instr, function, table, &entry_points, &mut strings, &mut hosts)?;
        let opcode = instr
            .opcode
            .to_u16()
            .ok_or_else(|| AssembleError::new(instr.line, "opcode has no numeric encoding"))?;
        instructions.push(InstructionRecord { opcode, operands });
    }

    let host_string_index = match &table.host {
        Some((name, _, _)) => strings.intern(name),
        None => NONE_INDEX,
    };
    let host_version = table.host.as_ref().map(|(_, major, minor)| (*major, *minor)).unwrap_or((0, 0));
    let (thread_priority_type, thread_priority_user_ms) = table.thread_priority.unwrap_or((1, 0));

    let functions = table
        .functions
        .iter()
        .enumerate()
        .map(|(i, f)| FunctionEntry {
            entry_point: entry_points[i],
            parameter_count: f.param_count,
            local_data_size: f.local_size,
            name: table.function_names[i].clone(),
        })
        .collect();

    let host_functions = hosts.names.iter().map(|name| HostFunctionEntry { name: name.clone() }).collect();

    let mut executable = Executable {
        header: MainHeader {
            available_agni_version: AGNI_VERSION,
            required_agni_version: AGNI_VERSION,
            host_string_index,
            host_version,
            checksum: 0,
            stack_size: table.stack_size.unwrap_or(NONE_INDEX),
            global_data_size: table.global_data_size,
            main_index: table.main_index.unwrap_or(NONE_INDEX),
            thread_priority_type,
            thread_priority_user_ms,
        },
        instructions,
        strings: strings.strings,
        functions,
        host_functions,
    };

    let zeroed = agni_image::to_bytes_with_checksum_zeroed(&executable)
        .map_err(|e| AssembleError::new(0, format!("failed to serialize executable: {}", e)))?;
    executable.header.checksum = agni_image::checksum::compute(&zeroed);
    Ok(executable)
}
