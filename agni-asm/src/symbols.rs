//! Pass 1 (§4.3): walks the token stream once, building the global
//! and per-function symbol tables and sizing the instruction stream,
//! without emitting anything. Also records each instruction's raw
//! operand tokens so pass 2 does not need to re-lex.

use std::collections::HashMap;

use agni_vm::opcode::Opcode;

use crate::error::AssembleError;
use crate::lexer::{Directive, Keyword, Token, TokenKind};

pub const NONE_INDEX: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
pub struct Global {
    pub index: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Local {
    /// Negative absolute stack index of element 0, resolved against
    /// the callee's frame top at runtime; element `i` of an array
    /// lives at `slot + i` (§4.1/§4.5).
    pub slot: i32,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct FunctionSymbol {
    pub index: u32,
    pub param_count: u8,
    pub local_size: u32,
    pub locals: HashMap<String, Local>,
    pub labels: HashMap<String, u32>,
}

#[derive(Clone, Debug)]
pub struct PendingInstruction {
    pub function_index: usize,
    pub opcode: Opcode,
    pub operands: Vec<Token>,
    pub line: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    pub host: Option<(String, u8, u8)>,
    pub stack_size: Option<u32>,
    /// `(thread_priority_type, user_ms)`, matching the on-disk header
    /// fields (§6).
    pub thread_priority: Option<(u8, u32)>,
    pub globals: HashMap<String, Global>,
    pub global_data_size: u32,
    pub functions: Vec<FunctionSymbol>,
    pub function_names: Vec<String>,
    pub function_index: HashMap<String, usize>,
    pub main_index: Option<u32>,
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Cursor<'a> {
        Cursor { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek().kind, TokenKind::Newline) {
            self.advance();
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::End)
    }
}

/// Runs pass 1 over `tokens`, returning the completed symbol table and
/// the in-order list of instructions still awaiting operand
/// resolution.
pub fn analyze(tokens: &[Token]) -> Result<(SymbolTable, Vec<PendingInstruction>), AssembleError> {
    let mut table = SymbolTable::default();
    let mut pending = Vec::new();
    let mut cursor = Cursor::new(tokens);

    loop {
        cursor.skip_newlines();
        if cursor.at_end() {
            break;
        }
        let token = cursor.advance();
        match token.kind {
            TokenKind::Directive(Directive::SetHost) => {
                let name = expect_string(&mut cursor)?;
                expect_comma(&mut cursor)?;
                let major = expect_integer(&mut cursor)? as u8;
                expect_comma(&mut cursor)?;
                let minor = expect_integer(&mut cursor)? as u8;
                if table.host.is_some() {
                    return Err(AssembleError::new(token.line, "SetHost declared more than once"));
                }
                table.host = Some((name, major, minor));
            }
            TokenKind::Directive(Directive::SetStackSize) => {
                let size = expect_integer(&mut cursor)?;
                if table.stack_size.is_some() {
                    return Err(AssembleError::new(token.line, "SetStackSize declared more than once"));
                }
                table.stack_size = Some(size as u32);
            }
            TokenKind::Directive(Directive::SetThreadPriority) => {
                let priority = parse_thread_priority(&mut cursor, token.line)?;
                if table.thread_priority.is_some() {
                    return Err(AssembleError::new(token.line, "SetThreadPriority declared more than once"));
                }
                table.thread_priority = Some(priority);
            }
            TokenKind::Keyword(Keyword::Var) => {
                declare_global_var(&mut table, &mut cursor, token.line)?;
            }
            TokenKind::Keyword(Keyword::Func) => {
                analyze_function(&mut table, &mut pending, &mut cursor, token.line)?;
            }
            other => {
                return Err(AssembleError::new(
                    token.line,
                    format!("unexpected token at global scope: {:?}", other),
                ));
            }
        }
    }

    Ok((table, pending))
}

fn expect_string(cursor: &mut Cursor) -> Result<String, AssembleError> {
    let token = cursor.advance();
    match token.kind {
        TokenKind::String(s) => Ok(s),
        other => Err(AssembleError::new(token.line, format!("expected string, found {:?}", other))),
    }
}

fn expect_integer(cursor: &mut Cursor) -> Result<i32, AssembleError> {
    let token = cursor.advance();
    match token.kind {
        TokenKind::Integer(v) => Ok(v),
        other => Err(AssembleError::new(token.line, format!("expected integer, found {:?}", other))),
    }
}

fn expect_comma(cursor: &mut Cursor) -> Result<(), AssembleError> {
    let token = cursor.advance();
    match token.kind {
        TokenKind::Comma => Ok(()),
        other => Err(AssembleError::new(token.line, format!("expected ',', found {:?}", other))),
    }
}

fn expect_identifier(cursor: &mut Cursor) -> Result<String, AssembleError> {
    let token = cursor.advance();
    match token.kind {
        TokenKind::Identifier(s) => Ok(s),
        other => Err(AssembleError::new(token.line, format!("expected identifier, found {:?}", other))),
    }
}

fn parse_thread_priority(cursor: &mut Cursor, line: u32) -> Result<(u8, u32), AssembleError> {
    let token = cursor.advance();
    match token.kind {
        TokenKind::Identifier(ref s) if s.eq_ignore_ascii_case("Low") => Ok((1, 0)),
        TokenKind::Identifier(ref s) if s.eq_ignore_ascii_case("Medium") => Ok((2, 0)),
        TokenKind::Identifier(ref s) if s.eq_ignore_ascii_case("High") => Ok((3, 0)),
        TokenKind::Integer(ms) => {
            // `<n> ms`: a bare identifier `ms` follows the literal.
            match cursor.advance().kind {
                TokenKind::Identifier(ref unit) if unit.eq_ignore_ascii_case("ms") => Ok((0, ms as u32)),
                other => Err(AssembleError::new(line, format!("expected 'ms' after duration, found {:?}", other))),
            }
        }
        other => Err(AssembleError::new(line, format!("invalid thread priority '{:?}'", other))),
    }
}

fn declare_global_var(table: &mut SymbolTable, cursor: &mut Cursor, line: u32) -> Result<(), AssembleError> {
    let name = expect_identifier(cursor)?;
    let size = parse_optional_array_size(cursor, line)?;
    if table.globals.contains_key(&name) {
        return Err(AssembleError::new(line, format!("global variable '{}' declared twice", name)));
    }
    let index = table.global_data_size;
    table.global_data_size += size;
    table.globals.insert(name, Global { index, size });
    Ok(())
}

fn parse_optional_array_size(cursor: &mut Cursor, line: u32) -> Result<u32, AssembleError> {
    if matches!(cursor.peek().kind, TokenKind::OpenBracket) {
        cursor.advance();
        let size = expect_integer(cursor)?;
        if size <= 1 {
            return Err(AssembleError::new(line, "array size must be greater than 1"));
        }
        match cursor.advance().kind {
            TokenKind::CloseBracket => {}
            other => return Err(AssembleError::new(line, format!("expected ']', found {:?}", other))),
        }
        Ok(size as u32)
    } else {
        Ok(1)
    }
}

fn analyze_function(
    table: &mut SymbolTable,
    pending: &mut Vec<PendingInstruction>,
    cursor: &mut Cursor,
    func_line: u32,
) -> Result<(), AssembleError> {
    let name = expect_identifier(cursor)?;
    if table.function_index.contains_key(&name) {
        return Err(AssembleError::new(func_line, format!("function '{}' declared twice", name)));
    }
    cursor.skip_newlines();
    match cursor.advance().kind {
        TokenKind::OpenBrace => {}
        other => return Err(AssembleError::new(func_line, format!("expected '{{', found {:?}", other))),
    }

    let function_index = table.functions.len();
    table.function_index.insert(name.clone(), function_index);
    table.function_names.push(name.clone());
    if name.eq_ignore_ascii_case("Main") {
        table.main_index = Some(function_index as u32);
    }

    // Locals and parameters are both addressed as negative offsets
    // from the frame marker (§4.1/§4.5): parameters, then the return
    // address, then locals, then the marker itself, bottom to top. The
    // exact offset of any one variable depends on the function's
    // *final* local size and parameter count, so slots are only
    // assigned once the whole body has been scanned; until then each
    // declaration just records its position within its own kind.
    enum PendingSlot {
        Local { prefix: u32, size: u32 },
        Param { order: u8 },
    }
    let mut pending_locals: HashMap<String, PendingSlot> = HashMap::new();
    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut local_size: u32 = 0;
    let mut param_count: u8 = 0;
    let mut instruction_count: u32 = 0;

    loop {
        cursor.skip_newlines();
        match &cursor.peek().kind {
            TokenKind::CloseBrace => {
                cursor.advance();
                break;
            }
            TokenKind::Keyword(Keyword::Var) => {
                let line = cursor.advance().line;
                let var_name = expect_identifier(cursor)?;
                let size = parse_optional_array_size(cursor, line)?;
                if pending_locals.contains_key(&var_name) {
                    return Err(AssembleError::new(line, format!("local '{}' declared twice", var_name)));
                }
                let prefix = local_size;
                local_size += size;
                pending_locals.insert(var_name, PendingSlot::Local { prefix, size });
            }
            TokenKind::Keyword(Keyword::Param) => {
                let line = cursor.advance().line;
                if name.eq_ignore_ascii_case("Main") {
                    return Err(AssembleError::new(line, "Main may not declare parameters"));
                }
                let var_name = expect_identifier(cursor)?;
                if pending_locals.contains_key(&var_name) {
                    return Err(AssembleError::new(line, format!("parameter '{}' declared twice", var_name)));
                }
                let order = param_count;
                param_count += 1;
                pending_locals.insert(var_name, PendingSlot::Param { order });
            }
            TokenKind::Identifier(_) => {
                let line = cursor.peek().line;
                let label = expect_identifier(cursor)?;
                match cursor.advance().kind {
                    TokenKind::Colon => {}
                    other => return Err(AssembleError::new(line, format!("expected ':', found {:?}", other))),
                }
                if labels.contains_key(&label) {
                    return Err(AssembleError::new(line, format!("label '{}' declared twice", label)));
                }
                labels.insert(label, instruction_count);
            }
            TokenKind::Mnemonic(opcode) => {
                let line = cursor.advance().line;
                let operands = collect_operand_tokens(cursor, line)?;
                pending.push(PendingInstruction { function_index, opcode: *opcode, operands, line });
                instruction_count += 1;
            }
            TokenKind::End => {
                return Err(AssembleError::new(func_line, format!("function '{}' missing closing '}}'", name)));
            }
            other => {
                return Err(AssembleError::new(cursor.peek().line, format!("unexpected token in function body: {:?}", other)));
            }
        }
    }

    let terminator = if name.eq_ignore_ascii_case("Main") { Opcode::Exit } else { Opcode::Ret };
    pending.push(PendingInstruction { function_index, opcode: terminator, operands: vec![], line: func_line });

    // Finalize slots now that `local_size` and `param_count` are known.
    // Locals: the first-declared local sits deepest (most negative),
    // and element `i` of an array based there is `slot + i` with no
    // sign flip. Parameters: the first-declared parameter is pushed
    // first by the caller, so it is deepest of all.
    let locals = pending_locals
        .into_iter()
        .map(|(var_name, pending_slot)| {
            let local = match pending_slot {
                PendingSlot::Local { prefix, size } => {
                    let slot = prefix as i32 - local_size as i32;
                    Local { slot, size }
                }
                PendingSlot::Param { order } => {
                    let slot = order as i32 - param_count as i32 - local_size as i32 - 1;
                    Local { slot, size: 1 }
                }
            };
            (var_name, local)
        })
        .collect();

    table.functions.push(FunctionSymbol {
        index: function_index as u32,
        param_count,
        local_size,
        locals,
        labels,
    });
    Ok(())
}

/// Collects the raw comma-separated operand tokens of one instruction
/// line, up to (and consuming) the terminating newline.
fn collect_operand_tokens(cursor: &mut Cursor, line: u32) -> Result<Vec<Token>, AssembleError> {
    let mut tokens = Vec::new();
    loop {
        match &cursor.peek().kind {
            TokenKind::Newline | TokenKind::End => {
                if matches!(cursor.peek().kind, TokenKind::Newline) {
                    cursor.advance();
                }
                break;
            }
            TokenKind::Comma => {
                cursor.advance();
            }
            _ => tokens.push(cursor.advance()),
        }
    }
    let _ = line;
    Ok(tokens)
}
