//! Line-oriented lexer (§4.2). Delimiters are `, : [ ] { } "` and the
//! newline itself; `;` starts a comment that runs to end of line
//! unless it appears inside a string. Every token remembers the
//! 1-based line it came from.

use agni_vm::opcode::{Opcode, RegisterId};
use util::EnumFromStr;

use crate::error::AssembleError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    SetHost,
    SetStackSize,
    SetThreadPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keyword {
    Func,
    Var,
    Param,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Comma,
    Colon,
    OpenBracket,
    CloseBracket,
    OpenBrace,
    CloseBrace,
    Newline,
    Integer(i32),
    Float(f32),
    String(String),
    Mnemonic(Opcode),
    Directive(Directive),
    Keyword(Keyword),
    Register(RegisterId),
    Identifier(String),
    End,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

fn classify_word(word: &str) -> TokenKind {
    match word {
        "SetHost" => return TokenKind::Directive(Directive::SetHost),
        "SetStackSize" => return TokenKind::Directive(Directive::SetStackSize),
        "SetThreadPriority" => return TokenKind::Directive(Directive::SetThreadPriority),
        "Func" => return TokenKind::Keyword(Keyword::Func),
        "Var" => return TokenKind::Keyword(Keyword::Var),
        "Param" => return TokenKind::Keyword(Keyword::Param),
        _ => {}
    }
    if let Some(register_name) = word.strip_prefix("_Register") {
        if let Ok(register) = RegisterId::from_str(register_name) {
            return TokenKind::Register(register);
        }
    }
    if let Ok(opcode) = Opcode::from_str(word) {
        return TokenKind::Mnemonic(opcode);
    }
    TokenKind::Identifier(word.to_string())
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenizes `source` in full, honoring line-oriented comments and
/// producing a trailing [`TokenKind::End`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, AssembleError> {
    let mut tokens = Vec::new();

    for (line_index, raw_line) in source.lines().enumerate() {
        let line = line_index as u32 + 1;
        let stripped = strip_comment(raw_line);
        let chars: Vec<char> = stripped.trim().chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            match c {
                ',' => {
                    tokens.push(Token { kind: TokenKind::Comma, line });
                    i += 1;
                }
                ':' => {
                    tokens.push(Token { kind: TokenKind::Colon, line });
                    i += 1;
                }
                '[' => {
                    tokens.push(Token { kind: TokenKind::OpenBracket, line });
                    i += 1;
                }
                ']' => {
                    tokens.push(Token { kind: TokenKind::CloseBracket, line });
                    i += 1;
                }
                '{' => {
                    tokens.push(Token { kind: TokenKind::OpenBrace, line });
                    i += 1;
                }
                '}' => {
                    tokens.push(Token { kind: TokenKind::CloseBrace, line });
                    i += 1;
                }
                '"' => {
                    i += 1;
                    let mut text = String::new();
                    loop {
                        if i >= chars.len() {
                            return Err(AssembleError::new(line, "unterminated string literal"));
                        }
                        match chars[i] {
                            '"' => {
                                i += 1;
                                break;
                            }
                            '\\' if i + 1 < chars.len() => {
                                text.push(chars[i + 1]);
                                i += 2;
                            }
                            other => {
                                text.push(other);
                                i += 1;
                            }
                        }
                    }
                    tokens.push(Token { kind: TokenKind::String(text), line });
                }
                c if c == '-' || c.is_ascii_digit() => {
                    let start = i;
                    if c == '-' {
                        i += 1;
                    }
                    let mut is_float = false;
                    while i < chars.len()
                        && (chars[i].is_ascii_digit() || (chars[i] == '.' && !is_float))
                    {
                        if chars[i] == '.' {
                            is_float = true;
                        }
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    if is_float {
                        let value: f32 = text
                            .parse()
                            .map_err(|_| AssembleError::new(line, format!("invalid float literal '{}'", text)))?;
                        tokens.push(Token { kind: TokenKind::Float(value), line });
                    } else {
                        let value: i32 = text
                            .parse()
                            .map_err(|_| AssembleError::new(line, format!("invalid integer literal '{}'", text)))?;
                        tokens.push(Token { kind: TokenKind::Integer(value), line });
                    }
                }
                c if is_identifier_start(c) => {
                    let start = i;
                    while i < chars.len() && is_identifier_continue(chars[i]) {
                        i += 1;
                    }
                    let word: String = chars[start..i].iter().collect();
                    tokens.push(Token { kind: classify_word(&word), line });
                }
                other => {
                    return Err(AssembleError::new(line, format!("unexpected character '{}'", other)));
                }
            }
        }

        tokens.push(Token { kind: TokenKind::Newline, line });
    }

    let end_line = tokens.last().map(|t| t.line).unwrap_or(1);
    tokens.push(Token { kind: TokenKind::End, line: end_line });
    Ok(tokens)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escape = false;
    for (i, c) in line.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_directive_line() {
        let tokens = tokenize("SetHost \"Demo\", 1, 0").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Directive(Directive::SetHost));
        assert_eq!(tokens[1].kind, TokenKind::String("Demo".into()));
        assert_eq!(tokens[2].kind, TokenKind::Comma);
        assert_eq!(tokens[3].kind, TokenKind::Integer(1));
    }

    #[test]
    fn strips_comments_outside_strings() {
        let tokens = tokenize("Mov _RegisterT0, 1 ; comment").unwrap();
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Mnemonic(Opcode::Mov)));
        assert!(!tokens.iter().any(|t| matches!(&t.kind, TokenKind::Identifier(s) if s.contains("comment"))));
    }

    #[test]
    fn recognizes_registers_and_negative_integers() {
        let tokens = tokenize("Mov _RegisterT0, -5").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Register(RegisterId::T0));
        assert_eq!(tokens[3].kind, TokenKind::Integer(-5));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(tokenize("SetHost \"oops").is_err());
    }
}
