//! Assembler for Agni assembly listings (§4.2-§4.3): lexes a source
//! string, resolves symbols and operands in two passes, and emits a
//! checksummed [`agni_image::Executable`] ready for [`agni_vm::loader`].

pub mod codegen;
pub mod error;
pub mod lexer;
pub mod symbols;

pub use error::AssembleError;

/// Assembles `source` into a complete executable image.
pub fn assemble(source: &str) -> Result<agni_image::Executable, AssembleError> {
    let tokens = lexer::tokenize(source)?;
    let (table, pending) = symbols::analyze(&tokens)?;
    codegen::generate(&table, &pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_minimal_main_that_exits() {
        let executable = assemble("Func Main {\n  Exit\n}\n").unwrap();
        assert_eq!(executable.header.main_index, 0);
        assert!(!executable.instructions.is_empty());
        assert_ne!(executable.header.checksum, 0);
    }

    #[test]
    fn assembles_arithmetic_with_a_local_and_a_global() {
        let source = r#"
            Var counter

            Func Main {
                Var total
                Mov total, 0
                Mov counter, 5
                Add total, counter
                Exit
            }
        "#;
        let executable = assemble(source).unwrap();
        assert_eq!(executable.header.global_data_size, 1);
        assert_eq!(executable.functions[0].local_data_size, 1);
    }

    #[test]
    fn assembles_a_call_with_parameters() {
        let source = r#"
            Func Add2 {
                Param a
                Param b
                Add _RegisterReturn, a
                Add _RegisterReturn, b
                Ret
            }

            Func Main {
                Push 1
                Push 2
                Call Add2
                Exit
            }
        "#;
        let executable = assemble(source).unwrap();
        assert_eq!(executable.functions.len(), 2);
        assert_eq!(executable.functions[0].parameter_count, 2);
    }

    #[test]
    fn undefined_variable_is_reported_with_its_line() {
        let err = assemble("Func Main {\n  Mov missing, 1\n  Exit\n}\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn calling_a_host_function_interns_its_name_once() {
        let source = r#"
            Func Main {
                CallHost "Log"
                CallHost "Log"
                Exit
            }
        "#;
        let executable = assemble(source).unwrap();
        assert_eq!(executable.host_functions.len(), 1);
        assert_eq!(executable.host_functions[0].name, "Log");
    }
}
