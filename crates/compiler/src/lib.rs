//! Mica compiler library
//!
//! Compiles Mica source text to amd64 Plan-9 assembly through the
//! pipeline lexer → parser/type-checker → HLIR → MLIR → code generator.
//! Every phase runs to completion on the whole input before the next
//! begins; the first failure in any phase aborts the pipeline and no
//! assembly is produced.
//!
//! ```rust,ignore
//! let asm = micac::compile_source(source, &micac::CompilerConfig::default())?;
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod hlir;
pub mod lexer;
pub mod mlir;
pub mod parser;
pub mod types;

pub use config::CompilerConfig;
pub use parser::{ParseError, Parser, Program};

use std::fs;
use std::path::{Path, PathBuf};

use crate::ast::Decl;

/// One error kind per pipeline phase. Each phase returns a single error
/// at the first failure and discards partial output.
#[derive(Debug)]
pub enum CompileError {
    /// I/O failure while reading source.
    Lex(String),
    /// Unexpected token, unterminated construct.
    Parse(String),
    /// Incompatible type, undefined name, mutability violation.
    Type(String),
    /// Internal IR consistency failure.
    Ir(String),
    /// Backend failure (register exhaustion, formatting).
    Codegen(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Lex(msg) => write!(f, "lex error: {}", msg),
            CompileError::Parse(msg) => write!(f, "parse error: {}", msg),
            CompileError::Type(msg) => write!(f, "type error: {}", msg),
            CompileError::Ir(msg) => write!(f, "ir error: {}", msg),
            CompileError::Codegen(msg) => write!(f, "codegen error: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<ParseError> for CompileError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Syntax(msg) => CompileError::Parse(msg),
            ParseError::Type(msg) => CompileError::Type(msg),
        }
    }
}

impl From<hlir::IrError> for CompileError {
    fn from(e: hlir::IrError) -> Self {
        CompileError::Ir(e.0)
    }
}

impl From<codegen::CodegenError> for CompileError {
    fn from(e: codegen::CodegenError) -> Self {
        CompileError::Codegen(e.to_string())
    }
}

/// Compile a complete source text to assembly.
pub fn compile_source(source: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    let program = parser::parse(source)?;
    let enums = hlir::enum_map(&program.decls);

    let mut funcs = Vec::new();
    for decl in &program.decls {
        match decl {
            Decl::Func(f) => {
                let (hf, data) =
                    hlir::generate(f, &program.type_infos, &program.callables, &enums)?;
                funcs.push(mlir::lower(&hf, &data, config));
            }
            // Types and enums contribute tables, not code.
            Decl::Type(_) | Decl::Enum(_) => {}
        }
    }

    let asm = codegen::CodeGen::new(config.clone()).codegen_program(&funcs)?;
    Ok(asm)
}

/// Parse and type-check only; no assembly is produced.
pub fn check_source(source: &str) -> Result<Program, CompileError> {
    Ok(parser::parse(source)?)
}

/// Compile a source file to assembly, writing the output beside the
/// input (extension replaced with `.s`) or to `output` when given.
/// Returns the path written.
pub fn compile_file(
    input: &Path,
    output: Option<&Path>,
    config: &CompilerConfig,
) -> Result<PathBuf, CompileError> {
    let source = fs::read_to_string(input)
        .map_err(|e| CompileError::Lex(format!("Failed to read {}: {}", input.display(), e)))?;
    let asm = compile_source(&source, config)?;
    let out_path = match output {
        Some(p) => p.to_path_buf(),
        None => input.with_extension("s"),
    };
    fs::write(&out_path, asm).map_err(|e| {
        CompileError::Codegen(format!("Failed to write {}: {}", out_path.display(), e))
    })?;
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Programs carried from the original test suite.

    const PRE_ECHO: &str = r#"func main() () -> affects(IO) {
	let args []string = { "foo", "bar", "baz" }
	mutable i = 1
	let length = len(args)
	while i < length {
		PrintString(args[i])

		i = i + 1

		if i != length {
			PrintString(" ")
		}
	}
	PrintString("\n")
}"#;

    const OUT_OF_ORDER: &str = r#"func main() () -> affects(IO) {
	PrintInt(foo())
}

func foo() (int) {
	return 3
}
"#;

    const LET_CONDITION: &str = r#"func main() () -> affects(IO) {
	let i = 0
	if (let i = i + 1) == 1 {
		PrintInt(i)
	} else {
		PrintInt(-1)
	}

	while (let i = i + 1) < 3 {
		PrintInt(i)
	}
}
"#;

    const REFERENCE_VARIABLE: &str = r#"func changer(mutable x int, y int) (int) -> affects(mutate) {
	x = 4
	return x + y
}

func main() () -> affects(IO) {
	mutable var = 3
	PrintInt(var)
	PrintString("\n")

	let sum = changer(var, 3)

	PrintInt(var)
	PrintString("\n")

	PrintInt(sum)
}"#;

    const STRING_ARG: &str = r#"func main() () -> affects(IO) {
	let b string = "foobar"
	PrintAString(b)
}

func PrintAString(str string) () -> affects(IO) {
	PrintString(str)
}
"#;

    const ENUM_MATCH: &str = r#"enum Maybe = None | Some int

func describe(m Maybe) () -> affects(IO) {
	match m {
	case None:
		PrintInt(-1)
	case Some n:
		PrintInt(n)
	}
}

func main() () -> affects(IO) {
	let x Maybe = Some 5
	describe(x)
	let y Maybe = None
	describe(y)
}
"#;

    const UNDEFINED_VARIABLE: &str = r#"func main() () -> affects(IO) {
	PrintInt(x)
}
"#;

    #[test]
    fn test_compile_pre_echo() {
        let asm = compile_source(PRE_ECHO, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT main(SB)"));
        assert!(asm.contains("CALL PrintString+0(SB)"));
        // The three literals plus separator and newline.
        assert!(asm.contains("$\"foo\""));
        assert!(asm.contains("$\"bar\""));
        assert!(asm.contains("$\"baz\""));
        assert!(asm.contains("$\"\\n\""));
        // Runtime text rides along.
        assert!(asm.contains("TEXT\t_main(SB)"));
    }

    #[test]
    fn test_compile_out_of_order() {
        let asm = compile_source(OUT_OF_ORDER, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT main(SB)"));
        assert!(asm.contains("TEXT foo(SB)"));
        assert!(asm.contains("CALL foo+0(SB)"));
        assert!(asm.contains("CALL PrintInt+0(SB)"));
    }

    #[test]
    fn test_compile_let_condition() {
        let asm = compile_source(LET_CONDITION, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT main(SB)"));
        // Loop structure made it through to labels and jumps.
        assert!(asm.contains("loop"));
        assert!(asm.contains("JMP"));
    }

    #[test]
    fn test_compile_reference_variable() {
        let asm = compile_source(REFERENCE_VARIABLE, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT changer(SB)"));
        // The reference parameter write goes through a pointer.
        assert!(asm.contains("CALL changer+0(SB)"));
    }

    #[test]
    fn test_compile_string_arg() {
        let asm = compile_source(STRING_ARG, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT PrintAString(SB)"));
        // The string argument occupies two slots (16 bytes of incoming
        // arguments), and forwarding it to PrintString needs two
        // outgoing slots.
        assert!(asm.contains("TEXT PrintAString(SB), 0, $16-16"));
    }

    #[test]
    fn test_compile_enum_match() {
        let asm = compile_source(ENUM_MATCH, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("TEXT describe(SB)"));
        assert!(asm.contains("jtend"));
        assert!(asm.contains("CALL PrintInt+0(SB)"));
    }

    #[test]
    fn test_undefined_variable_fails_before_codegen() {
        let err = compile_source(UNDEFINED_VARIABLE, &CompilerConfig::default()).unwrap_err();
        match err {
            CompileError::Type(msg) => assert!(msg.contains("Undefined variable: x")),
            other => panic!("expected a type error, got {}", other),
        }
    }

    #[test]
    fn test_check_source_produces_no_output() {
        let program = check_source(OUT_OF_ORDER).unwrap();
        assert!(program.find_func("foo").is_some());
    }

    #[test]
    fn test_compile_file_writes_beside_input() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("prog.mica");
        fs::write(&src_path, OUT_OF_ORDER).unwrap();

        let out = compile_file(&src_path, None, &CompilerConfig::default()).unwrap();
        assert_eq!(out, dir.path().join("prog.s"));
        let asm = fs::read_to_string(out).unwrap();
        assert!(asm.contains("TEXT main(SB)"));
    }

    #[test]
    fn test_compile_file_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("bad.mica");
        fs::write(&src_path, UNDEFINED_VARIABLE).unwrap();

        assert!(compile_file(&src_path, None, &CompilerConfig::default()).is_err());
        assert!(!dir.path().join("bad.s").exists());
    }

    #[test]
    fn test_prototype_round_trip() {
        // Argument names, types, and reference flags survive parsing.
        let program = check_source(REFERENCE_VARIABLE).unwrap();
        let sig = &program.callables["changer"][0];
        let rendered: Vec<String> = sig
            .args
            .iter()
            .map(|a| {
                format!(
                    "{}{} {}",
                    if a.reference { "mutable " } else { "" },
                    a.name,
                    a.typ.type_name()
                )
            })
            .collect();
        assert_eq!(rendered, vec!["mutable x int", "y int"]);
    }

    #[test]
    fn test_deterministic_end_to_end() {
        let a = compile_source(ENUM_MATCH, &CompilerConfig::default()).unwrap();
        let b = compile_source(ENUM_MATCH, &CompilerConfig::default()).unwrap();
        assert_eq!(a, b);
    }
}
