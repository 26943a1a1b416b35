// File: src/errors.rs
//
// Error types and exit codes for the Flax interpreter.
// Compile errors are collected by the compiler and reported as a batch;
// runtime errors carry the offending line and a rendered stack trace.

use colored::Colorize;
use std::fmt;

/// sysexits-style process exit codes.
pub const EX_DATAERR: i32 = 65;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_IOERR: i32 = 74;

/// All diagnostics produced by one compilation, already rendered, in
/// source order. The compiler keeps going after an error (panic-mode
/// recovery), so there may be several.
#[derive(Debug)]
pub struct CompileErrors {
    pub diagnostics: Vec<String>,
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

/// A runtime failure: the line of the faulting instruction, the message,
/// and one entry per active call frame, innermost first.
#[derive(Debug)]
pub struct RuntimeError {
    pub line: u32,
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

/// One line of the stack trace. `function` is `None` for the top-level
/// script.
#[derive(Debug)]
pub struct TraceFrame {
    pub line: u32,
    pub function: Option<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] {}: {}",
            self.line,
            "RuntimeError".red().bold(),
            self.message
        )?;
        for frame in &self.trace {
            match &frame.function {
                Some(name) => write!(f, "\n[line {}] in {}()", frame.line, name)?,
                None => write!(f, "\n[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

/// Result of handing a source string to the interpreter.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileErrors),
    Runtime(RuntimeError),
}

impl InterpretError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretError::Compile(_) => EX_DATAERR,
            InterpretError::Runtime(_) => EX_SOFTWARE,
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for InterpretError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let compile = InterpretError::Compile(CompileErrors { diagnostics: vec![] });
        let runtime = InterpretError::Runtime(RuntimeError {
            line: 1,
            message: String::from("boom"),
            trace: vec![],
        });
        assert_eq!(compile.exit_code(), EX_DATAERR);
        assert_eq!(runtime.exit_code(), EX_SOFTWARE);
    }

    #[test]
    fn test_runtime_error_rendering() {
        colored::control::set_override(false);
        let err = RuntimeError {
            line: 3,
            message: String::from("operands must be numbers"),
            trace: vec![
                TraceFrame { line: 3, function: Some(String::from("inner")) },
                TraceFrame { line: 7, function: None },
            ],
        };
        let rendered = err.to_string();
        colored::control::unset_override();
        assert_eq!(
            rendered,
            "[line 3] RuntimeError: operands must be numbers\n\
             [line 3] in inner()\n\
             [line 7] in script"
        );
    }
}
