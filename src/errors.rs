// File: src/errors.rs
//
// Error types surfaced by compilation and execution, with the teacher's
// colored, human-oriented `Display` formatting narrowed down to the two
// kinds the language actually has: a compile-time diagnostic list and a
// single runtime error with a call-stack trace.

use colored::Colorize;
use std::fmt;
use std::io::IsTerminal;

/// One compile-time diagnostic, formatted the way the scanner/compiler
/// report it: `[line N] Error at '<lexeme>': <message>` (or `at end` for
/// an EOF token, or no `at ...` clause for a synthesized message).
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: i32,
    pub location: String,
    pub message: String,
}

impl Diagnostic {
    pub fn at_token(line: i32, lexeme: &str, at_end: bool, message: impl Into<String>) -> Self {
        let location = if at_end { "at end".to_string() } else { format!("at '{lexeme}'") };
        Diagnostic { line, location, message: message.into() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if std::io::stderr().is_terminal() {
            write!(
                f,
                "{} {}: {}",
                format!("[line {}] Error", self.line).red().bold(),
                self.location,
                self.message
            )
        } else {
            write!(f, "[line {}] Error {}: {}", self.line, self.location, self.message)
        }
    }
}

/// Errors surfaced by `interpret`. Compile errors carry every diagnostic
/// collected before `synchronize` gave up (panic-mode recovery suppresses
/// cascades but does not stop at the first error); a runtime error carries
/// the failing message plus a frame-by-frame trace.
#[derive(Debug)]
pub enum LoxError {
    Compile(Vec<Diagnostic>),
    Runtime { message: String, trace: Vec<String> },
}

impl LoxError {
    pub fn runtime(message: impl Into<String>, trace: Vec<String>) -> Self {
        LoxError::Runtime { message: message.into(), trace }
    }
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoxError::Compile(diagnostics) => {
                for (i, d) in diagnostics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{d}")?;
                }
                Ok(())
            }
            LoxError::Runtime { message, trace } => {
                let header = if std::io::stderr().is_terminal() { message.red().bold().to_string() } else { message.clone() };
                writeln!(f, "{header}")?;
                for (i, line) in trace.iter().enumerate() {
                    if i + 1 < trace.len() {
                        writeln!(f, "{line}")?;
                    } else {
                        write!(f, "{line}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LoxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_formats_token_location() {
        let d = Diagnostic::at_token(3, "+", false, "Expect expression.");
        let rendered = format!("{d}");
        assert!(rendered.contains("[line 3]"));
        assert!(rendered.contains("at '+'"));
        assert!(rendered.contains("Expect expression."));
    }

    #[test]
    fn diagnostic_formats_at_end() {
        let d = Diagnostic::at_token(7, "", true, "Expect ';' after value.");
        assert!(format!("{d}").contains("at end"));
    }
}
