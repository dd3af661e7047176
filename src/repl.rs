// File: src/repl.rs
//
// Interactive REPL. Grounded on the teacher's `src/repl.rs`
// (`rustyline::DefaultEditor` for line editing/history, a banner, brace-depth
// multi-line continuation). Trimmed of the teacher's `:help`/`:vars`/`:reset`
// command surface — the spec's REPL contract is just "read a line, interpret
// it, loop until EOF" — but kept the brace-aware continued-input behavior,
// since a Lox function or block can span multiple lines.

use crate::vm::VM;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: VM,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: VM::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "loxvm — bytecode Lox REPL".bright_cyan());
        println!("{}", "Ctrl+D to exit. Unclosed braces/parens continue onto the next line.".dimmed());
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() { "> ".bright_green().to_string() } else { "..> ".bright_blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if Self::is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// True once every brace/bracket/paren opened in `input` is closed and
    /// we are not mid-string — the point at which the buffered source is
    /// worth handing to the compiler.
    fn is_input_complete(input: &str) -> bool {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return true;
        }

        let mut depth: i32 = 0;
        let mut in_string = false;
        let mut escape_next = false;

        for ch in trimmed.chars() {
            if escape_next {
                escape_next = false;
                continue;
            }
            match ch {
                '\\' if in_string => escape_next = true,
                '"' => in_string = !in_string,
                '(' | '{' if !in_string => depth += 1,
                ')' | '}' if !in_string => depth -= 1,
                _ => {}
            }
        }

        !in_string && depth <= 0
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        if let Err(err) = self.vm.interpret(input, &mut std::io::stdout()) {
            eprintln!("{} {}", "Error:".bright_red().bold(), err);
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to initialize line editor")
    }
}
