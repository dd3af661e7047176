// File: src/main.rs
//
// CLI entry point. Grounded on the teacher's `clap`-derive `Cli` struct
// (`src/main.rs`), narrowed from its five subcommands (`run`/`repl`/
// `test`/`bench`/`profile`) down to the spec's two-mode contract: no
// positional argument launches the REPL, one argument runs that file,
// and more than one is a usage error.

use loxvm::{errors, repl, vm};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "loxvm",
    about = "A single-pass bytecode compiler and stack-based VM for Lox",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// With no argument, start the REPL; with one, run that script.
    /// More than one is a usage error.
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.args.len() > 1 {
        eprintln!("Usage: loxvm [path]");
        return ExitCode::from(64);
    }

    match cli.args.first() {
        None => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(err) = repl.run() {
                    eprintln!("{err}");
                    return ExitCode::from(1);
                }
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(1)
            }
        },
        Some(path) => run_file(&PathBuf::from(path)),
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{}': {}", path.display(), err);
            return ExitCode::from(74);
        }
    };

    let mut machine = vm::VM::new();
    match machine.interpret(&source, &mut std::io::stdout()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ errors::LoxError::Compile(_)) => {
            eprintln!("{err}");
            ExitCode::from(65)
        }
        Err(err @ errors::LoxError::Runtime { .. }) => {
            eprintln!("{err}");
            ExitCode::from(70)
        }
    }
}
