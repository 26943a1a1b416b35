// File: src/main.rs
//
// Entry point for the Flax interpreter.
// With a path argument, runs the file; with none, starts the interactive
// shell. Exit codes follow sysexits: 65 for compile errors, 70 for runtime
// errors, 74 when the file can't be read.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process;

use flax::debug;
use flax::errors::EX_IOERR;
use flax::repl::Repl;
use flax::vm::Vm;

#[derive(Parser)]
#[command(
    name = "flax",
    about = "Flax: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Script to run; omit it to get an interactive prompt
    file: Option<PathBuf>,

    /// Comma-separated debug flags: scanning, code, trace, stress_gc,
    /// log_gc (also read from FLAX_DEBUG)
    #[arg(long, value_name = "FLAGS")]
    debug: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Ok(flags) = std::env::var("FLAX_DEBUG") {
        debug::set_flags(&flags);
    }
    if let Some(flags) = &cli.debug {
        debug::set_flags(flags);
    }

    match cli.file {
        Some(path) => run_file(&path),
        None => run_repl(),
    }
}

fn run_file(path: &PathBuf) -> ! {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("could not read \"{}\": {}", path.display(), error);
            process::exit(EX_IOERR);
        }
    };

    let mut vm = Vm::new(std::io::stdout());
    match vm.interpret(&source) {
        Ok(()) => process::exit(0),
        Err(error) => {
            eprintln!("{}", error);
            process::exit(error.exit_code());
        }
    }
}

fn run_repl() -> ! {
    match Repl::new() {
        Ok(mut repl) => {
            if let Err(error) = repl.run() {
                eprintln!("shell error: {}", error);
                process::exit(1);
            }
            process::exit(0);
        }
        Err(error) => {
            eprintln!("failed to start shell: {}", error);
            process::exit(1);
        }
    }
}
