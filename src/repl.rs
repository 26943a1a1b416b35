// File: src/repl.rs
//
// Interactive REPL for the Flax programming language.
// One VM lives for the whole session, so globals, classes, and interned
// strings persist across lines. Provides command history via rustyline and
// a few :meta commands.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Stdout;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm<Stdout>,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(std::io::stdout()), editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Flax".bright_green().bold(),
            format!("v{} interactive shell", env!("CARGO_PKG_VERSION")).bright_blue()
        );
        println!("  type {} for commands, {} to leave", ":help".bright_yellow(), ":quit".bright_yellow());
        println!();
    }

    /// Runs the prompt loop until :quit or end of input.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        loop {
            match self.editor.readline(&"flax> ".bright_green().to_string()) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed.starts_with(':') {
                        if !self.handle_command(trimmed) {
                            break;
                        }
                        continue;
                    }

                    // Errors are reported and the session keeps going; the
                    // VM resets its stack but keeps globals.
                    if let Err(error) = self.vm.interpret(&line) {
                        eprintln!("{}", error);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl-C clears the line, like a shell.
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(error) => {
                    eprintln!("input error: {}", error);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a :meta command. Returns false when the session should end.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":quit" | ":q" | ":exit" => false,
            ":clear" => {
                print!("\x1B[2J\x1B[1;1H");
                true
            }
            ":help" => {
                println!("  {}  show this help", ":help".bright_yellow());
                println!("  {} clear the screen", ":clear".bright_yellow());
                println!("  {}  leave the shell", ":quit".bright_yellow());
                println!();
                println!("  anything else is run as Flax source, e.g.");
                println!("    print 1 + 2;");
                true
            }
            _ => {
                eprintln!("unknown command: {} (try :help)", command);
                true
            }
        }
    }
}
