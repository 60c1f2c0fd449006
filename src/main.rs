use std::env;
use std::fs;
use std::process;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use cinder::Vm;

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: cinder [path]");
            process::exit(64);
        }
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read \"{}\": {}.", path, e);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    if let Err(e) = vm.interpret(&source) {
        eprint!("{}", e);
        process::exit(e.exit_code());
    }
}

fn repl() {
    println!("cinder {}", env!("CARGO_PKG_VERSION"));

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not start line editor: {}", e);
            process::exit(74);
        }
    };

    // One VM for the whole session, so globals survive between lines.
    let mut vm = Vm::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                if let Err(e) = vm.interpret(&line) {
                    eprint!("{}", e);
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
}
