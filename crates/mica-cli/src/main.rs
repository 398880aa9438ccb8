use std::{
    io::{self, Write},
    process::ExitCode,
};

use mica::{Interp, builtins};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        run_file(&args[1])
    } else {
        repl()
    }
}

/// Runs a script file; any compile or runtime failure exits non-zero.
fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut interp = new_interp();
    if let Err(errors) = interp.compile(&source) {
        for error in errors {
            eprintln!("{error}");
        }
        return ExitCode::FAILURE;
    }
    if let Err(error) = interp.run() {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Line-at-a-time prompt. Globals persist across lines; `exit` quits.
fn repl() -> ExitCode {
    let mut interp = new_interp();
    loop {
        let Some(line) = read_line("> ") else {
            println!();
            break;
        };
        let trimmed = line.trim();
        if trimmed == "exit" {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        if let Err(errors) = interp.compile(&line) {
            for error in errors {
                eprintln!("{error}");
            }
            continue;
        }
        if let Err(error) = interp.run() {
            eprintln!("{error}");
            // A runtime error leaves the interpreter unusable; start a
            // fresh one so the session can continue.
            eprintln!("mica: state reset after runtime error");
            interp = new_interp();
        }
    }
    ExitCode::SUCCESS
}

fn new_interp() -> Interp {
    let mut interp = Interp::new();
    builtins::install(&mut interp);
    interp
}

fn read_line(prompt: &str) -> Option<String> {
    print!("{prompt}");
    if io::stdout().flush().is_err() {
        return None;
    }
    let mut input = String::new();
    let read = io::stdin().read_line(&mut input).ok()?;
    if read == 0 {
        return None;
    }
    Some(input.trim_end_matches(['\r', '\n']).to_owned())
}
