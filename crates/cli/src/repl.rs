//! Interactive session
//!
//! Each line runs under a fresh slice of the configured instruction
//! budget: the counter resets before every entry, so one runaway line
//! cannot consume the session. Expressions are tried as `return <line>`
//! first, the way interactive Lua shells conventionally do.

use std::path::PathBuf;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use moat_runtime::{Globals, RuntimeError};

use crate::profile::SandboxProfile;

fn history_path() -> Option<PathBuf> {
    let mut dir = dirs::state_dir().or_else(dirs::data_local_dir)?;
    dir.push("moat");
    std::fs::create_dir_all(&dir).ok()?;
    dir.push("history");
    Some(dir)
}

pub fn run(globals: &Globals, profile: &SandboxProfile) -> Result<(), String> {
    let mut editor = DefaultEditor::new().map_err(|e| e.to_string())?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }
    if profile.max_instructions > 0 {
        globals
            .install_main_limit(profile.max_instructions, profile.max_string_size)
            .map_err(|e| e.to_string())?;
    }
    println!("moat {} — per-line budget: {} instructions", env!("CARGO_PKG_VERSION"), profile.max_instructions);

    loop {
        match editor.readline("moat> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                globals.reset_main_limit();
                eval_line(globals, &line);
                while let Some(out) = globals.try_dequeue() {
                    println!("{out}");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.to_string()),
        }
    }
    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    Ok(())
}

fn eval_line(globals: &Globals, line: &str) {
    // Prefer expression form so `1 + 1` prints its value.
    let as_expr = format!("return {line}");
    let chunk = match globals.load(as_expr.as_bytes(), "=stdin") {
        Ok(f) => Ok(f),
        Err(RuntimeError::Compile(_)) => globals.load(line.as_bytes(), "=stdin"),
        Err(e) => Err(e),
    };
    match chunk.and_then(|f| globals.call(&f, Vec::new())) {
        Ok(values) => {
            for v in values {
                println!("{}", v.display_string());
            }
        }
        Err(e) => eprintln!("error: {e}"),
    }
}
