//! Diagnostic library
//!
//! Stack traces and frame info for error reporting. This surface is
//! diagnostics, not a sandbox boundary: `sethook` is accepted for
//! compatibility but installs nothing that could observe or weaken the
//! instruction budget.

use std::sync::{Arc, Mutex};

use moat_core::{Table, Value};

use crate::globals::Globals;
use crate::stdlib::{arg, new_module, one, set_fn};
use crate::vm;

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "debug");

    set_fn(&module, "traceback", |args| {
        let trace = vm::traceback();
        match arg(&args, 1) {
            Value::Nil => one(Value::from(trace)),
            Value::Str(msg) => one(Value::from(format!("{msg}\n{trace}"))),
            // Non-string messages pass through untouched.
            other => one(other),
        }
    });

    set_fn(&module, "getinfo", |_args| {
        let info = Arc::new(Mutex::new(Table::new()));
        if let Some((source, line)) = vm::current_location() {
            let mut guard = info.lock().unwrap();
            guard
                .set(Value::from("source"), Value::from(format!("@{source}")))
                .expect("string key");
            guard
                .set(Value::from("short_src"), Value::from(source))
                .expect("string key");
            guard
                .set(Value::from("currentline"), Value::Integer(line as i32))
                .expect("string key");
        }
        one(Value::Table(info))
    });

    set_fn(&module, "sethook", |_args| Ok(Vec::new()));

    set_fn(&module, "gethook", |_args| one(Value::Nil));
}
