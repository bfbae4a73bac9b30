//! The curated standard surface
//!
//! One module per library, each registering natives into the sandbox's
//! environment through the helpers here. The surface is deliberately
//! narrow: no `io`, no process or filesystem access from `os`, no binary
//! chunk loading anywhere. Builtins that do nontrivial native work charge
//! the instruction budget explicitly.

pub mod base;
pub mod coroutine;
pub mod debug;
pub mod math;
pub mod os;
pub mod package;
pub mod pattern;
pub mod string;
pub mod table;

use std::sync::{Arc, Mutex};

use moat_core::{
    Function, LuaStr, NativeFunction, ScriptError, Table, TableRef, Value, Varargs,
};

use crate::globals::Globals;

/// Registers every library into a fresh sandbox.
pub(crate) fn install(g: &Globals) {
    base::install(g);
    string::install(g);
    table::install(g);
    math::install(g);
    os::install(g);
    coroutine::install(g);
    package::install(g);
    debug::install(g);
}

/// Creates a library table and publishes it as a global.
pub(crate) fn new_module(g: &Globals, name: &str) -> TableRef {
    let module: TableRef = Arc::new(Mutex::new(Table::new()));
    g.set(name, Value::Table(module.clone()));
    module
}

/// Registers one native in a library table.
pub(crate) fn set_fn(
    module: &TableRef,
    name: &str,
    func: impl Fn(Varargs) -> Result<Varargs, ScriptError> + Send + Sync + 'static,
) {
    let native = NativeFunction::new(name, func);
    module
        .lock()
        .unwrap()
        .set(
            Value::from(name),
            Value::Function(Function::Native(native)),
        )
        .expect("library names are valid keys");
}

/// The conventional "bad argument" error.
pub(crate) fn bad_arg(index: usize, fname: &str, expected: &str, got: &Value) -> ScriptError {
    let got = if got.is_nil() {
        "no value".to_string()
    } else {
        got.type_name().to_string()
    };
    ScriptError::raised(format!(
        "bad argument #{index} to '{fname}' ({expected} expected, got {got})"
    ))
}

pub(crate) fn arg(args: &Varargs, index: usize) -> Value {
    args.get(index - 1).cloned().unwrap_or(Value::Nil)
}

pub(crate) fn check_table(args: &Varargs, index: usize, fname: &str) -> Result<TableRef, ScriptError> {
    match arg(args, index) {
        Value::Table(t) => Ok(t),
        other => Err(bad_arg(index, fname, "table", &other)),
    }
}

/// String argument; numbers coerce to their printed form.
pub(crate) fn check_str(args: &Varargs, index: usize, fname: &str) -> Result<LuaStr, ScriptError> {
    match arg(args, index) {
        Value::Str(s) => Ok(s),
        v @ (Value::Integer(_) | Value::Number(_)) => Ok(LuaStr::from(v.display_string())),
        other => Err(bad_arg(index, fname, "string", &other)),
    }
}

pub(crate) fn check_number(args: &Varargs, index: usize, fname: &str) -> Result<f64, ScriptError> {
    let v = arg(args, index);
    match &v {
        Value::Integer(_) | Value::Number(_) => Ok(v.as_number().unwrap_or(0.0)),
        Value::Str(s) => s
            .to_str()
            .and_then(moat_core::parse_number)
            .and_then(|n| n.as_number())
            .ok_or_else(|| bad_arg(index, fname, "number", &v)),
        other => Err(bad_arg(index, fname, "number", other)),
    }
}

pub(crate) fn check_int(args: &Varargs, index: usize, fname: &str) -> Result<i64, ScriptError> {
    let n = check_number(args, index, fname)?;
    Ok(n.floor() as i64)
}

pub(crate) fn opt_int(
    args: &Varargs,
    index: usize,
    fname: &str,
    default: i64,
) -> Result<i64, ScriptError> {
    if arg(args, index).is_nil() {
        Ok(default)
    } else {
        check_int(args, index, fname)
    }
}

pub(crate) fn check_function(args: &Varargs, index: usize, fname: &str) -> Result<Value, ScriptError> {
    match arg(args, index) {
        v @ Value::Function(_) => Ok(v),
        other => Err(bad_arg(index, fname, "function", &other)),
    }
}

/// Single-value return convention.
pub(crate) fn one(v: Value) -> Result<Varargs, ScriptError> {
    Ok(vec![v])
}

/// No-value return convention.
pub(crate) fn none() -> Result<Varargs, ScriptError> {
    Ok(Vec::new())
}
