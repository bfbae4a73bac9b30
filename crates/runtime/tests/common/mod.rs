//! Shared harness for the end-to-end tests: a sandbox with the real
//! compiler wired through the loader seam.

use std::sync::Arc;

use moat_core::Prototype;
use moat_runtime::{Globals, GlobalsConfig, Loader, RuntimeError, Value, Varargs};

pub struct SourceCompiler;

impl Loader for SourceCompiler {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String> {
        moat_compiler::compile(source, chunk_name).map_err(|e| e.to_string())
    }
}

pub fn sandbox() -> Globals {
    sandbox_with(GlobalsConfig::default())
}

#[allow(dead_code)]
pub fn sandbox_with(config: GlobalsConfig) -> Globals {
    let globals = Globals::with_config(config);
    globals.install_loader(Arc::new(SourceCompiler));
    globals
}

/// Compiles and runs a chunk, returning whatever it returns.
pub fn run(globals: &Globals, source: &str) -> Result<Varargs, RuntimeError> {
    let chunk = globals.load(source.as_bytes(), "test.lua")?;
    globals.call(&chunk, Vec::new())
}

/// Runs a chunk expected to succeed with a single return value.
#[allow(dead_code)]
pub fn eval(globals: &Globals, source: &str) -> Value {
    let mut values = run(globals, source).unwrap_or_else(|e| panic!("script failed: {e}"));
    assert!(!values.is_empty(), "script returned no values");
    values.remove(0)
}

#[allow(dead_code)]
pub fn eval_int(globals: &Globals, source: &str) -> i64 {
    match eval(globals, source) {
        Value::Integer(i) => i64::from(i),
        Value::Number(n) if n.fract() == 0.0 => n as i64,
        other => panic!("expected an integer, got {other:?}"),
    }
}

#[allow(dead_code)]
pub fn eval_str(globals: &Globals, source: &str) -> String {
    match eval(globals, source) {
        Value::Str(s) => s.display().into_owned(),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[allow(dead_code)]
pub fn eval_bool(globals: &Globals, source: &str) -> bool {
    match eval(globals, source) {
        Value::Boolean(b) => b,
        other => panic!("expected a boolean, got {other:?}"),
    }
}
