//! Metatable dispatch
//!
//! Tables and userdata carry their own metatable; every other type
//! resolves through its class-level metatable on the sandbox. Index and
//! newindex walk handler chains with a bounded depth so a cyclic
//! `__index` graph cannot hang the interpreter.

use moat_core::{ScriptError, TableRef, Value};

use crate::globals::Globals;
use crate::vm;

/// Longest `__index`/`__newindex` handler chain before we assume a loop.
const MAX_CHAIN: usize = 100;

/// The metatable governing a value, if any.
pub fn get_metatable(g: &Globals, v: &Value) -> Option<TableRef> {
    match v {
        Value::Table(t) => t.lock().unwrap().metatable(),
        Value::Userdata(u) => u.metatable.lock().unwrap().clone(),
        other => g.class_metatable(other.type_name()),
    }
}

/// A non-nil metamethod for `v`, if present.
pub fn metamethod(g: &Globals, v: &Value, event: &str) -> Option<Value> {
    let mt = get_metatable(g, v)?;
    let handler = mt.lock().unwrap().get(&Value::from(event));
    if handler.is_nil() { None } else { Some(handler) }
}

fn first_result(results: Vec<Value>) -> Value {
    results.into_iter().next().unwrap_or(Value::Nil)
}

/// `t[key]` with full metamethod semantics.
pub fn index(g: &Globals, t: &Value, key: &Value) -> Result<Value, ScriptError> {
    let mut current = t.clone();
    for _ in 0..MAX_CHAIN {
        match &current {
            Value::Table(table) => {
                let (raw, mt) = {
                    let guard = table.lock().unwrap();
                    (guard.get(key), guard.metatable())
                };
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let Some(mt) = mt else {
                    return Ok(Value::Nil);
                };
                let handler = mt.lock().unwrap().get(&Value::from("__index"));
                match handler {
                    Value::Nil => return Ok(Value::Nil),
                    Value::Function(_) => {
                        return vm::call_value(g, &handler, vec![current, key.clone()])
                            .map(first_result);
                    }
                    other => current = other,
                }
            }
            other => {
                let Some(handler) = metamethod(g, other, "__index") else {
                    return Err(ScriptError::raised(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )));
                };
                if let Value::Function(_) = handler {
                    return vm::call_value(g, &handler, vec![current, key.clone()])
                        .map(first_result);
                }
                current = handler;
            }
        }
    }
    Err(ScriptError::raised("'__index' chain too long; possible loop"))
}

/// `t[key] = value` with full metamethod semantics.
pub fn new_index(g: &Globals, t: &Value, key: Value, value: Value) -> Result<(), ScriptError> {
    let mut current = t.clone();
    for _ in 0..MAX_CHAIN {
        match &current {
            Value::Table(table) => {
                let handler = {
                    let guard = table.lock().unwrap();
                    let existing = guard.get(&key);
                    if !existing.is_nil() {
                        None
                    } else {
                        guard
                            .metatable()
                            .map(|mt| mt.lock().unwrap().get(&Value::from("__newindex")))
                            .filter(|h| !h.is_nil())
                    }
                };
                match handler {
                    None => {
                        return table
                            .lock()
                            .unwrap()
                            .set(key, value)
                            .map_err(|e| ScriptError::raised(e.to_string()));
                    }
                    Some(Value::Function(f)) => {
                        return vm::call_value(
                            g,
                            &Value::Function(f),
                            vec![current, key, value],
                        )
                        .map(|_| ());
                    }
                    Some(other) => current = other,
                }
            }
            other => {
                let Some(handler) = metamethod(g, other, "__newindex") else {
                    return Err(ScriptError::raised(format!(
                        "attempt to index a {} value",
                        other.type_name()
                    )));
                };
                if let Value::Function(_) = handler {
                    return vm::call_value(g, &handler, vec![current, key, value]).map(|_| ());
                }
                current = handler;
            }
        }
    }
    Err(ScriptError::raised(
        "'__newindex' chain too long; possible loop",
    ))
}

/// The `#` operator: byte length for strings, a border for tables,
/// `__len` everywhere it is defined.
pub fn length_of(g: &Globals, v: &Value) -> Result<Value, ScriptError> {
    if let Value::Str(s) = v {
        return Ok(int_or_number(s.len() as i64));
    }
    if let Some(handler) = metamethod(g, v, "__len") {
        return vm::call_value(g, &handler, vec![v.clone()]).map(first_result);
    }
    if let Value::Table(t) = v {
        return Ok(int_or_number(t.lock().unwrap().border()));
    }
    Err(ScriptError::raised(format!(
        "attempt to get length of a {} value",
        v.type_name()
    )))
}

/// `tostring` semantics: `__tostring` wins, otherwise the primitive
/// rendering.
pub fn tostring(g: &Globals, v: &Value) -> Result<String, ScriptError> {
    if let Some(handler) = metamethod(g, v, "__tostring") {
        let result = vm::call_value(g, &handler, vec![v.clone()]).map(first_result)?;
        return Ok(result.display_string());
    }
    Ok(v.display_string())
}

pub(crate) fn int_or_number(n: i64) -> Value {
    match i32::try_from(n) {
        Ok(i) => Value::Integer(i),
        Err(_) => Value::Number(n as f64),
    }
}
