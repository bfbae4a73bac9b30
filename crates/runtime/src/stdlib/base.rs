//! Base functions
//!
//! The top-level surface: printing through the bounded host queue,
//! protected calls, raw table access, metatable management, and source
//! loading through the installed compiler. `load` accepts source text
//! only — input starting with the binary chunk marker is rejected
//! outright.

use moat_core::{Function, ScriptError, Value};

use crate::globals::Globals;
use crate::meta;
use crate::sched;
use crate::stdlib::{arg, bad_arg, check_table, one};
use crate::vm;

/// Leading byte of precompiled chunks; never accepted as input.
const BYTECODE_MARKER: u8 = 0x1b;

pub(crate) fn install(g: &Globals) {
    let weak = g.downgrade();
    let env = g.env();

    g.set("_G", g.env_value());
    g.set("_VERSION", Value::from("Lua 5.2"));

    {
        let weak = weak.clone();
        g.register("print", move |args| {
            let g = weak.upgrade()?;
            let mut parts = Vec::with_capacity(args.len());
            for v in &args {
                parts.push(meta::tostring(&g, v)?);
            }
            let line = parts.join("\t");
            // Cooperative back-pressure: a worker facing a full queue
            // yields nil and retries on the next resume. The main caller
            // has no yield path, so the queue evicts its oldest entry.
            loop {
                if g.console().try_push(line.clone()) {
                    return Ok(Vec::new());
                }
                if sched::in_worker() {
                    sched::yield_values(vec![Value::Nil])?;
                } else {
                    g.console().push_evicting(line);
                    return Ok(Vec::new());
                }
            }
        });
    }

    g.register("type", |args| {
        one(Value::from(arg(&args, 1).type_name()))
    });

    {
        let weak = weak.clone();
        g.register("tostring", move |args| {
            let g = weak.upgrade()?;
            one(Value::from(meta::tostring(&g, &arg(&args, 1))?))
        });
    }

    g.register("tonumber", |args| {
        let v = arg(&args, 1);
        let base = arg(&args, 2);
        if base.is_nil() {
            return one(match &v {
                Value::Integer(_) | Value::Number(_) => v.clone(),
                Value::Str(s) => s
                    .to_str()
                    .and_then(moat_core::parse_number)
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            });
        }
        let base = base
            .as_integer()
            .filter(|b| (2..=36).contains(b))
            .ok_or_else(|| bad_arg(2, "tonumber", "base in [2,36]", &base))?;
        let text = match &v {
            Value::Str(s) => s.display().trim().to_ascii_lowercase(),
            other => return Err(bad_arg(1, "tonumber", "string", other)),
        };
        match i64::from_str_radix(&text, base as u32) {
            Ok(n) => one(meta::int_or_number(n)),
            Err(_) => one(Value::Nil),
        }
    });

    {
        let weak = weak.clone();
        g.register("ipairs", move |args| {
            let weak = weak.clone();
            let t = arg(&args, 1);
            if t.as_table().is_none() {
                return Err(bad_arg(1, "ipairs", "table", &t));
            }
            let iter = moat_core::NativeFunction::new("ipairs.iterator", move |args| {
                let g = weak.upgrade()?;
                let t = arg(&args, 1);
                let i = arg(&args, 2).as_integer().unwrap_or(0) + 1;
                let v = meta::index(&g, &t, &meta::int_or_number(i))?;
                if v.is_nil() {
                    Ok(vec![Value::Nil])
                } else {
                    Ok(vec![meta::int_or_number(i), v])
                }
            });
            Ok(vec![
                Value::Function(Function::Native(iter)),
                t,
                Value::Integer(0),
            ])
        });
    }

    g.register("next", |args| {
        let t = check_table(&args, 1, "next")?;
        let key = arg(&args, 2);
        let entry = t
            .lock()
            .unwrap()
            .next(&key)
            .map_err(|e| ScriptError::raised(e.to_string()))?;
        match entry {
            Some((k, v)) => Ok(vec![k, v]),
            None => Ok(vec![Value::Nil]),
        }
    });

    {
        let weak = weak.clone();
        let next_fn = env
            .lock()
            .unwrap()
            .get(&Value::from("next"));
        g.register("pairs", move |args| {
            let v = arg(&args, 1);
            let g = weak.upgrade()?;
            // 5.2 semantics: __pairs overrides the raw walk.
            if let Some(handler) = meta::metamethod(&g, &v, "__pairs") {
                let mut results = vm::call_value(&g, &handler, vec![v])?;
                results.resize(3, Value::Nil);
                return Ok(results);
            }
            check_table(&args, 1, "pairs")?;
            Ok(vec![next_fn.clone(), v, Value::Nil])
        });
    }

    g.register("select", |args| {
        let selector = arg(&args, 1);
        if let Value::Str(s) = &selector {
            if s.as_bytes() == b"#" {
                return one(meta::int_or_number(args.len() as i64 - 1));
            }
        }
        let n = selector
            .as_integer()
            .filter(|n| *n != 0)
            .ok_or_else(|| bad_arg(1, "select", "number", &selector))?;
        if n < 0 {
            let n = (-n) as usize;
            if n >= args.len() {
                return Err(bad_arg(1, "select", "index in range", &selector));
            }
            return Ok(args[args.len() - n..].to_vec());
        }
        let n = n as usize;
        if n >= args.len() {
            return Ok(Vec::new());
        }
        Ok(args[n..].to_vec())
    });

    g.register("rawget", |args| {
        let t = check_table(&args, 1, "rawget")?;
        let key = arg(&args, 2);
        let v = t.lock().unwrap().get(&key);
        one(v)
    });

    g.register("rawset", |args| {
        let t = check_table(&args, 1, "rawset")?;
        t.lock()
            .unwrap()
            .set(arg(&args, 2), arg(&args, 3))
            .map_err(|e| ScriptError::raised(e.to_string()))?;
        one(arg(&args, 1))
    });

    g.register("rawequal", |args| {
        one(Value::Boolean(arg(&args, 1).raw_eq(&arg(&args, 2))))
    });

    g.register("rawlen", |args| match arg(&args, 1) {
        Value::Table(t) => one(meta::int_or_number(t.lock().unwrap().border())),
        Value::Str(s) => one(meta::int_or_number(s.len() as i64)),
        other => Err(bad_arg(1, "rawlen", "table or string", &other)),
    });

    {
        let weak = weak.clone();
        g.register("setmetatable", move |args| {
            let g = weak.upgrade()?;
            let t = check_table(&args, 1, "setmetatable")?;
            let mt = arg(&args, 2);
            if meta::metamethod(&g, &arg(&args, 1), "__metatable").is_some() {
                return Err(ScriptError::raised("cannot change a protected metatable"));
            }
            match &mt {
                Value::Nil => {
                    let mut guard = t.lock().unwrap();
                    guard.set_metatable(None);
                    guard.set_weak_mode(moat_core::WeakMode::default());
                }
                Value::Table(m) => {
                    // Read __mode before taking the subject's lock; the
                    // metatable may be the subject itself.
                    let mode = m.lock().unwrap().get(&Value::from("__mode"));
                    let weak_mode = match &mode {
                        Value::Str(s) => moat_core::WeakMode::from_mode_string(s),
                        _ => moat_core::WeakMode::default(),
                    };
                    let mut guard = t.lock().unwrap();
                    guard.set_metatable(Some(m.clone()));
                    guard.set_weak_mode(weak_mode);
                }
                other => return Err(bad_arg(2, "setmetatable", "nil or table", other)),
            }
            one(arg(&args, 1))
        });
    }

    {
        let weak = weak.clone();
        g.register("getmetatable", move |args| {
            let g = weak.upgrade()?;
            let v = arg(&args, 1);
            if let Some(protected) = meta::metamethod(&g, &v, "__metatable") {
                return one(protected);
            }
            match meta::get_metatable(&g, &v) {
                Some(mt) => one(Value::Table(mt)),
                None => one(Value::Nil),
            }
        });
    }

    g.register("assert", |args| {
        if arg(&args, 1).truthy() {
            return Ok(args);
        }
        let message = arg(&args, 2);
        if message.is_nil() {
            Err(ScriptError::raised("assertion failed!"))
        } else {
            Err(ScriptError::Raised {
                value: message,
                traceback: None,
            })
        }
    });

    g.register("error", |args| {
        let value = arg(&args, 1);
        let level = arg(&args, 2).as_integer().unwrap_or(1);
        // String messages at level >= 1 get the caller's position, the
        // same prefix the interpreter puts on its own raises.
        let value = match (&value, level) {
            (Value::Str(s), level) if level >= 1 => match vm::current_location() {
                Some((source, line)) => Value::from(format!("{source}:{line}: {s}")),
                None => value.clone(),
            },
            _ => value.clone(),
        };
        Err(ScriptError::Raised {
            value,
            traceback: Some(vm::traceback()),
        })
    });

    {
        let weak = weak.clone();
        g.register("pcall", move |mut args| {
            let g = weak.upgrade()?;
            if args.is_empty() {
                return Err(bad_arg(1, "pcall", "value", &Value::Nil));
            }
            let f = args.remove(0);
            match vm::call_value(&g, &f, args) {
                Ok(mut results) => {
                    let mut out = vec![Value::Boolean(true)];
                    out.append(&mut results);
                    Ok(out)
                }
                // Budget exhaustion and orphan signals pass straight
                // through: a protected call is not a shield against the
                // sandbox.
                Err(e) if !e.catchable() => Err(e),
                Err(e) => Ok(vec![Value::Boolean(false), e.value()]),
            }
        });
    }

    {
        let weak = weak.clone();
        g.register("xpcall", move |mut args| {
            let g = weak.upgrade()?;
            if args.len() < 2 {
                return Err(bad_arg(2, "xpcall", "value", &Value::Nil));
            }
            let f = args.remove(0);
            let handler = args.remove(0);
            match vm::call_value(&g, &f, args) {
                Ok(mut results) => {
                    let mut out = vec![Value::Boolean(true)];
                    out.append(&mut results);
                    Ok(out)
                }
                Err(e) if !e.catchable() => Err(e),
                Err(e) => {
                    // The handler runs once; a failure inside it is not
                    // re-handled.
                    let handled = vm::call_value(&g, &handler, vec![e.value()])
                        .map(|r| r.into_iter().next().unwrap_or(Value::Nil))
                        .unwrap_or_else(|_| Value::from("error in error handling"));
                    Ok(vec![Value::Boolean(false), handled])
                }
            }
        });
    }

    {
        let weak = weak.clone();
        g.register("load", move |args| {
            let g = weak.upgrade()?;
            let chunk = arg(&args, 1);
            let name = match arg(&args, 2) {
                Value::Str(s) => s.display().into_owned(),
                _ => "=(load)".to_string(),
            };
            let source = match &chunk {
                Value::Str(s) => s.as_bytes().to_vec(),
                other => return Err(bad_arg(1, "load", "string", other)),
            };
            if source.first() == Some(&BYTECODE_MARKER) {
                return Ok(vec![
                    Value::Nil,
                    Value::from("binary chunks are not accepted"),
                ]);
            }
            match g.load(&source, &name) {
                Ok(f) => one(f),
                Err(e) => Ok(vec![Value::Nil, Value::from(e.to_string())]),
            }
        });
    }

    {
        let weak = weak.clone();
        g.register("collectgarbage", move |args| {
            let g = weak.upgrade()?;
            let option = match arg(&args, 1) {
                Value::Str(s) => s.display().into_owned(),
                Value::Nil => "collect".to_string(),
                other => return Err(bad_arg(1, "collectgarbage", "string", &other)),
            };
            match option.as_str() {
                "count" => one(Value::Number(g.used_memory() as f64 / 1024.0)),
                "collect" | "step" => {
                    moat_core::drain_string_cache();
                    one(Value::Integer(0))
                }
                _ => one(Value::Integer(0)),
            }
        });
    }
}
