//! String library
//!
//! Byte-oriented, 1-based, negative indices count from the end. The
//! string class metatable routes method syntax (`s:upper()`) here. Any
//! function that can grow its output (`rep`, `format`, `gsub`) checks
//! the active string size cap before materializing.

use std::sync::Mutex;

use moat_core::{Function, LuaStr, NativeFunction, ScriptError, Table, Value, Varargs};

use crate::globals::Globals;
use crate::limiter;
use crate::meta;
use crate::stdlib::pattern::{self, CapSpan};
use crate::stdlib::{arg, bad_arg, check_int, check_str, new_module, one, opt_int, set_fn};
use crate::vm;

/// Clamps a script index (1-based, negative-from-end) to a byte offset.
fn rel_index(pos: i64, len: usize) -> i64 {
    if pos >= 0 { pos } else { len as i64 + pos + 1 }
}

fn cap_guard(len: usize) -> Result<(), ScriptError> {
    if let Some(cap) = limiter::active_string_cap() {
        if len > cap {
            return Err(ScriptError::StringLimitExceeded { max: cap });
        }
    }
    Ok(())
}

fn capture_value(src: &[u8], cap: &CapSpan) -> Value {
    match cap {
        CapSpan::Str(start, end) => Value::Str(LuaStr::new(&src[*start..*end])),
        CapSpan::Pos(p) => meta::int_or_number(*p as i64),
    }
}

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "string");

    set_fn(&module, "len", |args| {
        let s = check_str(&args, 1, "len")?;
        one(meta::int_or_number(s.len() as i64))
    });

    set_fn(&module, "sub", |args| {
        let s = check_str(&args, 1, "sub")?;
        let len = s.len();
        let i = rel_index(opt_int(&args, 2, "sub", 1)?, len).max(1);
        let j = rel_index(opt_int(&args, 3, "sub", -1)?, len).min(len as i64);
        if i > j {
            return one(Value::from(""));
        }
        one(Value::Str(LuaStr::new(
            &s.as_bytes()[i as usize - 1..j as usize],
        )))
    });

    set_fn(&module, "upper", |args| {
        let s = check_str(&args, 1, "upper")?;
        one(Value::Str(LuaStr::from_vec(
            s.as_bytes().to_ascii_uppercase(),
        )))
    });

    set_fn(&module, "lower", |args| {
        let s = check_str(&args, 1, "lower")?;
        one(Value::Str(LuaStr::from_vec(
            s.as_bytes().to_ascii_lowercase(),
        )))
    });

    set_fn(&module, "rep", |args| {
        let s = check_str(&args, 1, "rep")?;
        let n = check_int(&args, 2, "rep")?;
        let sep = if arg(&args, 3).is_nil() {
            Vec::new()
        } else {
            check_str(&args, 3, "rep")?.as_bytes().to_vec()
        };
        if n <= 0 {
            return one(Value::from(""));
        }
        let n = n as usize;
        let total = s
            .len()
            .checked_mul(n)
            .and_then(|b| b.checked_add(sep.len() * (n - 1)))
            .ok_or(ScriptError::StringLimitExceeded { max: usize::MAX })?;
        cap_guard(total)?;
        let mut out = Vec::with_capacity(total);
        for i in 0..n {
            if i > 0 {
                out.extend_from_slice(&sep);
            }
            out.extend_from_slice(s.as_bytes());
        }
        one(Value::Str(LuaStr::from_vec(out)))
    });

    set_fn(&module, "reverse", |args| {
        let s = check_str(&args, 1, "reverse")?;
        let mut bytes = s.as_bytes().to_vec();
        bytes.reverse();
        one(Value::Str(LuaStr::from_vec(bytes)))
    });

    set_fn(&module, "byte", |args| {
        let s = check_str(&args, 1, "byte")?;
        let len = s.len();
        let i = rel_index(opt_int(&args, 2, "byte", 1)?, len).max(1);
        let j = rel_index(opt_int(&args, 3, "byte", i)?, len).min(len as i64);
        let mut out = Vec::new();
        let bytes = s.as_bytes();
        let mut k = i;
        while k <= j {
            out.push(Value::Integer(i32::from(bytes[k as usize - 1])));
            k += 1;
        }
        Ok(out)
    });

    set_fn(&module, "char", |args| {
        let mut bytes = Vec::with_capacity(args.len());
        for index in 1..=args.len() {
            let n = check_int(&args, index, "char")?;
            let b = u8::try_from(n)
                .map_err(|_| bad_arg(index, "char", "value in [0,255]", &arg(&args, index)))?;
            bytes.push(b);
        }
        one(Value::Str(LuaStr::from_vec(bytes)))
    });

    set_fn(&module, "format", |args| {
        let spec = check_str(&args, 1, "format")?;
        let out = format_impl(&spec, &args)?;
        cap_guard(out.len())?;
        one(Value::Str(LuaStr::from_vec(out)))
    });

    set_fn(&module, "find", |args| {
        let s = check_str(&args, 1, "find")?;
        let pat = check_str(&args, 2, "find")?;
        let init = rel_index(opt_int(&args, 3, "find", 1)?, s.len()).max(1) as usize - 1;
        let plain = arg(&args, 4).truthy();
        if plain {
            let hay = s.as_bytes();
            let needle = pat.as_bytes();
            if init <= hay.len() {
                let found = hay[init..]
                    .windows(needle.len().max(1))
                    .position(|w| w == needle)
                    .map(|p| p + init);
                if needle.is_empty() {
                    return Ok(vec![
                        meta::int_or_number(init as i64 + 1),
                        meta::int_or_number(init as i64),
                    ]);
                }
                if let Some(start) = found {
                    return Ok(vec![
                        meta::int_or_number(start as i64 + 1),
                        meta::int_or_number((start + needle.len()) as i64),
                    ]);
                }
            }
            return one(Value::Nil);
        }
        match pattern::first_match(s.as_bytes(), pat.as_bytes(), init)? {
            None => one(Value::Nil),
            Some(m) => {
                let mut out = vec![
                    meta::int_or_number(m.start as i64 + 1),
                    meta::int_or_number(m.end as i64),
                ];
                // Explicit captures ride after the range.
                for cap in &m.captures {
                    out.push(capture_value(s.as_bytes(), cap));
                }
                Ok(out)
            }
        }
    });

    set_fn(&module, "match", |args| {
        let s = check_str(&args, 1, "match")?;
        let pat = check_str(&args, 2, "match")?;
        let init = rel_index(opt_int(&args, 3, "match", 1)?, s.len()).max(1) as usize - 1;
        match pattern::first_match(s.as_bytes(), pat.as_bytes(), init)? {
            None => one(Value::Nil),
            Some(m) if m.captures.is_empty() => one(Value::Str(LuaStr::new(
                &s.as_bytes()[m.start..m.end],
            ))),
            Some(m) => Ok(m
                .captures
                .iter()
                .map(|c| capture_value(s.as_bytes(), c))
                .collect()),
        }
    });

    set_fn(&module, "gmatch", |args| {
        let s = check_str(&args, 1, "gmatch")?;
        let pat = check_str(&args, 2, "gmatch")?;
        let position = Mutex::new(0usize);
        let iter = NativeFunction::new("gmatch.iterator", move |_| {
            let mut pos = position.lock().unwrap();
            while *pos <= s.len() {
                match pattern::first_match(s.as_bytes(), pat.as_bytes(), *pos)? {
                    None => break,
                    Some(m) => {
                        // An empty match still advances the scan.
                        *pos = if m.end > m.start { m.end } else { m.end + 1 };
                        if m.captures.is_empty() {
                            return Ok(vec![Value::Str(LuaStr::new(
                                &s.as_bytes()[m.start..m.end],
                            ))]);
                        }
                        return Ok(m
                            .captures
                            .iter()
                            .map(|c| capture_value(s.as_bytes(), c))
                            .collect());
                    }
                }
            }
            Ok(vec![Value::Nil])
        });
        one(Value::Function(Function::Native(iter)))
    });

    {
        let weak = g.downgrade();
        set_fn(&module, "gsub", move |args| {
            let g = weak.upgrade()?;
            let s = check_str(&args, 1, "gsub")?;
            let pat = check_str(&args, 2, "gsub")?;
            let repl = arg(&args, 3);
            let max_n = opt_int(&args, 4, "gsub", i64::MAX)?;
            gsub_impl(&g, &s, &pat, &repl, max_n)
        });
    }

    // Method syntax: the string class metatable indexes into this module.
    let class_mt = std::sync::Arc::new(Mutex::new(Table::new()));
    class_mt
        .lock()
        .unwrap()
        .set(Value::from("__index"), Value::Table(module.clone()))
        .expect("string key");
    g.set_class_metatable("string", class_mt);
}

fn gsub_impl(
    g: &Globals,
    s: &LuaStr,
    pat: &LuaStr,
    repl: &Value,
    max_n: i64,
) -> Result<Varargs, ScriptError> {
    let src = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut pos = 0usize;
    let mut count = 0i64;
    while count < max_n && pos <= src.len() {
        let Some(m) = pattern::first_match(src, pat.as_bytes(), pos)? else {
            break;
        };
        count += 1;
        let whole = &src[m.start..m.end];
        out.extend_from_slice(&src[pos..m.start]);
        let whole_value = || Value::Str(LuaStr::new(whole));
        let replacement: Option<Vec<u8>> = match repl {
            Value::Str(r) => Some(expand_replacement(r.as_bytes(), src, whole, &m.captures)?),
            Value::Table(t) => {
                let key = match m.captures.first() {
                    Some(cap) => capture_value(src, cap),
                    None => whole_value(),
                };
                let v = t.lock().unwrap().get(&key);
                replacement_value(&v, whole)?
            }
            Value::Function(_) => {
                let call_args: Varargs = if m.captures.is_empty() {
                    vec![whole_value()]
                } else {
                    m.captures
                        .iter()
                        .map(|c| capture_value(src, c))
                        .collect()
                };
                let result = vm::call_value(g, repl, call_args)?;
                replacement_value(result.first().unwrap_or(&Value::Nil), whole)?
            }
            other @ (Value::Integer(_) | Value::Number(_)) => {
                Some(other.display_string().into_bytes())
            }
            other => {
                return Err(bad_arg(3, "gsub", "string/function/table", other));
            }
        };
        match replacement {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => out.extend_from_slice(whole),
        }
        cap_guard(out.len())?;
        if m.end > m.start {
            pos = m.end;
        } else {
            // Empty match: copy one byte through and advance.
            if m.end < src.len() {
                out.push(src[m.end]);
            }
            pos = m.end + 1;
        }
    }
    if pos < src.len() {
        out.extend_from_slice(&src[pos..]);
    }
    cap_guard(out.len())?;
    Ok(vec![
        Value::Str(LuaStr::from_vec(out)),
        meta::int_or_number(count),
    ])
}

/// A false/nil replacement keeps the original match; strings and numbers
/// substitute; anything else is an error.
fn replacement_value(v: &Value, _whole: &[u8]) -> Result<Option<Vec<u8>>, ScriptError> {
    match v {
        Value::Nil | Value::Boolean(false) => Ok(None),
        Value::Str(s) => Ok(Some(s.as_bytes().to_vec())),
        Value::Integer(_) | Value::Number(_) => Ok(Some(v.display_string().into_bytes())),
        other => Err(ScriptError::raised(format!(
            "invalid replacement value (a {})",
            other.type_name()
        ))),
    }
}

/// `%0`..`%9` references inside a string replacement.
fn expand_replacement(
    repl: &[u8],
    src: &[u8],
    whole: &[u8],
    captures: &[CapSpan],
) -> Result<Vec<u8>, ScriptError> {
    let mut out = Vec::with_capacity(repl.len());
    let mut i = 0;
    while i < repl.len() {
        let b = repl[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        match repl.get(i) {
            None => return Err(ScriptError::raised("invalid use of '%' in replacement string")),
            Some(b'%') => out.push(b'%'),
            Some(d @ b'0'..=b'9') => {
                let index = usize::from(d - b'0');
                if index == 0 || (index == 1 && captures.is_empty()) {
                    out.extend_from_slice(whole);
                } else {
                    let cap = captures
                        .get(index - 1)
                        .ok_or_else(|| ScriptError::raised("invalid capture index"))?;
                    match cap {
                        CapSpan::Str(s0, e0) => out.extend_from_slice(&src[*s0..*e0]),
                        CapSpan::Pos(p) => out.extend_from_slice(p.to_string().as_bytes()),
                    }
                }
            }
            Some(_) => {
                return Err(ScriptError::raised("invalid use of '%' in replacement string"));
            }
        }
        i += 1;
    }
    Ok(out)
}

/// `string.format` directive subset: `%d %i %u %o %x %X %c %f %e %E %g
/// %G %s %q %%` with width, precision, `-`, `0` flags.
fn format_impl(spec: &LuaStr, args: &Varargs) -> Result<Vec<u8>, ScriptError> {
    let bytes = spec.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut next_arg = 2usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }
        let mut left = false;
        let mut zero = false;
        while let Some(&f) = bytes.get(i) {
            match f {
                b'-' => left = true,
                b'0' => zero = true,
                b'+' | b' ' | b'#' => {}
                _ => break,
            }
            i += 1;
        }
        let mut width = 0usize;
        while let Some(d) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
            width = width * 10 + usize::from(d - b'0');
            i += 1;
        }
        let mut precision: Option<usize> = None;
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            let mut p = 0usize;
            while let Some(d) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
                p = p * 10 + usize::from(d - b'0');
                i += 1;
            }
            precision = Some(p);
        }
        let conv = *bytes
            .get(i)
            .ok_or_else(|| ScriptError::raised("invalid format string to 'format'"))?;
        i += 1;
        let formatted: String = match conv {
            b'd' | b'i' => check_int(args, next_arg, "format")?.to_string(),
            b'u' => (check_int(args, next_arg, "format")? as u64).to_string(),
            b'o' => format!("{:o}", check_int(args, next_arg, "format")?),
            b'x' => format!("{:x}", check_int(args, next_arg, "format")?),
            b'X' => format!("{:X}", check_int(args, next_arg, "format")?),
            b'c' => {
                let n = check_int(args, next_arg, "format")?;
                let b = u8::try_from(n)
                    .map_err(|_| bad_arg(next_arg, "format", "byte value", &arg(args, next_arg)))?;
                (b as char).to_string()
            }
            b'f' | b'F' => {
                let n = crate::stdlib::check_number(args, next_arg, "format")?;
                format!("{:.*}", precision.unwrap_or(6), n)
            }
            b'e' => {
                let n = crate::stdlib::check_number(args, next_arg, "format")?;
                format!("{:.*e}", precision.unwrap_or(6), n)
            }
            b'E' => {
                let n = crate::stdlib::check_number(args, next_arg, "format")?;
                format!("{:.*E}", precision.unwrap_or(6), n)
            }
            b'g' | b'G' => {
                let n = crate::stdlib::check_number(args, next_arg, "format")?;
                moat_core::fmt_number(n)
            }
            b's' => {
                let v = arg(args, next_arg);
                let mut s = v.display_string();
                if let Some(p) = precision {
                    s.truncate(p);
                }
                s
            }
            b'q' => {
                let s = check_str(args, next_arg, "format")?;
                let mut quoted = String::with_capacity(s.len() + 2);
                quoted.push('"');
                for &b in s.as_bytes() {
                    match b {
                        b'"' => quoted.push_str("\\\""),
                        b'\\' => quoted.push_str("\\\\"),
                        b'\n' => quoted.push_str("\\n"),
                        b'\r' => quoted.push_str("\\r"),
                        0 => quoted.push_str("\\0"),
                        _ => quoted.push(b as char),
                    }
                }
                quoted.push('"');
                next_arg += 1;
                out.extend_from_slice(quoted.as_bytes());
                continue;
            }
            other => {
                return Err(ScriptError::raised(format!(
                    "invalid option '%{}' to 'format'",
                    other as char
                )));
            }
        };
        next_arg += 1;
        let pad = width.saturating_sub(formatted.len());
        if pad > 0 && !left {
            let fill = if zero && formatted.starts_with('-') {
                out.push(b'-');
                out.extend(std::iter::repeat_n(b'0', pad));
                out.extend_from_slice(formatted[1..].as_bytes());
                continue;
            } else if zero {
                b'0'
            } else {
                b' '
            };
            out.extend(std::iter::repeat_n(fill, pad));
        }
        out.extend_from_slice(formatted.as_bytes());
        if pad > 0 && left {
            out.extend(std::iter::repeat_n(b' ', pad));
        }
    }
    Ok(out)
}
