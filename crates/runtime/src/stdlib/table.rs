//! Table library
//!
//! Sequence manipulation plus the membership probe. `contains` is native
//! so its cost does not scale with the table: it charges a flat 10
//! instructions, making the price visible to scripts without handing
//! them a cheap unbounded loop.

use moat_core::{ScriptError, Value, Varargs};

use crate::arith;
use crate::globals::Globals;
use crate::meta;
use crate::stdlib::{arg, bad_arg, check_int, check_str, check_table, new_module, one, opt_int, set_fn};
use crate::vm;

/// Flat instruction cost of `table.contains`.
const CONTAINS_COST: u64 = 10;

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "table");

    set_fn(&module, "insert", |args| {
        let t = check_table(&args, 1, "insert")?;
        let mut guard = t.lock().unwrap();
        let len = guard.border();
        match args.len() {
            2 => {
                guard
                    .set(meta::int_or_number(len + 1), arg(&args, 2))
                    .map_err(|e| ScriptError::raised(e.to_string()))?;
            }
            3 => {
                let pos = check_int(&args, 2, "insert")?;
                if pos < 1 || pos > len + 1 {
                    return Err(ScriptError::raised("bad argument #2 to 'insert' (position out of bounds)"));
                }
                let mut i = len;
                while i >= pos {
                    let v = guard.get_int(i);
                    guard
                        .set(meta::int_or_number(i + 1), v)
                        .map_err(|e| ScriptError::raised(e.to_string()))?;
                    i -= 1;
                }
                guard
                    .set(meta::int_or_number(pos), arg(&args, 3))
                    .map_err(|e| ScriptError::raised(e.to_string()))?;
            }
            n => {
                return Err(ScriptError::raised(format!(
                    "wrong number of arguments to 'insert' (got {n})"
                )));
            }
        }
        Ok(Vec::new())
    });

    set_fn(&module, "remove", |args| {
        let t = check_table(&args, 1, "remove")?;
        let mut guard = t.lock().unwrap();
        let len = guard.border();
        let pos = opt_int(&args, 2, "remove", len)?;
        if len == 0 && arg(&args, 2).is_nil() {
            return one(Value::Nil);
        }
        if len + 1 == pos {
            // Removing one past the border is an accepted no-op form.
            let v = guard.get_int(pos);
            guard
                .set(meta::int_or_number(pos), Value::Nil)
                .map_err(|e| ScriptError::raised(e.to_string()))?;
            return one(v);
        }
        if pos < 1 || pos > len {
            return Err(ScriptError::raised(
                "bad argument #2 to 'remove' (position out of bounds)",
            ));
        }
        let removed = guard.get_int(pos);
        let mut i = pos;
        while i < len {
            let v = guard.get_int(i + 1);
            guard
                .set(meta::int_or_number(i), v)
                .map_err(|e| ScriptError::raised(e.to_string()))?;
            i += 1;
        }
        guard
            .set(meta::int_or_number(len), Value::Nil)
            .map_err(|e| ScriptError::raised(e.to_string()))?;
        one(removed)
    });

    set_fn(&module, "concat", |args| {
        let t = check_table(&args, 1, "concat")?;
        let sep = if arg(&args, 2).is_nil() {
            Vec::new()
        } else {
            check_str(&args, 2, "concat")?.as_bytes().to_vec()
        };
        let (elements, from) = {
            let guard = t.lock().unwrap();
            let len = guard.border();
            let from = opt_int(&args, 3, "concat", 1)?;
            let to = opt_int(&args, 4, "concat", len)?;
            let mut elements = Vec::new();
            let mut i = from;
            while i <= to {
                elements.push(guard.get_int(i));
                i += 1;
            }
            (elements, from)
        };
        let cap = crate::limiter::active_string_cap();
        let mut out: Vec<u8> = Vec::new();
        for (idx, v) in elements.iter().enumerate() {
            if idx > 0 {
                out.extend_from_slice(&sep);
            }
            match v {
                Value::Str(s) => out.extend_from_slice(s.as_bytes()),
                Value::Integer(_) | Value::Number(_) => {
                    out.extend_from_slice(v.display_string().as_bytes());
                }
                other => {
                    return Err(ScriptError::raised(format!(
                        "invalid value (at index {}) in table for 'concat' (a {})",
                        from + idx as i64,
                        other.type_name()
                    )));
                }
            }
            if let Some(cap) = cap {
                if out.len() > cap {
                    return Err(ScriptError::StringLimitExceeded { max: cap });
                }
            }
        }
        one(Value::Str(moat_core::LuaStr::from_vec(out)))
    });

    {
        let weak = g.downgrade();
        set_fn(&module, "sort", move |args| {
            let g = weak.upgrade()?;
            let t = check_table(&args, 1, "sort")?;
            let comparator = arg(&args, 2);
            let items = {
                let guard = t.lock().unwrap();
                let len = guard.border();
                let mut items = Vec::with_capacity(len.max(0) as usize);
                let mut i = 1;
                while i <= len {
                    items.push(guard.get_int(i));
                    i += 1;
                }
                items
            };
            let mut less = |a: &Value, b: &Value| -> Result<bool, ScriptError> {
                // Each comparison is metered, so a huge sort cannot dodge
                // the budget just because it runs natively.
                vm::charge_budget(1)?;
                if comparator.is_nil() {
                    arith::less_than(&g, a, b)
                } else {
                    vm::call_value(&g, &comparator, vec![a.clone(), b.clone()])
                        .map(|r| r.first().is_some_and(Value::truthy))
                }
            };
            let items = merge_sort(items, &mut less)?;
            let mut guard = t.lock().unwrap();
            for (i, v) in items.into_iter().enumerate() {
                guard
                    .set(meta::int_or_number(i as i64 + 1), v)
                    .map_err(|e| ScriptError::raised(e.to_string()))?;
            }
            Ok(Vec::new())
        });
    }

    set_fn(&module, "unpack", |args| {
        let t = check_table(&args, 1, "unpack")?;
        let guard = t.lock().unwrap();
        let from = opt_int(&args, 2, "unpack", 1)?;
        let to = opt_int(&args, 3, "unpack", guard.border())?;
        let mut out: Varargs = Vec::new();
        let mut i = from;
        while i <= to {
            out.push(guard.get_int(i));
            i += 1;
        }
        Ok(out)
    });

    set_fn(&module, "pack", |args| {
        let t = moat_core::Table::with_capacity(args.len(), 1);
        let packed = moat_core::new_table_value(t);
        {
            let table = packed.as_table().expect("just built");
            let mut guard = table.lock().unwrap();
            for (i, v) in args.iter().enumerate() {
                guard
                    .set(meta::int_or_number(i as i64 + 1), v.clone())
                    .map_err(|e| ScriptError::raised(e.to_string()))?;
            }
            guard
                .set(Value::from("n"), meta::int_or_number(args.len() as i64))
                .map_err(|e| ScriptError::raised(e.to_string()))?;
        }
        one(packed)
    });

    set_fn(&module, "contains", |args: Varargs| {
        // Fixed cost regardless of table size, charged up front.
        vm::charge_budget(CONTAINS_COST)?;
        let t = check_table(&args, 1, "contains")?;
        let needle = arg(&args, 2);
        if needle.is_nil() {
            return Err(bad_arg(2, "contains", "value", &needle));
        }
        let found = t
            .lock()
            .unwrap()
            .pairs_snapshot()
            .iter()
            .any(|(_, v)| v.raw_eq(&needle));
        one(Value::Boolean(found))
    });
}

/// Stable merge sort with a fallible ordering: an inconsistent script
/// comparator degrades the ordering, never the host.
fn merge_sort(
    mut items: Vec<Value>,
    less: &mut impl FnMut(&Value, &Value) -> Result<bool, ScriptError>,
) -> Result<Vec<Value>, ScriptError> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, less)?;
    let right = merge_sort(right, less)?;
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut l = left.into_iter().peekable();
    let mut r = right.into_iter().peekable();
    loop {
        match (l.peek(), r.peek()) {
            (Some(a), Some(b)) => {
                if less(b, a)? {
                    out.push(r.next().expect("peeked"));
                } else {
                    out.push(l.next().expect("peeked"));
                }
            }
            (Some(_), None) => out.push(l.next().expect("peeked")),
            (None, Some(_)) => out.push(r.next().expect("peeked")),
            (None, None) => return Ok(out),
        }
    }
}
