//! Reachable-memory estimation
//!
//! A depth-first walk over live values that sums per-variant byte
//! weights. An identity set (pointer identity, not value equality — two
//! equal-but-distinct tables both count) prevents revisiting and breaks
//! cycles, so the walk always terminates.
//!
//! The weights are a contract: hosts make admission-control decisions on
//! this number, so changing a weight is a visible behavior change.
//! Estimation only — nothing is enforced or collected here.

use std::collections::HashSet;

use moat_core::{Function, Value};

use crate::sched::WorkerShared;

/// Flat weight of a registered native callable.
const NATIVE_FN_WEIGHT: usize = 10;
/// Weight per bytecode instruction of a compiled closure.
const CODE_WORD_WEIGHT: usize = 4;

/// Estimates the bytes reachable from `root`.
pub fn reachable_bytes(root: &Value) -> usize {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut pending: Vec<Value> = vec![root.clone()];
    let mut total = 0usize;

    while let Some(value) = pending.pop() {
        if let Some(addr) = value.identity() {
            if !visited.insert(addr) {
                continue;
            }
        }
        match value {
            Value::Nil => {}
            Value::Boolean(_) => total += 1,
            Value::Integer(_) => total += 4,
            Value::Number(_) => total += 8,
            Value::Str(s) => total += s.len(),
            Value::Table(t) => {
                // Both parts count; keys are amortized into their slot
                // and not charged independently.
                let pairs = t.lock().unwrap().pairs_snapshot();
                for (_, v) in pairs {
                    pending.push(v);
                }
            }
            Value::Function(Function::Native(_)) => total += NATIVE_FN_WEIGHT,
            Value::Function(Function::Lua(closure)) => {
                total += CODE_WORD_WEIGHT * closure.proto.code.len();
                for constant in &closure.proto.constants {
                    pending.push(constant.clone());
                }
                for upvalue in &closure.upvalues {
                    // An open upvalue contributes its live stack slot.
                    if let Ok(v) = upvalue.get() {
                        pending.push(v);
                    }
                }
            }
            Value::Thread(t) => {
                if let Some(worker) = t.as_any().downcast_ref::<WorkerShared>() {
                    if let Some(entry) = worker.entry_function() {
                        pending.push(Value::Function(entry));
                    }
                    for v in worker.mailbox_values() {
                        pending.push(v);
                    }
                    // The stack-slot term: every live frame parked on the
                    // worker contributes its register values, whether or
                    // not an upvalue captured them.
                    for regs in worker.live_registers() {
                        for v in regs.get_span(0, regs.len()) {
                            pending.push(v);
                        }
                    }
                }
            }
            // Opaque host payloads report nothing from this walker.
            Value::Userdata(_) => {}
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use moat_core::{Table, new_table_value};

    #[test]
    fn scalar_weights() {
        assert_eq!(reachable_bytes(&Value::Nil), 0);
        assert_eq!(reachable_bytes(&Value::Boolean(true)), 1);
        assert_eq!(reachable_bytes(&Value::Integer(7)), 4);
        assert_eq!(reachable_bytes(&Value::Number(7.0)), 8);
        assert_eq!(reachable_bytes(&Value::from("four")), 4);
    }

    #[test]
    fn table_sums_stored_values_in_both_parts() {
        let t = new_table_value(Table::new());
        {
            let table = t.as_table().unwrap();
            let mut guard = table.lock().unwrap();
            guard.set(Value::Integer(1), Value::Integer(5)).unwrap();
            guard.set(Value::from("key"), Value::Number(1.0)).unwrap();
        }
        // 4 (array integer) + 8 (hash double); the string key is free.
        assert_eq!(reachable_bytes(&t), 12);
    }

    #[test]
    fn cycles_terminate_and_count_once() {
        let t = new_table_value(Table::new());
        {
            let table = t.as_table().unwrap();
            let mut guard = table.lock().unwrap();
            guard.set(Value::from("self"), t.clone()).unwrap();
            guard.set(Value::Integer(1), Value::Integer(1)).unwrap();
        }
        assert_eq!(reachable_bytes(&t), 4);
    }

    #[test]
    fn shared_string_counted_once() {
        let s = Value::from("a rather long string that bypasses the cache....");
        let t = new_table_value(Table::new());
        {
            let table = t.as_table().unwrap();
            let mut guard = table.lock().unwrap();
            guard.set(Value::Integer(1), s.clone()).unwrap();
            guard.set(Value::Integer(2), s.clone()).unwrap();
        }
        assert_eq!(reachable_bytes(&t), s.as_str().unwrap().len());
    }

    #[test]
    fn distinct_equal_tables_both_count() {
        let outer = new_table_value(Table::new());
        let a = new_table_value(Table::new());
        let b = new_table_value(Table::new());
        for (i, inner) in [(1, &a), (2, &b)] {
            let mut guard = inner.as_table().unwrap().lock().unwrap();
            guard.set(Value::Integer(1), Value::Integer(9)).unwrap();
            drop(guard);
            let mut outer_guard = outer.as_table().unwrap().lock().unwrap();
            outer_guard.set(Value::Integer(i), inner.clone()).unwrap();
        }
        // Two distinct tables, equal contents: 4 + 4.
        assert_eq!(reachable_bytes(&outer), 8);
    }
}
