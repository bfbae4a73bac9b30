//! Arithmetic, comparison and concatenation
//!
//! Integer ⊕ integer stays integer when the result is representable:
//! operands widen to 64 bits, the operation runs exactly, and the result
//! demotes back to the 32-bit tag on store — anything wider becomes a
//! double. Any double operand promotes the whole operation. Strings that
//! parse as numbers participate as doubles; division is always a double;
//! modulo follows floored division.

use moat_core::{LuaStr, ScriptError, Value, fmt_number, parse_number};

use crate::globals::Globals;
use crate::limiter;
use crate::meta;
use crate::vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::Unm => "__unm",
        }
    }
}

enum Operand {
    Int(i64),
    Float(f64),
}

/// Numeric view of an operand. String operands that parse as numbers
/// participate as doubles; everything else defers to metamethods.
fn numeric(v: &Value) -> Option<Operand> {
    match v {
        Value::Integer(i) => Some(Operand::Int(i64::from(*i))),
        Value::Number(n) => Some(Operand::Float(*n)),
        Value::Str(s) => {
            let text = s.to_str()?;
            match parse_number(text)? {
                Value::Integer(i) => Some(Operand::Float(f64::from(i))),
                Value::Number(n) => Some(Operand::Float(n)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Demotes an exact 64-bit result onto the integer tag when it fits.
fn narrow(wide: i64) -> Value {
    match i32::try_from(wide) {
        Ok(i) => Value::Integer(i),
        Err(_) => Value::Number(wide as f64),
    }
}

fn float_floor_mod(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

fn int_floor_mod(a: i64, b: i64) -> Result<i64, ScriptError> {
    if b == 0 {
        return Err(ScriptError::raised("attempt to perform 'n%%0'"));
    }
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

/// A binary arithmetic operation with coercion and metamethod fallback.
pub fn binary(g: &Globals, op: ArithOp, a: &Value, b: &Value) -> Result<Value, ScriptError> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return numeric_binary(op, x, y);
    }
    metamethod_fallback(g, op, a, b)
}

/// Unary minus.
pub fn unary_minus(g: &Globals, a: &Value) -> Result<Value, ScriptError> {
    if let Some(x) = numeric(a) {
        return Ok(match x {
            // Widening covers the i32::MIN negation.
            Operand::Int(i) => narrow(-i),
            Operand::Float(n) => Value::Number(-n),
        });
    }
    metamethod_fallback(g, ArithOp::Unm, a, a)
}

fn numeric_binary(op: ArithOp, x: Operand, y: Operand) -> Result<Value, ScriptError> {
    use Operand::{Float, Int};
    match (op, x, y) {
        // Exact integer paths, demoted on store.
        (ArithOp::Add, Int(a), Int(b)) => Ok(narrow(a + b)),
        (ArithOp::Sub, Int(a), Int(b)) => Ok(narrow(a - b)),
        (ArithOp::Mul, Int(a), Int(b)) => Ok(narrow(a * b)),
        (ArithOp::Mod, Int(a), Int(b)) => Ok(narrow(int_floor_mod(a, b)?)),
        // Division and exponentiation never stay integral.
        (ArithOp::Div, x, y) => Ok(Value::Number(as_float(x) / as_float(y))),
        (ArithOp::Pow, x, y) => Ok(Value::Number(as_float(x).powf(as_float(y)))),
        (ArithOp::Mod, x, y) => Ok(Value::Number(float_floor_mod(as_float(x), as_float(y)))),
        (ArithOp::Add, x, y) => Ok(Value::Number(as_float(x) + as_float(y))),
        (ArithOp::Sub, x, y) => Ok(Value::Number(as_float(x) - as_float(y))),
        (ArithOp::Mul, x, y) => Ok(Value::Number(as_float(x) * as_float(y))),
        (ArithOp::Unm, x, _) => Ok(match x {
            Int(a) => narrow(-a),
            Float(a) => Value::Number(-a),
        }),
    }
}

fn as_float(x: Operand) -> f64 {
    match x {
        Operand::Int(i) => i as f64,
        Operand::Float(n) => n,
    }
}

fn metamethod_fallback(
    g: &Globals,
    op: ArithOp,
    a: &Value,
    b: &Value,
) -> Result<Value, ScriptError> {
    let handler = meta::metamethod(g, a, op.event()).or_else(|| meta::metamethod(g, b, op.event()));
    match handler {
        Some(h) => vm::call_value(g, &h, vec![a.clone(), b.clone()])
            .map(|r| r.into_iter().next().unwrap_or(Value::Nil)),
        None => {
            let offender = if numeric(a).is_none() { a } else { b };
            Err(ScriptError::raised(format!(
                "attempt to perform arithmetic on a {} value",
                offender.type_name()
            )))
        }
    }
}

/// `a < b` with numeric, string and metamethod cases.
pub fn less_than(g: &Globals, a: &Value, b: &Value) -> Result<bool, ScriptError> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => return Ok(x < y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                return Ok(x < y);
            }
        }
    }
    match meta::metamethod(g, a, "__lt").or_else(|| meta::metamethod(g, b, "__lt")) {
        Some(h) => Ok(vm::call_value(g, &h, vec![a.clone(), b.clone()])?
            .first()
            .is_some_and(Value::truthy)),
        None => Err(compare_error(a, b)),
    }
}

/// `a <= b`; falls back to `not (b < a)` when only `__lt` exists.
pub fn less_equal(g: &Globals, a: &Value, b: &Value) -> Result<bool, ScriptError> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => return Ok(x <= y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                return Ok(x <= y);
            }
        }
    }
    if let Some(h) = meta::metamethod(g, a, "__le").or_else(|| meta::metamethod(g, b, "__le")) {
        return Ok(vm::call_value(g, &h, vec![a.clone(), b.clone()])?
            .first()
            .is_some_and(Value::truthy));
    }
    if let Some(h) = meta::metamethod(g, a, "__lt").or_else(|| meta::metamethod(g, b, "__lt")) {
        return Ok(!vm::call_value(g, &h, vec![b.clone(), a.clone()])?
            .first()
            .is_some_and(Value::truthy));
    }
    Err(compare_error(a, b))
}

fn compare_error(a: &Value, b: &Value) -> ScriptError {
    if a.type_name() == b.type_name() {
        ScriptError::raised(format!("attempt to compare two {} values", a.type_name()))
    } else {
        ScriptError::raised(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))
    }
}

/// `a == b`: primitive equality, then `__eq` when both operands are
/// tables or both are userdata.
pub fn equals(g: &Globals, a: &Value, b: &Value) -> Result<bool, ScriptError> {
    if a.raw_eq(b) {
        return Ok(true);
    }
    let comparable = matches!(
        (a, b),
        (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
    );
    if !comparable {
        return Ok(false);
    }
    match meta::metamethod(g, a, "__eq").or_else(|| meta::metamethod(g, b, "__eq")) {
        Some(h) => Ok(vm::call_value(g, &h, vec![a.clone(), b.clone()])?
            .first()
            .is_some_and(Value::truthy)),
        None => Ok(false),
    }
}

/// Two-operand concatenation under the active string cap. The CONCAT
/// opcode folds its register range right-to-left through this, so the
/// cap bounds every intermediate.
pub fn concat_pair(g: &Globals, left: Value, right: Value) -> Result<Value, ScriptError> {
    let l = stringable(&left);
    let r = stringable(&right);
    if let (Some(l), Some(r)) = (l, r) {
        if let Some(cap) = limiter::active_string_cap() {
            if l.len() + r.len() > cap {
                return Err(ScriptError::StringLimitExceeded { max: cap });
            }
        }
        let mut bytes = Vec::with_capacity(l.len() + r.len());
        bytes.extend_from_slice(&l);
        bytes.extend_from_slice(&r);
        return Ok(Value::Str(LuaStr::from_vec(bytes)));
    }
    match meta::metamethod(g, &left, "__concat").or_else(|| meta::metamethod(g, &right, "__concat"))
    {
        Some(h) => vm::call_value(g, &h, vec![left, right])
            .map(|v| v.into_iter().next().unwrap_or(Value::Nil)),
        None => {
            let offender = if stringable(&left).is_none() { &left } else { &right };
            Err(ScriptError::raised(format!(
                "attempt to concatenate a {} value",
                offender.type_name()
            )))
        }
    }
}

/// Concatenation operands: strings as-is, numbers via their printed form.
fn stringable(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Str(s) => Some(s.as_bytes().to_vec()),
        Value::Integer(i) => Some(i.to_string().into_bytes()),
        Value::Number(n) => Some(fmt_number(*n).into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_stays_integral() {
        let out = numeric_binary(
            ArithOp::Add,
            Operand::Int(2_000_000_000),
            Operand::Int(-1),
        )
        .unwrap();
        assert!(matches!(out, Value::Integer(1_999_999_999)));
    }

    #[test]
    fn overflow_widens_to_double() {
        let out =
            numeric_binary(ArithOp::Add, Operand::Int(i32::MAX as i64), Operand::Int(1)).unwrap();
        match out {
            Value::Number(n) => assert_eq!(n, f64::from(i32::MAX) + 1.0),
            other => panic!("expected a double, got {other:?}"),
        }
    }

    #[test]
    fn division_is_always_a_double() {
        let out = numeric_binary(ArithOp::Div, Operand::Int(6), Operand::Int(3)).unwrap();
        assert!(matches!(out, Value::Number(n) if n == 2.0));
    }

    #[test]
    fn modulo_is_floored() {
        assert_eq!(int_floor_mod(-5, 3).unwrap(), 1);
        assert_eq!(int_floor_mod(5, -3).unwrap(), -1);
        assert_eq!(int_floor_mod(5, 3).unwrap(), 2);
        assert!(int_floor_mod(1, 0).is_err());
        assert_eq!(float_floor_mod(-5.5, 2.0), 0.5);
    }

    #[test]
    fn unary_minus_on_int_min_widens() {
        let out = numeric_binary(ArithOp::Unm, Operand::Int(i64::from(i32::MIN)), Operand::Int(0))
            .unwrap();
        match out {
            Value::Number(n) => assert_eq!(n, -f64::from(i32::MIN)),
            other => panic!("expected a double, got {other:?}"),
        }
    }
}
