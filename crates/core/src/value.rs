//! The dynamic value model
//!
//! A compact tagged sum: small values (nil, booleans, integers, doubles)
//! live inline; strings, tables, closures, threads and userdata are heap
//! allocated behind shared ownership. Aggregate types compare by identity,
//! numbers by mathematical value, strings by content.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::error::ScriptError;
use crate::prototype::Prototype;
use crate::string::LuaStr;
use crate::table::Table;

/// Shared handle to a mutable table.
pub type TableRef = Arc<Mutex<Table>>;

/// Shared handle to a coroutine worker. The concrete worker type lives in
/// the runtime; the value model only needs identity and a printable status.
pub type ThreadRef = Arc<dyn CoroHandle>;

/// Seam between the value model and the coroutine scheduler.
pub trait CoroHandle: Send + Sync {
    /// Downcast hook for the scheduler that owns the concrete type.
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    /// Lifecycle name as scripts observe it ("suspended", "running", "dead").
    fn status_name(&self) -> &'static str;
}

/// Opaque host-owned payload with an optional metatable. Only explicitly
/// registered userdata crosses the sandbox boundary.
pub struct Userdata {
    pub data: Box<dyn Any + Send + Sync>,
    pub metatable: Mutex<Option<TableRef>>,
}

pub type UserdataRef = Arc<Userdata>;

/// Multiple values travelling between frames, calls and the host.
pub type Varargs = Vec<Value>;

/// A value in the scripting language.
#[derive(Clone, Default)]
pub enum Value {
    /// The absent value.
    #[default]
    Nil,
    /// true / false.
    Boolean(bool),
    /// Signed 32-bit integer. Distinct tag from `Number`, but the two
    /// coerce on arithmetic and compare by mathematical value.
    Integer(i32),
    /// IEEE 754 double.
    Number(f64),
    /// Immutable byte string.
    Str(LuaStr),
    /// Mutable hybrid array/hash container.
    Table(TableRef),
    /// Callable: a compiled closure or a registered native.
    Function(Function),
    /// Coroutine worker.
    Thread(ThreadRef),
    /// Opaque host payload.
    Userdata(UserdataRef),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

/// A callable value.
#[derive(Clone)]
pub enum Function {
    /// Compiled prototype bound to captured upvalues.
    Lua(Arc<LuaClosure>),
    /// Host-registered callable. No other host objects cross the boundary.
    Native(Arc<NativeFunction>),
}

impl Function {
    pub fn name(&self) -> String {
        match self {
            Function::Lua(c) => format!("function <{}:{}>", c.proto.source, c.proto.linedefined),
            Function::Native(n) => format!("function '{}'", n.name),
        }
    }

    /// Identity address for equality and reachability walks.
    pub fn addr(&self) -> usize {
        match self {
            Function::Lua(c) => Arc::as_ptr(c) as usize,
            Function::Native(n) => Arc::as_ptr(n) as usize,
        }
    }
}

/// Runtime binding of an immutable prototype to a set of upvalues.
pub struct LuaClosure {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<UpvalueCell>,
}

/// Signature of a registered native callable.
pub type NativeImpl = dyn Fn(Varargs) -> Result<Varargs, ScriptError> + Send + Sync;

/// A named host callable. Anything it needs from the host (console queue,
/// scheduler, loader) is captured at registration time.
pub struct NativeFunction {
    pub name: String,
    func: Box<NativeImpl>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Varargs) -> Result<Varargs, ScriptError> + Send + Sync + 'static,
    ) -> Arc<NativeFunction> {
        Arc::new(NativeFunction {
            name: name.into(),
            func: Box::new(func),
        })
    }

    pub fn call(&self, args: Varargs) -> Result<Varargs, ScriptError> {
        (self.func)(args)
    }
}

/// One call frame's register file. Shared behind `Arc` so open upvalues
/// can keep addressing the slots of a live frame from nested calls or
/// sibling workers; access is by copy under a narrow lock.
pub struct RegisterFile {
    slots: Mutex<Vec<Value>>,
}

impl RegisterFile {
    pub fn new(size: usize) -> Arc<RegisterFile> {
        Arc::new(RegisterFile {
            slots: Mutex::new(vec![Value::Nil; size]),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Value, ScriptError> {
        self.slots
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or_else(|| ScriptError::Internal(format!("register {index} out of range")))
    }

    pub fn set(&self, index: usize, value: Value) -> Result<(), ScriptError> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ScriptError::Internal(format!(
                "register {index} out of range"
            ))),
        }
    }

    /// Copies `count` values starting at `from`; short reads pad with nil.
    pub fn get_span(&self, from: usize, count: usize) -> Vec<Value> {
        let slots = self.slots.lock().unwrap();
        (from..from + count)
            .map(|i| slots.get(i).cloned().unwrap_or(Value::Nil))
            .collect()
    }

    /// Writes a span starting at `from`. The frame grows with nils when a
    /// variable-result operation spills past the static frame size;
    /// existing slot indices stay stable, so open upvalues are unaffected.
    pub fn set_span(&self, from: usize, values: &[Value]) {
        let mut slots = self.slots.lock().unwrap();
        let needed = from + values.len();
        if slots.len() < needed {
            slots.resize(needed, Value::Nil);
        }
        for (i, v) in values.iter().enumerate() {
            slots[from + i] = v.clone();
        }
    }
}

/// Upvalue state: open cells alias a live frame slot, closed cells own
/// their value. Closing copies the value and severs the frame reference.
pub enum Upvalue {
    Open { regs: Arc<RegisterFile>, index: usize },
    Closed(Value),
}

/// Shared upvalue cell. Cloning shares the cell, so every closure
/// capturing the same variable observes the same mutations.
#[derive(Clone)]
pub struct UpvalueCell(Arc<Mutex<Upvalue>>);

impl UpvalueCell {
    pub fn open(regs: Arc<RegisterFile>, index: usize) -> UpvalueCell {
        UpvalueCell(Arc::new(Mutex::new(Upvalue::Open { regs, index })))
    }

    pub fn closed(value: Value) -> UpvalueCell {
        UpvalueCell(Arc::new(Mutex::new(Upvalue::Closed(value))))
    }

    pub fn get(&self) -> Result<Value, ScriptError> {
        match &*self.0.lock().unwrap() {
            Upvalue::Open { regs, index } => regs.get(*index),
            Upvalue::Closed(v) => Ok(v.clone()),
        }
    }

    pub fn set(&self, value: Value) -> Result<(), ScriptError> {
        let mut guard = self.0.lock().unwrap();
        match &mut *guard {
            Upvalue::Open { regs, index } => regs.set(*index, value),
            Upvalue::Closed(slot) => {
                *slot = value;
                Ok(())
            }
        }
    }

    /// Copies the current frame value into the cell and drops the frame
    /// reference. Idempotent.
    pub fn close(&self) -> Result<(), ScriptError> {
        let mut guard = self.0.lock().unwrap();
        if let Upvalue::Open { regs, index } = &*guard {
            let value = regs.get(*index)?;
            *guard = Upvalue::Closed(value);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.0.lock().unwrap(), Upvalue::Open { .. })
    }

    /// True if this cell is open over the given frame slot.
    pub fn is_open_at(&self, frame: &Arc<RegisterFile>, slot: usize) -> bool {
        match &*self.0.lock().unwrap() {
            Upvalue::Open { regs, index } => Arc::ptr_eq(regs, frame) && *index == slot,
            Upvalue::Closed(_) => false,
        }
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Value {
    /// The script-visible type name. Integers and doubles are both
    /// "number".
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
            Value::Userdata(_) => "userdata",
        }
    }

    /// Everything except nil and false is truthy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Primitive equality: no metamethods. Numbers compare by mathematical
    /// value across the two numeric tags; aggregates by identity.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                f64::from(*a) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.addr() == b.addr(),
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            (Value::Userdata(a), Value::Userdata(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Identity address of the heap allocation, if any. Used by the
    /// reachability walker's visited set; pointer identity, not value
    /// equality, so equal-but-distinct aggregates both get counted.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.addr()),
            Value::Table(t) => Some(Arc::as_ptr(t) as usize),
            Value::Function(f) => Some(f.addr()),
            Value::Thread(t) => Some(Arc::as_ptr(t).cast::<()>() as usize),
            Value::Userdata(u) => Some(Arc::as_ptr(u) as usize),
            _ => None,
        }
    }

    /// Numeric view, if this value is a number (no string coercion).
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(f64::from(*i)),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view: exact integers and integral doubles.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i64::from(*i)),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                // Doubles carry 53 bits of integer precision.
                if (i64::MIN as f64..=i64::MAX as f64).contains(n) {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&LuaStr> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Normalizes a would-be table key: integral doubles collapse into the
    /// integer tag so `t[2]` and `t[2.0]` address the same slot.
    pub fn normalize_key(self) -> Value {
        if let Value::Number(n) = self {
            if n.fract() == 0.0 && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
                return Value::Integer(n as i32);
            }
        }
        self
    }

    /// `tostring` without metamethods.
    pub fn display_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => fmt_number(*n),
            Value::Str(s) => s.display().into_owned(),
            Value::Table(t) => format!("table: {:p}", Arc::as_ptr(t)),
            Value::Function(f) => match f {
                Function::Lua(c) => format!("function: {:p}", Arc::as_ptr(c)),
                Function::Native(n) => format!("function: builtin: {}", n.name),
            },
            Value::Thread(t) => format!("thread: {:p}", Arc::as_ptr(t).cast::<()>()),
            Value::Userdata(u) => format!("userdata: {:p}", Arc::as_ptr(u)),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.display_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(LuaStr::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(LuaStr::from(s))
    }
}

impl From<LuaStr> for Value {
    fn from(s: LuaStr) -> Value {
        Value::Str(s)
    }
}

impl From<TableRef> for Value {
    fn from(t: TableRef) -> Value {
        Value::Table(t)
    }
}

/// Wraps a fresh table in its shared handle.
pub fn new_table_value(table: Table) -> Value {
    Value::Table(Arc::new(Mutex::new(table)))
}

/// Formats a double the way the language prints numbers: 14 significant
/// digits, fixed notation for moderate exponents, scientific otherwise.
pub fn fmt_number(n: f64) -> String {
    const PRECISION: usize = 14;
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{:.*e}", PRECISION - 1, n);
    let (mantissa, exp) = sci
        .split_once('e')
        .expect("exponential format always contains 'e'");
    let exp: i32 = exp.parse().expect("exponent is a decimal integer");
    let neg = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.trim_end_matches('0');
    let digits = if digits.is_empty() { "0" } else { digits };

    let mut out = String::new();
    if neg {
        out.push('-');
    }
    if (-4..PRECISION as i32).contains(&exp) {
        if exp >= 0 {
            let int_len = exp as usize + 1;
            if digits.len() <= int_len {
                out.push_str(digits);
                out.extend(std::iter::repeat_n('0', int_len - digits.len()));
            } else {
                out.push_str(&digits[..int_len]);
                out.push('.');
                out.push_str(&digits[int_len..]);
            }
        } else {
            out.push_str("0.");
            out.extend(std::iter::repeat_n('0', (-exp - 1) as usize));
            out.push_str(digits);
        }
    } else {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        out.push(if exp < 0 { '-' } else { '+' });
        let abs = exp.abs();
        if abs < 10 {
            out.push('0');
        }
        out.push_str(&abs.to_string());
    }
    out
}

/// Parses a numeric literal with the language's lexical rules: optional
/// sign, decimal or `0x` hex, hex floats with a binary `p` exponent.
/// Integer lexemes that fit 32 bits produce the integer tag.
pub fn parse_number(text: &str) -> Option<Value> {
    let s = text.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        return parse_hex(neg, hex);
    }
    if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(wide) = body.parse::<i64>() {
            let wide = if neg { -wide } else { wide };
            return Some(match i32::try_from(wide) {
                Ok(i) => Value::Integer(i),
                Err(_) => Value::Number(wide as f64),
            });
        }
        // Longer than 19 digits: value only representable as a double.
    }
    if body.is_empty()
        || !body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    let f: f64 = body.parse().ok()?;
    Some(Value::Number(if neg { -f } else { f }))
}

fn parse_hex(neg: bool, body: &str) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    let mut mantissa = 0f64;
    let mut any_digit = false;
    let mut frac_shift = 0i32;
    let mut seen_dot = false;
    let mut exact: Option<u64> = Some(0);
    for (i, c) in body.char_indices() {
        match c {
            '.' if !seen_dot => seen_dot = true,
            'p' | 'P' => {
                let rest = &body[i + 1..];
                if rest.is_empty() || !any_digit {
                    return None;
                }
                let exp = rest.parse::<i32>().ok()?;
                let value = mantissa * 2f64.powi(exp - 4 * frac_shift);
                return Some(Value::Number(if neg { -value } else { value }));
            }
            _ => {
                let digit = c.to_digit(16)?;
                any_digit = true;
                mantissa = mantissa * 16.0 + f64::from(digit);
                exact = exact.and_then(|v| {
                    if seen_dot {
                        None
                    } else {
                        v.checked_mul(16).and_then(|v| v.checked_add(u64::from(digit)))
                    }
                });
                if seen_dot {
                    frac_shift += 1;
                }
            }
        }
    }
    if !any_digit {
        return None;
    }
    if !seen_dot {
        if let Some(v) = exact {
            let wide = if neg { -(v as i64) } else { v as i64 };
            if let Ok(i) = i32::try_from(wide) {
                return Some(Value::Integer(i));
            }
            return Some(Value::Number(wide as f64));
        }
    }
    let value = mantissa / 16f64.powi(frac_shift);
    Some(Value::Number(if neg { -value } else { value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_tags() {
        assert!(Value::Integer(2).raw_eq(&Value::Number(2.0)));
        assert!(!Value::Integer(2).raw_eq(&Value::Number(2.5)));
        assert!(!Value::Number(f64::NAN).raw_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(Value::Integer(0).truthy());
        assert!(Value::from("").truthy());
    }

    #[test]
    fn key_normalization_collapses_integral_doubles() {
        assert!(matches!(
            Value::Number(2.0).normalize_key(),
            Value::Integer(2)
        ));
        assert!(matches!(
            Value::Number(2.5).normalize_key(),
            Value::Number(_)
        ));
        assert!(matches!(
            Value::Number(1e18).normalize_key(),
            Value::Number(_)
        ));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(fmt_number(10.0), "10");
        assert_eq!(fmt_number(1.5), "1.5");
        assert_eq!(fmt_number(-0.25), "-0.25");
        assert_eq!(fmt_number(1e20), "1e+20");
        assert_eq!(fmt_number(1e-7), "1e-07");
        assert_eq!(fmt_number(0.1), "0.1");
        assert_eq!(fmt_number(f64::INFINITY), "inf");
    }

    #[test]
    fn number_parsing() {
        assert!(matches!(parse_number("42"), Some(Value::Integer(42))));
        assert!(matches!(parse_number("-7"), Some(Value::Integer(-7))));
        assert!(matches!(parse_number("  3 "), Some(Value::Integer(3))));
        assert!(matches!(parse_number("0x10"), Some(Value::Integer(16))));
        assert!(matches!(parse_number("3.5"), Some(Value::Number(_))));
        assert!(matches!(parse_number("1e3"), Some(Value::Number(_))));
        assert!(parse_number("").is_none());
        assert!(parse_number("0x").is_none());
        assert!(parse_number("12ab").is_none());
        assert!(parse_number("inf").is_none());
        // Integer overflow of the 32-bit tag widens to a double.
        assert!(matches!(
            parse_number("4000000000"),
            Some(Value::Number(_))
        ));
    }

    #[test]
    fn hex_floats() {
        match parse_number("0x1p4") {
            Some(Value::Number(n)) => assert_eq!(n, 16.0),
            other => panic!("unexpected {other:?}"),
        }
        match parse_number("0x1.8p1") {
            Some(Value::Number(n)) => assert_eq!(n, 3.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn upvalue_open_close() {
        let regs = RegisterFile::new(4);
        regs.set(2, Value::Integer(7)).unwrap();
        let cell = UpvalueCell::open(Arc::clone(&regs), 2);
        assert!(cell.is_open());
        assert!(matches!(cell.get().unwrap(), Value::Integer(7)));

        // Writes through the open cell land in the frame slot.
        cell.set(Value::Integer(9)).unwrap();
        assert!(matches!(regs.get(2).unwrap(), Value::Integer(9)));

        cell.close().unwrap();
        assert!(!cell.is_open());
        // After closing, the cell owns the value; the frame slot is free
        // to be reused without affecting the cell.
        regs.set(2, Value::Nil).unwrap();
        assert!(matches!(cell.get().unwrap(), Value::Integer(9)));
    }

    #[test]
    fn shared_upvalue_cells_alias() {
        let a = UpvalueCell::closed(Value::Integer(1));
        let b = a.clone();
        b.set(Value::Integer(2)).unwrap();
        assert!(matches!(a.get().unwrap(), Value::Integer(2)));
    }
}
