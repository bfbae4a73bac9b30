//! The bytecode interpreter
//!
//! Register-based dispatch over compiled prototypes. One frame owns a
//! shared register file (so open upvalues stay addressable), a pc, and a
//! logical top for variable-result operations. Before every fetch the
//! frame charges one instruction against the active budget; in a worker
//! that charge turns into a cooperative yield at the limit, on the main
//! caller it raises.
//!
//! Tail calls re-enter the trampoline in `execute` instead of growing the
//! native stack; ordinary calls recurse and are bounded by a frame-depth
//! guard, so scripts cannot exhaust the host stack either way.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use moat_core::instr::{self, OpCode};
use moat_core::{
    Function, Instr, LuaClosure, Prototype, RegisterFile, ScriptError, Table, UpvalueCell, Value,
    Varargs,
};
use tracing::trace;

use crate::arith::{self, ArithOp};
use crate::globals::Globals;
use crate::limiter;
use crate::meta;
use crate::sched;

/// Native call-depth guard; deeper recursion raises a script-visible
/// "stack overflow" rather than exhausting the host stack.
const MAX_CALL_DEPTH: usize = 200;

/// Array slots flushed per SETLIST batch.
const FIELDS_PER_FLUSH: u32 = 50;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static TRACE_STACK: RefCell<Vec<Arc<TraceCell>>> = const { RefCell::new(Vec::new()) };
}

/// One traceback entry, shared with the frame that keeps its line current.
pub struct TraceCell {
    pub source: String,
    pub line: AtomicU32,
}

/// Renders the current call stack, innermost frame first.
pub fn traceback() -> String {
    TRACE_STACK.with(|stack| {
        let stack = stack.borrow();
        let mut out = String::from("stack traceback:");
        for cell in stack.iter().rev() {
            out.push_str(&format!(
                "\n\t{}:{}: in function",
                cell.source,
                cell.line.load(Ordering::Relaxed)
            ));
        }
        out
    })
}

/// Position of the innermost script frame, for `error` level-1 prefixes
/// raised from native code.
pub fn current_location() -> Option<(String, u32)> {
    TRACE_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|cell| (cell.source.clone(), cell.line.load(Ordering::Relaxed)))
    })
}

/// Charges `n` instructions. In a worker at its budget this parks the
/// worker (yielding nil to the resumer) and retries after each resume;
/// on the main caller it raises, and nothing the script wrapped in a
/// protected call can intercept that.
pub fn charge_budget(n: u64) -> Result<(), ScriptError> {
    loop {
        match limiter::charge(n) {
            Ok(()) => return Ok(()),
            Err(max) => {
                if sched::in_worker() {
                    sched::yield_for_budget()?;
                } else {
                    return Err(ScriptError::LimitExceeded { max });
                }
            }
        }
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<DepthGuard, ScriptError> {
        let depth = CALL_DEPTH.with(Cell::get);
        if depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::raised("stack overflow"));
        }
        CALL_DEPTH.with(|d| d.set(depth + 1));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Calls any callable value: closures, natives, or `__call` carriers.
pub fn call_value(g: &Globals, func: &Value, args: Varargs) -> Result<Varargs, ScriptError> {
    let _depth = DepthGuard::enter()?;
    match func {
        Value::Function(Function::Lua(closure)) => execute(g, closure.clone(), args),
        Value::Function(Function::Native(native)) => native.call(args),
        other => match meta::metamethod(g, other, "__call") {
            Some(handler) => {
                let mut with_self = Vec::with_capacity(args.len() + 1);
                with_self.push(other.clone());
                with_self.extend(args);
                call_value(g, &handler, with_self)
            }
            None => Err(ScriptError::raised(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        },
    }
}

enum FrameExit {
    Return(Varargs),
    TailCall(Value, Varargs),
}

/// Runs a closure to completion. Tail calls to other closures loop here
/// instead of recursing.
fn execute(g: &Globals, mut closure: Arc<LuaClosure>, mut args: Varargs) -> Result<Varargs, ScriptError> {
    if sched::current_requires_limit() && !limiter::has_active_limit() {
        return Err(ScriptError::Internal(
            "worker is executing without an installed instruction limit".to_string(),
        ));
    }
    loop {
        let proto = closure.proto.clone();
        let nparams = proto.numparams as usize;
        let regs = RegisterFile::new(proto.maxstacksize as usize);
        for i in 0..nparams {
            regs.set(i, args.get(i).cloned().unwrap_or(Value::Nil))?;
        }
        let varargs: Varargs = if proto.is_vararg && args.len() > nparams {
            args[nparams..].to_vec()
        } else {
            Vec::new()
        };

        let trace_cell = Arc::new(TraceCell {
            source: proto.source.clone(),
            line: AtomicU32::new(proto.linedefined),
        });
        TRACE_STACK.with(|s| s.borrow_mut().push(trace_cell.clone()));
        // A worker's live frames stay visible to the reachability walker
        // while the frame runs (or sits suspended mid-body).
        let worker = sched::current_worker();
        if let Some(w) = &worker {
            w.push_frame(regs.clone());
        }

        let mut frame = Frame {
            g,
            closure: &closure,
            proto: &proto,
            regs,
            varargs,
            open: Vec::new(),
            pc: 0,
            top: 0,
            trace: trace_cell,
        };
        let exit = frame.run();
        // Unwinding (normal or error) closes every upvalue still open
        // over this frame's registers.
        frame.close_from(0);
        if let Some(w) = &worker {
            w.pop_frame();
        }
        TRACE_STACK.with(|s| {
            s.borrow_mut().pop();
        });

        match exit? {
            FrameExit::Return(values) => return Ok(values),
            FrameExit::TailCall(func, new_args) => match &func {
                Value::Function(Function::Lua(next)) => {
                    trace!("tail call");
                    closure = next.clone();
                    args = new_args;
                }
                other => return call_value(g, other, new_args),
            },
        }
    }
}

struct Frame<'a> {
    g: &'a Globals,
    closure: &'a Arc<LuaClosure>,
    proto: &'a Prototype,
    regs: Arc<RegisterFile>,
    varargs: Varargs,
    /// Open upvalue cells created by CLOSURE over this frame's slots.
    open: Vec<(usize, UpvalueCell)>,
    pc: usize,
    /// Logical stack top, meaningful after a variable-result operation.
    top: usize,
    trace: Arc<TraceCell>,
}

impl Frame<'_> {
    fn internal(&self, msg: &str) -> ScriptError {
        ScriptError::Internal(format!("{} (pc {})", msg, self.pc))
    }

    /// Prefixes a raised message with the current source position, the
    /// way script-visible errors are reported.
    fn located(&self, err: ScriptError) -> ScriptError {
        match err {
            ScriptError::Raised { value, traceback } => {
                let line = self.proto.line_at(self.pc.saturating_sub(1));
                let message = format!("{}:{}: {}", self.proto.source, line, value.display_string());
                ScriptError::Raised {
                    value: Value::from(message),
                    traceback,
                }
            }
            other => other,
        }
    }

    fn r(&self, i: u32) -> Result<Value, ScriptError> {
        self.regs.get(i as usize)
    }

    fn set_r(&self, i: u32, v: Value) -> Result<(), ScriptError> {
        self.regs.set(i as usize, v)
    }

    fn k(&self, i: usize) -> Result<Value, ScriptError> {
        self.proto
            .constants
            .get(i)
            .cloned()
            .ok_or_else(|| self.internal("constant index out of range"))
    }

    /// RK operand: register or constant.
    fn rk(&self, x: u32) -> Result<Value, ScriptError> {
        if instr::is_k(x) {
            self.k(instr::index_k(x))
        } else {
            self.r(x)
        }
    }

    fn upvalue(&self, i: u32) -> Result<&UpvalueCell, ScriptError> {
        self.closure
            .upvalues
            .get(i as usize)
            .ok_or_else(|| self.internal("upvalue index out of range"))
    }

    /// The open cell for a frame slot, creating and recording it on first
    /// capture so sibling closures share one cell per variable.
    fn find_upvalue(&mut self, slot: usize) -> UpvalueCell {
        for (s, cell) in &self.open {
            if *s == slot {
                return cell.clone();
            }
        }
        let cell = UpvalueCell::open(self.regs.clone(), slot);
        self.open.push((slot, cell.clone()));
        cell
    }

    /// Closes every open upvalue over slots >= `from`.
    fn close_from(&mut self, from: usize) {
        self.open.retain(|(slot, cell)| {
            if *slot >= from {
                let _ = cell.close();
                false
            } else {
                true
            }
        });
    }

    fn jump(&mut self, offset: i32) -> Result<(), ScriptError> {
        let target = self.pc as i64 + i64::from(offset);
        if target < 0 || target as usize > self.proto.code.len() {
            return Err(self.internal("jump target out of range"));
        }
        self.pc = target as usize;
        Ok(())
    }

    fn fetch(&mut self) -> Result<Instr, ScriptError> {
        let word = self
            .proto
            .code
            .get(self.pc)
            .copied()
            .ok_or_else(|| self.internal("program counter out of range"))?;
        self.trace
            .line
            .store(self.proto.line_at(self.pc), Ordering::Relaxed);
        self.pc += 1;
        Ok(word)
    }

    /// Reads the EXTRAARG word that follows SETLIST/LOADKX.
    fn fetch_extra(&mut self) -> Result<u32, ScriptError> {
        let word = self.fetch()?;
        match word.opcode() {
            Some(OpCode::ExtraArg) => Ok(word.ax_arg()),
            _ => Err(self.internal("expected EXTRAARG")),
        }
    }

    fn run(&mut self) -> Result<FrameExit, ScriptError> {
        loop {
            charge_budget(1)?;
            let i = self.fetch()?;
            let op = i
                .opcode()
                .ok_or_else(|| self.internal("illegal opcode"))?;
            let (a, b, c) = (i.a(), i.b(), i.c());
            match op {
                OpCode::Move => self.set_r(a, self.r(b)?)?,
                OpCode::LoadK => self.set_r(a, self.k(i.bx() as usize)?)?,
                OpCode::LoadKx => {
                    let index = self.fetch_extra()?;
                    self.set_r(a, self.k(index as usize)?)?;
                }
                OpCode::LoadBool => {
                    self.set_r(a, Value::Boolean(b != 0))?;
                    if c != 0 {
                        self.jump(1)?;
                    }
                }
                OpCode::LoadNil => {
                    for slot in a..=a + b {
                        self.set_r(slot, Value::Nil)?;
                    }
                }
                OpCode::GetUpval => self.set_r(a, self.upvalue(b)?.get()?)?,
                OpCode::SetUpval => self.upvalue(b)?.set(self.r(a)?)?,
                OpCode::GetTabUp => {
                    let table = self.upvalue(b)?.get()?;
                    let key = self.rk(c)?;
                    let value = meta::index(self.g, &table, &key).map_err(|e| self.located(e))?;
                    self.set_r(a, value)?;
                }
                OpCode::SetTabUp => {
                    let table = self.upvalue(a)?.get()?;
                    let key = self.rk(b)?;
                    let value = self.rk(c)?;
                    meta::new_index(self.g, &table, key, value).map_err(|e| self.located(e))?;
                }
                OpCode::GetTable => {
                    let table = self.r(b)?;
                    let key = self.rk(c)?;
                    let value = meta::index(self.g, &table, &key).map_err(|e| self.located(e))?;
                    self.set_r(a, value)?;
                }
                OpCode::SetTable => {
                    let table = self.r(a)?;
                    let key = self.rk(b)?;
                    let value = self.rk(c)?;
                    meta::new_index(self.g, &table, key, value).map_err(|e| self.located(e))?;
                }
                OpCode::NewTable => {
                    let table = Table::with_capacity(
                        instr::fb_to_int(b) as usize,
                        instr::fb_to_int(c) as usize,
                    );
                    self.set_r(a, moat_core::new_table_value(table))?;
                }
                OpCode::SelfOp => {
                    let receiver = self.r(b)?;
                    self.set_r(a + 1, receiver.clone())?;
                    let key = self.rk(c)?;
                    let method =
                        meta::index(self.g, &receiver, &key).map_err(|e| self.located(e))?;
                    self.set_r(a, method)?;
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                | OpCode::Pow => {
                    let x = self.rk(b)?;
                    let y = self.rk(c)?;
                    let op = match op {
                        OpCode::Add => ArithOp::Add,
                        OpCode::Sub => ArithOp::Sub,
                        OpCode::Mul => ArithOp::Mul,
                        OpCode::Div => ArithOp::Div,
                        OpCode::Mod => ArithOp::Mod,
                        _ => ArithOp::Pow,
                    };
                    let value =
                        arith::binary(self.g, op, &x, &y).map_err(|e| self.located(e))?;
                    self.set_r(a, value)?;
                }
                OpCode::Unm => {
                    let x = self.r(b)?;
                    let value = arith::unary_minus(self.g, &x).map_err(|e| self.located(e))?;
                    self.set_r(a, value)?;
                }
                OpCode::Not => {
                    let x = self.r(b)?;
                    self.set_r(a, Value::Boolean(!x.truthy()))?;
                }
                OpCode::Len => {
                    let x = self.r(b)?;
                    let value = meta::length_of(self.g, &x).map_err(|e| self.located(e))?;
                    self.set_r(a, value)?;
                }
                OpCode::Concat => {
                    let mut acc = self.r(c)?;
                    let mut index = c;
                    while index > b {
                        index -= 1;
                        let left = self.r(index)?;
                        acc = arith::concat_pair(self.g, left, acc)
                            .map_err(|e| self.located(e))?;
                    }
                    self.set_r(a, acc)?;
                }
                OpCode::Jmp => {
                    if a > 0 {
                        self.close_from(a as usize - 1);
                    }
                    self.jump(i.sbx())?;
                }
                OpCode::Eq => {
                    let x = self.rk(b)?;
                    let y = self.rk(c)?;
                    let eq = arith::equals(self.g, &x, &y).map_err(|e| self.located(e))?;
                    if eq != (a != 0) {
                        self.jump(1)?;
                    }
                }
                OpCode::Lt => {
                    let x = self.rk(b)?;
                    let y = self.rk(c)?;
                    let lt = arith::less_than(self.g, &x, &y).map_err(|e| self.located(e))?;
                    if lt != (a != 0) {
                        self.jump(1)?;
                    }
                }
                OpCode::Le => {
                    let x = self.rk(b)?;
                    let y = self.rk(c)?;
                    let le = arith::less_equal(self.g, &x, &y).map_err(|e| self.located(e))?;
                    if le != (a != 0) {
                        self.jump(1)?;
                    }
                }
                OpCode::Test => {
                    if self.r(a)?.truthy() != (c != 0) {
                        self.jump(1)?;
                    }
                }
                OpCode::TestSet => {
                    let x = self.r(b)?;
                    if x.truthy() == (c != 0) {
                        self.set_r(a, x)?;
                    } else {
                        self.jump(1)?;
                    }
                }
                OpCode::Call => {
                    let func = self.r(a)?;
                    let call_args = self.call_args(a, b);
                    let results = call_value(self.g, &func, call_args)?;
                    self.place_results(a, c, results)?;
                }
                OpCode::TailCall => {
                    let func = self.r(a)?;
                    let call_args = self.call_args(a, b);
                    self.close_from(0);
                    return Ok(FrameExit::TailCall(func, call_args));
                }
                OpCode::Return => {
                    self.close_from(0);
                    let values = if b == 0 {
                        self.regs
                            .get_span(a as usize, self.top.saturating_sub(a as usize))
                    } else {
                        self.regs.get_span(a as usize, b as usize - 1)
                    };
                    return Ok(FrameExit::Return(values));
                }
                OpCode::ForPrep => {
                    let init = self.for_number(self.r(a)?, "initial value")?;
                    let limit = self.for_number(self.r(a + 1)?, "limit")?;
                    let step = self.for_number(self.r(a + 2)?, "step")?;
                    let started = arith::binary(self.g, ArithOp::Sub, &init, &step)
                        .map_err(|e| self.located(e))?;
                    self.set_r(a, started)?;
                    self.set_r(a + 1, limit)?;
                    self.set_r(a + 2, step)?;
                    self.jump(i.sbx())?;
                }
                OpCode::ForLoop => {
                    let step = self.r(a + 2)?;
                    let index = arith::binary(self.g, ArithOp::Add, &self.r(a)?, &step)
                        .map_err(|e| self.located(e))?;
                    let limit = self.r(a + 1)?;
                    let ascending = step.as_number().unwrap_or(0.0) > 0.0;
                    let continues = match (index.as_number(), limit.as_number()) {
                        (Some(i), Some(l)) => {
                            if ascending {
                                i <= l
                            } else {
                                i >= l
                            }
                        }
                        _ => false,
                    };
                    self.set_r(a, index.clone())?;
                    if continues {
                        self.set_r(a + 3, index)?;
                        self.jump(i.sbx())?;
                    }
                }
                OpCode::TForCall => {
                    let func = self.r(a)?;
                    let iter_args = vec![self.r(a + 1)?, self.r(a + 2)?];
                    let results = call_value(self.g, &func, iter_args)?;
                    let wanted = c as usize;
                    let mut padded = Vec::with_capacity(wanted);
                    for idx in 0..wanted {
                        padded.push(results.get(idx).cloned().unwrap_or(Value::Nil));
                    }
                    self.regs.set_span(a as usize + 3, &padded);
                }
                OpCode::TForLoop => {
                    let control = self.r(a + 1)?;
                    if !control.is_nil() {
                        self.set_r(a, control)?;
                        self.jump(i.sbx())?;
                    }
                }
                OpCode::SetList => {
                    let count = if b == 0 {
                        self.top.saturating_sub(a as usize + 1) as u32
                    } else {
                        b
                    };
                    let block = if c == 0 { self.fetch_extra()? } else { c };
                    let base = (block as i64 - 1) * i64::from(FIELDS_PER_FLUSH);
                    let table_value = self.r(a)?;
                    let table = table_value
                        .as_table()
                        .ok_or_else(|| self.internal("SETLIST target is not a table"))?;
                    let mut guard = table.lock().unwrap();
                    for offset in 1..=count {
                        let key = meta::int_or_number(base + i64::from(offset));
                        let value = self.r(a + offset)?;
                        guard
                            .set(key, value)
                            .map_err(|e| ScriptError::raised(e.to_string()))?;
                    }
                }
                OpCode::Closure => {
                    let child = self
                        .proto
                        .protos
                        .get(i.bx() as usize)
                        .cloned()
                        .ok_or_else(|| self.internal("closure prototype out of range"))?;
                    let mut upvalues = Vec::with_capacity(child.upvalues.len());
                    for desc in &child.upvalues {
                        if desc.in_stack {
                            upvalues.push(self.find_upvalue(desc.index as usize));
                        } else {
                            upvalues.push(self.upvalue(u32::from(desc.index))?.clone());
                        }
                    }
                    let function = Function::Lua(Arc::new(LuaClosure {
                        proto: child,
                        upvalues,
                    }));
                    self.set_r(a, Value::Function(function))?;
                }
                OpCode::Vararg => {
                    if b == 0 {
                        self.regs.set_span(a as usize, &self.varargs);
                        self.top = a as usize + self.varargs.len();
                    } else {
                        for idx in 0..(b - 1) as usize {
                            self.set_r(
                                a + idx as u32,
                                self.varargs.get(idx).cloned().unwrap_or(Value::Nil),
                            )?;
                        }
                    }
                }
                OpCode::ExtraArg => {
                    return Err(self.internal("stray EXTRAARG"));
                }
            }
        }
    }

    /// Collects call arguments per the B convention (0 = up to top).
    fn call_args(&self, a: u32, b: u32) -> Varargs {
        if b == 0 {
            self.regs
                .get_span(a as usize + 1, self.top.saturating_sub(a as usize + 1))
        } else {
            self.regs.get_span(a as usize + 1, b as usize - 1)
        }
    }

    /// Stores call results per the C convention (0 = keep all, track top).
    fn place_results(&mut self, a: u32, c: u32, results: Varargs) -> Result<(), ScriptError> {
        if c == 0 {
            self.top = a as usize + results.len();
            self.regs.set_span(a as usize, &results);
        } else {
            for idx in 0..(c - 1) as usize {
                self.set_r(a + idx as u32, results.get(idx).cloned().unwrap_or(Value::Nil))?;
            }
        }
        Ok(())
    }

    /// Numeric-for control values must be numbers (or numeric strings).
    fn for_number(&self, v: Value, what: &str) -> Result<Value, ScriptError> {
        match &v {
            Value::Integer(_) | Value::Number(_) => Ok(v),
            Value::Str(s) => s
                .to_str()
                .and_then(moat_core::parse_number)
                .ok_or_else(|| {
                    self.located(ScriptError::raised(format!(
                        "'for' {what} must be a number"
                    )))
                }),
            _ => Err(self.located(ScriptError::raised(format!(
                "'for' {what} must be a number"
            )))),
        }
    }
}
