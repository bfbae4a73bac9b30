//! Bytecode generation
//!
//! Walks the syntax tree emitting register-machine code, one function
//! state per (possibly nested) function. Locals own the low registers;
//! expression temporaries are allocated above them and released at
//! statement boundaries. Comparison opcodes skip the following jump when
//! the condition does not match their A operand, so a condition compiles
//! to `CMP; JMP <false-target>` and a materialized boolean to the
//! classic `CMP; JMP; LOADBOOL; LOADBOOL` quartet.

use std::collections::HashMap;
use std::sync::Arc;

use moat_core::instr::{self, Instr, OpCode};
use moat_core::{LocalVar, LuaStr, Prototype, UpvalDesc, Value};

use crate::ast::{BinOp, Block, Expr, ExprKind, FuncBody, Stat, StatKind, TableItem, UnOp};
use crate::error::CompileError;

/// Register budget per function frame.
const MAX_REGISTERS: u32 = 200;
/// Upvalue budget per function.
const MAX_UPVALUES: usize = 60;
/// Array slots flushed per SETLIST batch.
const FIELDS_PER_FLUSH: u32 = 50;

/// Where an indexed expression finds its table.
enum IndexBase {
    Register(u32),
    Upvalue(u32),
}

/// How a name resolves at a use site.
enum NameRef {
    Local(u32),
    Upvalue(u32),
    Global,
}

/// Assignment targets after their prefixes are evaluated.
enum StoreTarget {
    Local(u32),
    Upvalue(u32),
    Table { base: IndexBase, key: u32 },
}

/// Deduplication key for the constant pool.
#[derive(Hash, PartialEq, Eq)]
enum ConstKey {
    Int(i32),
    Num(u64),
    Str(Vec<u8>),
}

struct LocalSlot {
    name: String,
    reg: u32,
    captured: bool,
    start_pc: u32,
}

struct LoopCtx {
    /// First register of the loop's scope, for closing on break.
    first_reg: u32,
    first_local: usize,
    /// Break jumps to patch to the loop end.
    breaks: Vec<usize>,
}

struct PendingGoto {
    name: String,
    jmp: usize,
    nactvar: usize,
    line: u32,
}

struct FuncState {
    code: Vec<Instr>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    const_index: HashMap<ConstKey, u32>,
    protos: Vec<Arc<Prototype>>,
    upvalues: Vec<UpvalDesc>,
    locals: Vec<LocalSlot>,
    local_debug: Vec<LocalVar>,
    freereg: u32,
    maxstack: u32,
    numparams: u8,
    is_vararg: bool,
    linedefined: u32,
    loops: Vec<LoopCtx>,
    labels: HashMap<String, (usize, usize)>,
    gotos: Vec<PendingGoto>,
    captured_any: bool,
    current_line: u32,
}

impl FuncState {
    fn new(numparams: u8, is_vararg: bool, linedefined: u32) -> FuncState {
        FuncState {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            const_index: HashMap::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            local_debug: Vec::new(),
            freereg: 0,
            maxstack: 2,
            numparams,
            is_vararg,
            linedefined,
            loops: Vec::new(),
            labels: HashMap::new(),
            gotos: Vec::new(),
            captured_any: false,
            current_line: linedefined,
        }
    }

    fn pc(&self) -> usize {
        self.code.len()
    }
}

pub struct CodeGen {
    chunk: String,
    stack: Vec<FuncState>,
}

/// Compiles a parsed chunk into its root prototype. The chunk is
/// compiled as a vararg function with one upvalue, the environment.
pub fn generate(chunk: &str, block: &Block) -> Result<Arc<Prototype>, CompileError> {
    let mut generator = CodeGen {
        chunk: chunk.to_string(),
        stack: Vec::new(),
    };
    let mut main = FuncState::new(0, true, 0);
    main.upvalues.push(UpvalDesc {
        name: "_ENV".to_string(),
        in_stack: false,
        index: 0,
    });
    generator.stack.push(main);
    generator.gen_block(block)?;
    generator.finish_function(0)
}

impl CodeGen {
    fn fs(&mut self) -> &mut FuncState {
        self.stack.last_mut().expect("function state stack is never empty")
    }

    fn fs_ref(&self) -> &FuncState {
        self.stack.last().expect("function state stack is never empty")
    }

    fn error(&self, line: u32, message: impl Into<String>) -> CompileError {
        CompileError::new(&self.chunk, line, message)
    }

    // ----- emission ---------------------------------------------------

    fn emit(&mut self, i: Instr) -> usize {
        let line = self.fs_ref().current_line;
        let fs = self.fs();
        fs.code.push(i);
        fs.lines.push(line);
        fs.code.len() - 1
    }

    fn set_line(&mut self, line: u32) {
        self.fs().current_line = line;
    }

    /// Patches the jump at `jmp` to land on the next emitted instruction.
    fn patch_here(&mut self, jmp: usize) {
        let target = self.fs_ref().pc();
        self.patch_to(jmp, target);
    }

    fn patch_to(&mut self, jmp: usize, target: usize) {
        let offset = target as i64 - (jmp as i64 + 1);
        self.fs().code[jmp].set_sbx(offset as i32);
    }

    // ----- registers --------------------------------------------------

    fn reserve(&mut self, n: u32, line: u32) -> Result<u32, CompileError> {
        let fs = self.fs();
        let base = fs.freereg;
        fs.freereg += n;
        if fs.freereg > MAX_REGISTERS {
            return Err(self.error(line, "function or expression too complex"));
        }
        let free = self.fs_ref().freereg;
        let fs = self.fs();
        fs.maxstack = fs.maxstack.max(free);
        Ok(base)
    }

    fn free_to(&mut self, mark: u32) {
        self.fs().freereg = mark;
    }

    fn nactvar(&self) -> u32 {
        self.fs_ref().locals.len() as u32
    }

    // ----- constants --------------------------------------------------

    fn add_constant(&mut self, key: ConstKey, value: Value) -> u32 {
        let fs = self.fs();
        if let Some(&index) = fs.const_index.get(&key) {
            return index;
        }
        let index = fs.constants.len() as u32;
        fs.constants.push(value);
        fs.const_index.insert(key, index);
        index
    }

    fn const_int(&mut self, i: i32) -> u32 {
        self.add_constant(ConstKey::Int(i), Value::Integer(i))
    }

    fn const_num(&mut self, n: f64) -> u32 {
        self.add_constant(ConstKey::Num(n.to_bits()), Value::Number(n))
    }

    fn const_str(&mut self, s: &[u8]) -> u32 {
        self.add_constant(ConstKey::Str(s.to_vec()), Value::Str(LuaStr::new(s)))
    }

    fn emit_load_constant(&mut self, reg: u32, index: u32) {
        if index <= instr::MAX_BX {
            self.emit(Instr::abx(OpCode::LoadK, reg, index));
        } else {
            self.emit(Instr::abx(OpCode::LoadKx, reg, 0));
            self.emit(Instr::ax(OpCode::ExtraArg, index));
        }
    }

    // ----- scope ------------------------------------------------------

    fn declare_local(&mut self, name: &str, reg: u32) {
        let start_pc = self.fs_ref().pc() as u32;
        self.fs().locals.push(LocalSlot {
            name: name.to_string(),
            reg,
            captured: false,
            start_pc,
        });
    }

    fn pop_locals(&mut self, keep: usize) -> bool {
        let end_pc = self.fs_ref().pc() as u32;
        let mut any_captured = false;
        let fs = self.fs();
        while fs.locals.len() > keep {
            let slot = fs.locals.pop().expect("length checked");
            any_captured |= slot.captured;
            fs.local_debug.push(LocalVar {
                name: slot.name,
                start_pc: slot.start_pc,
                end_pc,
            });
        }
        fs.freereg = fs.locals.len() as u32;
        any_captured
    }

    /// Emits the close-upvalues jump for a scope whose locals were
    /// captured: a jump to the next instruction whose A operand tells the
    /// interpreter which registers stop being visible.
    fn emit_close(&mut self, from_reg: u32) {
        let jmp = self.emit(Instr::asbx(OpCode::Jmp, from_reg + 1, 0));
        self.patch_here(jmp);
    }

    fn find_local(&self, level: usize, name: &str) -> Option<u32> {
        self.stack[level]
            .locals
            .iter()
            .rev()
            .find(|slot| slot.name == name)
            .map(|slot| slot.reg)
    }

    /// Resolves a name at function-nesting `level`, creating upvalue
    /// chains through enclosing functions as needed.
    fn resolve_at(&mut self, level: usize, name: &str, line: u32) -> Result<NameRef, CompileError> {
        if let Some(reg) = self.find_local(level, name) {
            return Ok(NameRef::Local(reg));
        }
        if let Some(index) = self.stack[level]
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Ok(NameRef::Upvalue(index as u32));
        }
        if level == 0 {
            return Ok(NameRef::Global);
        }
        let resolved = self.resolve_at(level - 1, name, line)?;
        let desc = match resolved {
            NameRef::Local(reg) => {
                // Mark the defining slot so its scope closes the upvalue.
                let parent = &mut self.stack[level - 1];
                if let Some(slot) = parent
                    .locals
                    .iter_mut()
                    .rev()
                    .find(|slot| slot.name == name)
                {
                    slot.captured = true;
                }
                parent.captured_any = true;
                UpvalDesc {
                    name: name.to_string(),
                    in_stack: true,
                    index: reg as u8,
                }
            }
            NameRef::Upvalue(index) => UpvalDesc {
                name: name.to_string(),
                in_stack: false,
                index: index as u8,
            },
            NameRef::Global => return Ok(NameRef::Global),
        };
        let ups = &mut self.stack[level].upvalues;
        if ups.len() >= MAX_UPVALUES {
            return Err(self.error(line, "too many upvalues"));
        }
        ups.push(desc);
        Ok(NameRef::Upvalue(ups.len() as u32 - 1))
    }

    fn resolve(&mut self, name: &str, line: u32) -> Result<NameRef, CompileError> {
        self.resolve_at(self.stack.len() - 1, name, line)
    }

    /// The `_ENV` upvalue (or, unusually, local) for global access.
    fn env_base(&mut self, line: u32) -> Result<IndexBase, CompileError> {
        match self.resolve("_ENV", line)? {
            NameRef::Local(reg) => Ok(IndexBase::Register(reg)),
            NameRef::Upvalue(index) => Ok(IndexBase::Upvalue(index)),
            NameRef::Global => Err(self.error(line, "no environment in scope")),
        }
    }

    // ----- expressions ------------------------------------------------

    /// Compiles `e` so its single value ends up exactly in `reg`.
    fn expr_to_reg(&mut self, e: &Expr, reg: u32) -> Result<(), CompileError> {
        self.set_line(e.line);
        let mark = self.fs_ref().freereg;
        match &e.kind {
            ExprKind::Nil => {
                self.emit(Instr::abc(OpCode::LoadNil, reg, 0, 0));
            }
            ExprKind::True => {
                self.emit(Instr::abc(OpCode::LoadBool, reg, 1, 0));
            }
            ExprKind::False => {
                self.emit(Instr::abc(OpCode::LoadBool, reg, 0, 0));
            }
            ExprKind::Int(i) => {
                let k = self.const_int(*i);
                self.emit_load_constant(reg, k);
            }
            ExprKind::Num(n) => {
                let k = self.const_num(*n);
                self.emit_load_constant(reg, k);
            }
            ExprKind::Str(s) => {
                let k = self.const_str(s);
                self.emit_load_constant(reg, k);
            }
            ExprKind::Vararg => {
                if !self.fs_ref().is_vararg {
                    return Err(self.error(e.line, "cannot use '...' outside a vararg function"));
                }
                self.emit(Instr::abc(OpCode::Vararg, reg, 2, 0));
            }
            ExprKind::Name(name) => match self.resolve(name, e.line)? {
                NameRef::Local(r) => {
                    if r != reg {
                        self.emit(Instr::abc(OpCode::Move, reg, r, 0));
                    }
                }
                NameRef::Upvalue(index) => {
                    self.emit(Instr::abc(OpCode::GetUpval, reg, index, 0));
                }
                NameRef::Global => {
                    let key = self.const_str(name.as_bytes());
                    let env = self.env_base(e.line)?;
                    self.emit_index_get(reg, env, instr::rk_as_k(key), e.line)?;
                }
            },
            ExprKind::Index(table, key) => {
                let base = self.index_base(table)?;
                let key_rk = self.expr_to_rk(key)?;
                self.emit_index_get(reg, base, key_rk, e.line)?;
            }
            ExprKind::Paren(inner) => self.expr_to_reg(inner, reg)?,
            ExprKind::Call { .. } => {
                let result = self.gen_call(e, 1)?;
                if result != reg {
                    self.emit(Instr::abc(OpCode::Move, reg, result, 0));
                }
            }
            ExprKind::Function(body) => {
                let proto_index = self.gen_closure(body)?;
                self.emit(Instr::abx(OpCode::Closure, reg, proto_index));
            }
            ExprKind::Table(items) => self.gen_table(items, reg, e.line)?,
            ExprKind::Unary(op, operand) => {
                let rb = self.expr_to_anyreg(operand)?;
                let opcode = match op {
                    UnOp::Neg => OpCode::Unm,
                    UnOp::Not => OpCode::Not,
                    UnOp::Len => OpCode::Len,
                };
                self.set_line(e.line);
                self.emit(Instr::abc(opcode, reg, rb, 0));
            }
            ExprKind::Binary(op, left, right) => {
                self.gen_binary(*op, left, right, reg, e.line)?;
            }
        }
        self.free_to(mark.max(self.nactvar()).max(if reg >= mark { reg + 1 } else { mark }));
        Ok(())
    }

    /// Result register for binary operators and friends.
    fn gen_binary(
        &mut self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        reg: u32,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                let mark = self.fs_ref().freereg;
                let rb = self.expr_to_rk(left)?;
                let rc = self.expr_to_rk(right)?;
                let opcode = match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::Mod => OpCode::Mod,
                    _ => OpCode::Pow,
                };
                self.set_line(line);
                self.emit(Instr::abc(opcode, reg, rb, rc));
                self.free_to(mark.max(self.nactvar()));
            }
            BinOp::Concat => {
                // CONCAT needs its operands in consecutive registers;
                // flatten right-leaning chains into one range.
                let mut parts = Vec::new();
                flatten_concat(left, right, &mut parts);
                let mark = self.fs_ref().freereg;
                let base = self.reserve(0, line)?;
                for part in &parts {
                    let r = self.reserve(1, part.line)?;
                    self.expr_to_reg(part, r)?;
                    // Keep the temporaries: CONCAT consumes the range.
                    self.fs().freereg = r + 1;
                    let free = self.fs_ref().freereg;
                    let fs = self.fs();
                    fs.maxstack = fs.maxstack.max(free);
                }
                self.set_line(line);
                self.emit(Instr::abc(
                    OpCode::Concat,
                    reg,
                    base,
                    base + parts.len() as u32 - 1,
                ));
                self.free_to(mark.max(self.nactvar()));
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let mark = self.fs_ref().freereg;
                let (opcode, a_operand, lhs, rhs) = comparison_plan(op, left, right);
                let rb = self.expr_to_rk(lhs)?;
                let rc = self.expr_to_rk(rhs)?;
                self.set_line(line);
                // Truth lands as: skip the jump on a match, so the jump
                // routes to the false LOADBOOL.
                self.emit(Instr::abc(opcode, a_operand, rb, rc));
                self.emit(Instr::asbx(OpCode::Jmp, 0, 1));
                self.emit(Instr::abc(OpCode::LoadBool, reg, 0, 1));
                self.emit(Instr::abc(OpCode::LoadBool, reg, 1, 0));
                self.free_to(mark.max(self.nactvar()));
            }
            BinOp::And => {
                self.expr_to_reg(left, reg)?;
                self.set_line(line);
                self.emit(Instr::abc(OpCode::Test, reg, 0, 0));
                let skip = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.expr_to_reg(right, reg)?;
                self.patch_here(skip);
            }
            BinOp::Or => {
                self.expr_to_reg(left, reg)?;
                self.set_line(line);
                self.emit(Instr::abc(OpCode::Test, reg, 0, 1));
                let skip = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.expr_to_reg(right, reg)?;
                self.patch_here(skip);
            }
        }
        Ok(())
    }

    /// Value into a fresh register above the temporaries.
    fn expr_to_next_reg(&mut self, e: &Expr) -> Result<u32, CompileError> {
        let reg = self.reserve(1, e.line)?;
        self.expr_to_reg(e, reg)?;
        // expr_to_reg trims temporaries; re-assert ownership of reg.
        let fs = self.fs();
        fs.freereg = fs.freereg.max(reg + 1);
        Ok(reg)
    }

    /// Value in some register; locals are used in place.
    fn expr_to_anyreg(&mut self, e: &Expr) -> Result<u32, CompileError> {
        if let ExprKind::Name(name) = &e.kind {
            if let NameRef::Local(reg) = self.resolve(name, e.line)? {
                return Ok(reg);
            }
        }
        self.expr_to_next_reg(e)
    }

    /// RK operand: a constant-pool reference for literals that fit the
    /// RK space, otherwise a register.
    fn expr_to_rk(&mut self, e: &Expr) -> Result<u32, CompileError> {
        let constant = match &e.kind {
            ExprKind::Int(i) => Some(self.const_int(*i)),
            ExprKind::Num(n) => Some(self.const_num(*n)),
            ExprKind::Str(s) => Some(self.const_str(s)),
            _ => None,
        };
        match constant {
            Some(index) if index < instr::BIT_RK => Ok(instr::rk_as_k(index)),
            _ => self.expr_to_anyreg(e),
        }
    }

    fn index_base(&mut self, table: &Expr) -> Result<IndexBase, CompileError> {
        if let ExprKind::Name(name) = &table.kind {
            match self.resolve(name, table.line)? {
                NameRef::Local(reg) => return Ok(IndexBase::Register(reg)),
                NameRef::Upvalue(index) => return Ok(IndexBase::Upvalue(index)),
                NameRef::Global => {
                    // Globals read through the environment first.
                    let reg = self.reserve(1, table.line)?;
                    let key = self.const_str(name.as_bytes());
                    let env = self.env_base(table.line)?;
                    self.emit_index_get(reg, env, instr::rk_as_k(key), table.line)?;
                    return Ok(IndexBase::Register(reg));
                }
            }
        }
        Ok(IndexBase::Register(self.expr_to_anyreg(table)?))
    }

    fn emit_index_get(
        &mut self,
        reg: u32,
        base: IndexBase,
        key_rk: u32,
        line: u32,
    ) -> Result<(), CompileError> {
        self.set_line(line);
        match base {
            IndexBase::Register(rb) => {
                self.emit(Instr::abc(OpCode::GetTable, reg, rb, key_rk));
            }
            IndexBase::Upvalue(up) => {
                self.emit(Instr::abc(OpCode::GetTabUp, reg, up, key_rk));
            }
        }
        Ok(())
    }

    /// Compiles a call expression; returns the register holding the
    /// first of `want` results (`want` >= 1).
    fn gen_call(&mut self, e: &Expr, want: u32) -> Result<u32, CompileError> {
        let base = self.gen_call_multi(e, CallResults::Fixed(want))?;
        Ok(base)
    }

    fn gen_call_multi(&mut self, e: &Expr, results: CallResults) -> Result<u32, CompileError> {
        let ExprKind::Call { func, method, args } = &e.kind else {
            return Err(self.error(e.line, "internal: gen_call on a non-call expression"));
        };
        let base = self.reserve(1, e.line)?;
        let mut argbase = base + 1;
        match method {
            Some(name) => {
                self.expr_to_reg(func, base)?;
                self.fs().freereg = base + 1;
                self.reserve(1, e.line)?;
                let key = self.const_str(name.as_bytes());
                self.set_line(e.line);
                self.emit(Instr::abc(OpCode::SelfOp, base, base, instr::rk_as_k(key)));
                argbase += 1;
            }
            None => {
                self.expr_to_reg(func, base)?;
                self.fs().freereg = base + 1;
            }
        }
        // Arguments go in consecutive registers above the callee.
        let mut fixed_args = argbase - base - 1;
        let mut variable_tail = false;
        for (i, a) in args.iter().enumerate() {
            let last = i + 1 == args.len();
            if last && is_multi_expr(a) {
                self.gen_multi_into_top(a)?;
                variable_tail = true;
            } else {
                let r = self.reserve(1, a.line)?;
                self.expr_to_reg(a, r)?;
                self.fs().freereg = r + 1;
                let free = self.fs_ref().freereg;
                let fs = self.fs();
                fs.maxstack = fs.maxstack.max(free);
                fixed_args += 1;
            }
        }
        let b = if variable_tail { 0 } else { fixed_args + 1 };
        self.set_line(e.line);
        match results {
            CallResults::Fixed(n) => {
                self.emit(Instr::abc(OpCode::Call, base, b, n + 1));
                self.fs().freereg = base + n.max(1);
                let free = self.fs_ref().freereg;
                let fs = self.fs();
                fs.maxstack = fs.maxstack.max(free);
            }
            CallResults::Multi => {
                self.emit(Instr::abc(OpCode::Call, base, b, 0));
                self.fs().freereg = base;
            }
            CallResults::Tail => {
                // The frame is reused; nothing after this runs.
                self.emit(Instr::abc(OpCode::TailCall, base, b, 0));
                self.fs().freereg = base;
            }
        }
        Ok(base)
    }

    /// Emits a multi-valued expression (call or vararg) leaving all its
    /// results at the current top.
    fn gen_multi_into_top(&mut self, e: &Expr) -> Result<(), CompileError> {
        match &e.kind {
            ExprKind::Call { .. } => {
                self.gen_call_multi(e, CallResults::Multi)?;
            }
            ExprKind::Vararg => {
                if !self.fs_ref().is_vararg {
                    return Err(self.error(e.line, "cannot use '...' outside a vararg function"));
                }
                let base = self.reserve(1, e.line)?;
                self.set_line(e.line);
                self.emit(Instr::abc(OpCode::Vararg, base, 0, 0));
                self.fs().freereg = base;
            }
            _ => return Err(self.error(e.line, "internal: not a multi-valued expression")),
        }
        Ok(())
    }

    /// Leaves exactly `want` values in consecutive registers starting at
    /// the current top. Extra expressions still evaluate for their side
    /// effects; missing values pad with nil; a trailing call or vararg
    /// expands to fill.
    fn expr_list_to_regs(&mut self, exprs: &[Expr], want: u32, line: u32) -> Result<u32, CompileError> {
        let base = self.fs_ref().freereg;
        if exprs.is_empty() {
            if want > 0 {
                self.reserve(want, line)?;
                self.emit(Instr::abc(OpCode::LoadNil, base, want - 1, 0));
            }
            return Ok(base);
        }
        let head = &exprs[..exprs.len() - 1];
        let last = &exprs[exprs.len() - 1];
        for e in head {
            let r = self.reserve(1, e.line)?;
            self.expr_to_reg(e, r)?;
            self.fs().freereg = r + 1;
        }
        let produced = head.len() as u32;
        if produced >= want {
            // Evaluate the tail for effect, then drop the extras.
            let r = self.reserve(1, last.line)?;
            self.expr_to_reg(last, r)?;
            self.fs().freereg = base + want;
        } else {
            let need = want - produced;
            if is_multi_expr(last) {
                match &last.kind {
                    ExprKind::Call { .. } => {
                        let call_base = self.gen_call_multi(last, CallResults::Fixed(need))?;
                        debug_assert_eq!(call_base, base + produced);
                    }
                    ExprKind::Vararg => {
                        let r = self.reserve(need, last.line)?;
                        self.set_line(last.line);
                        self.emit(Instr::abc(OpCode::Vararg, r, need + 1, 0));
                    }
                    _ => unreachable!("is_multi_expr is exhaustive"),
                }
                self.fs().freereg = base + want;
            } else {
                let r = self.reserve(1, last.line)?;
                self.expr_to_reg(last, r)?;
                self.fs().freereg = r + 1;
                if need > 1 {
                    let pad = self.reserve(need - 1, line)?;
                    self.emit(Instr::abc(OpCode::LoadNil, pad, need - 2, 0));
                }
            }
        }
        let free = self.fs_ref().freereg;
        let fs = self.fs();
        fs.maxstack = fs.maxstack.max(free);
        Ok(base)
    }

    fn gen_table(&mut self, items: &[TableItem], reg: u32, line: u32) -> Result<(), CompileError> {
        // SETLIST flushes registers t+1.. into the table at t, so the
        // constructor always builds at the top of the frame and moves
        // the finished table down if the caller wanted it elsewhere.
        let mark = self.fs_ref().freereg;
        let t = if mark == reg + 1 { reg } else { self.reserve(1, line)? };
        let array_count = items
            .iter()
            .filter(|i| matches!(i, TableItem::Item(_)))
            .count() as u32;
        let hash_count = items.len() as u32 - array_count;
        self.set_line(line);
        self.emit(Instr::abc(
            OpCode::NewTable,
            t,
            instr::int_to_fb(array_count),
            instr::int_to_fb(hash_count),
        ));
        let mut flushed = 0u32; // array items already in the table
        let mut pending = 0u32; // array items sitting in registers
        let mut item_iter = items.iter().peekable();
        while let Some(item) = item_iter.next() {
            match item {
                TableItem::Pair(key, value) => {
                    let pair_mark = self.fs_ref().freereg;
                    let key_rk = self.expr_to_rk(key)?;
                    let value_rk = self.expr_to_rk(value)?;
                    self.set_line(line);
                    self.emit(Instr::abc(OpCode::SetTable, t, key_rk, value_rk));
                    self.free_to(pair_mark);
                }
                TableItem::Item(value) => {
                    let last_positional = !item_iter
                        .clone()
                        .any(|i| matches!(i, TableItem::Item(_)));
                    if last_positional && is_multi_expr(value) {
                        self.gen_multi_into_top(value)?;
                        // Variable-count flush of the open batch.
                        self.emit_setlist(t, 0, flushed, line)?;
                        pending = 0;
                        continue;
                    }
                    let r = self.reserve(1, value.line)?;
                    self.expr_to_reg(value, r)?;
                    self.fs().freereg = r + 1;
                    pending += 1;
                    if pending == FIELDS_PER_FLUSH {
                        self.emit_setlist(t, pending, flushed, line)?;
                        flushed += pending;
                        pending = 0;
                        self.fs().freereg = t + 1;
                    }
                }
            }
        }
        if pending > 0 {
            self.emit_setlist(t, pending, flushed, line)?;
        }
        if t != reg {
            self.emit(Instr::abc(OpCode::Move, reg, t, 0));
        }
        self.free_to(mark.max(self.nactvar()));
        Ok(())
    }

    /// SETLIST for the batch ending at the current top. `count` == 0
    /// means "up to the top" (variable tail).
    fn emit_setlist(
        &mut self,
        table_reg: u32,
        count: u32,
        flushed: u32,
        line: u32,
    ) -> Result<(), CompileError> {
        let block = flushed / FIELDS_PER_FLUSH + 1;
        self.set_line(line);
        if block <= instr::MAX_C {
            self.emit(Instr::abc(OpCode::SetList, table_reg, count, block));
        } else {
            self.emit(Instr::abc(OpCode::SetList, table_reg, count, 0));
            self.emit(Instr::ax(OpCode::ExtraArg, block));
        }
        Ok(())
    }

    fn gen_closure(&mut self, body: &FuncBody) -> Result<u32, CompileError> {
        let mut fs = FuncState::new(body.params.len() as u8, body.is_vararg, body.line);
        fs.freereg = body.params.len() as u32;
        fs.maxstack = fs.maxstack.max(fs.freereg);
        self.stack.push(fs);
        for (i, p) in body.params.iter().enumerate() {
            self.declare_local(p, i as u32);
        }
        self.gen_block(&body.body)?;
        let proto = self.finish_function(body.end_line)?;
        let fs = self.fs();
        fs.protos.push(proto);
        Ok(fs.protos.len() as u32 - 1)
    }

    /// Seals the function on top of the stack into a prototype.
    fn finish_function(&mut self, end_line: u32) -> Result<Arc<Prototype>, CompileError> {
        // Implicit return for functions that fall off the end.
        self.emit(Instr::abc(OpCode::Return, 0, 1, 0));
        self.pop_locals(0);
        let fs = self.stack.pop().expect("finishing an open function");
        let mut code = fs.code;
        // Resolve function-level gotos now every label is known.
        for pending in &fs.gotos {
            let Some(&(target, label_nactvar)) = fs.labels.get(&pending.name) else {
                return Err(self.error(
                    pending.line,
                    format!("no visible label '{}' for goto", pending.name),
                ));
            };
            let offset = target as i64 - (pending.jmp as i64 + 1);
            code[pending.jmp].set_sbx(offset as i32);
            if fs.captured_any && pending.nactvar > label_nactvar {
                code[pending.jmp].set_a(label_nactvar as u32 + 1);
            }
        }
        Ok(Arc::new(Prototype {
            source: self.chunk.clone(),
            linedefined: fs.linedefined,
            lastlinedefined: end_line,
            numparams: fs.numparams,
            is_vararg: fs.is_vararg,
            maxstacksize: fs.maxstack.min(255) as u8,
            code,
            constants: fs.constants,
            protos: fs.protos,
            upvalues: fs.upvalues,
            locals: fs.local_debug,
            lineinfo: fs.lines,
        }))
    }

    // ----- statements -------------------------------------------------

    fn gen_block(&mut self, block: &Block) -> Result<(), CompileError> {
        let keep = self.fs_ref().locals.len();
        let first_reg = self.nactvar();
        for stat in &block.stats {
            self.gen_stat(stat)?;
            // Temporaries do not survive statements.
            let floor = self.nactvar();
            self.free_to(floor);
        }
        if self.pop_locals(keep) {
            self.emit_close(first_reg);
        }
        Ok(())
    }

    fn gen_stat(&mut self, stat: &Stat) -> Result<(), CompileError> {
        self.set_line(stat.line);
        match &stat.kind {
            StatKind::Call(e) => {
                self.gen_call_multi(e, CallResults::Fixed(0))?;
            }
            StatKind::Local(names, exprs) => {
                let base = self.expr_list_to_regs(exprs, names.len() as u32, stat.line)?;
                for (i, name) in names.iter().enumerate() {
                    self.declare_local(name, base + i as u32);
                }
            }
            StatKind::LocalFunction(name, body) => {
                // The local is in scope inside its own body.
                let reg = self.reserve(1, stat.line)?;
                self.declare_local(name, reg);
                let proto_index = self.gen_closure(body)?;
                self.set_line(stat.line);
                self.emit(Instr::abx(OpCode::Closure, reg, proto_index));
            }
            StatKind::Function(target, body) => {
                let proto_index = self.gen_closure(body)?;
                let reg = self.reserve(1, stat.line)?;
                self.set_line(stat.line);
                self.emit(Instr::abx(OpCode::Closure, reg, proto_index));
                self.store_into(target, reg)?;
                self.free_to(self.nactvar());
            }
            StatKind::Assign(targets, values) => {
                self.gen_assign(targets, values, stat.line)?;
            }
            StatKind::Do(block) => self.gen_block(block)?,
            StatKind::Return(exprs) => self.gen_return(exprs, stat.line)?,
            StatKind::If { arms, else_block } => {
                let mut done_jumps = Vec::new();
                let mut next_arm: Option<usize> = None;
                for (i, (condition, body)) in arms.iter().enumerate() {
                    if let Some(jmp) = next_arm.take() {
                        self.patch_here(jmp);
                    }
                    let false_jmp = self.cond_false_jump(condition)?;
                    self.gen_block(body)?;
                    let more = i + 1 < arms.len() || else_block.is_some();
                    if more {
                        done_jumps.push(self.emit(Instr::asbx(OpCode::Jmp, 0, 0)));
                    }
                    next_arm = Some(false_jmp);
                }
                if let Some(jmp) = next_arm.take() {
                    self.patch_here(jmp);
                }
                if let Some(body) = else_block {
                    self.gen_block(body)?;
                }
                for jmp in done_jumps {
                    self.patch_here(jmp);
                }
            }
            StatKind::While(condition, body) => {
                let start = self.fs_ref().pc();
                let false_jmp = self.cond_false_jump(condition)?;
                self.enter_loop();
                self.gen_block(body)?;
                let back = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.patch_to(back, start);
                self.patch_here(false_jmp);
                self.leave_loop();
            }
            StatKind::Repeat(body, condition) => {
                let start = self.fs_ref().pc();
                self.enter_loop();
                // The until expression sees the body's locals, so the
                // body block stays open until after the condition.
                let keep = self.fs_ref().locals.len();
                let first_reg = self.nactvar();
                for s in &body.stats {
                    self.gen_stat(s)?;
                    let floor = self.nactvar();
                    self.free_to(floor);
                }
                let back = self.cond_false_jump(condition)?;
                self.patch_to(back, start);
                if self.pop_locals(keep) {
                    // Each trip around must close the iteration's
                    // captured locals, and so must the natural exit.
                    self.fs().code[back].set_a(first_reg + 1);
                    self.emit_close(first_reg);
                }
                self.leave_loop();
            }
            StatKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                let base = self.fs_ref().freereg;
                self.reserve(4, stat.line)?;
                self.expr_to_reg(start, base)?;
                self.expr_to_reg(limit, base + 1)?;
                match step {
                    Some(e) => self.expr_to_reg(e, base + 2)?,
                    None => {
                        let k = self.const_int(1);
                        self.emit_load_constant(base + 2, k);
                    }
                }
                self.fs().freereg = base + 4;
                self.declare_local("(for index)", base);
                self.declare_local("(for limit)", base + 1);
                self.declare_local("(for step)", base + 2);
                self.set_line(stat.line);
                let prep = self.emit(Instr::asbx(OpCode::ForPrep, base, 0));
                self.enter_loop();
                let body_start = self.fs_ref().pc();
                let keep = self.fs_ref().locals.len();
                self.declare_local(var, base + 3);
                for s in &body.stats {
                    self.gen_stat(s)?;
                    let floor = self.nactvar();
                    self.free_to(floor);
                }
                if self.pop_locals(keep) {
                    self.emit_close(base + 3);
                }
                self.set_line(stat.line);
                let forloop = self.emit(Instr::asbx(OpCode::ForLoop, base, 0));
                self.patch_to(forloop, body_start);
                self.patch_to(prep, forloop);
                self.leave_loop();
                self.pop_locals(keep - 3);
            }
            StatKind::GenericFor { names, exprs, body } => {
                let base = self.expr_list_to_regs(exprs, 3, stat.line)?;
                self.declare_local("(for generator)", base);
                self.declare_local("(for state)", base + 1);
                self.declare_local("(for control)", base + 2);
                // Result registers for the iterator's values.
                self.reserve(names.len() as u32, stat.line)?;
                let entry = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.enter_loop();
                let body_start = self.fs_ref().pc();
                let keep = self.fs_ref().locals.len();
                for (i, name) in names.iter().enumerate() {
                    self.declare_local(name, base + 3 + i as u32);
                }
                for s in &body.stats {
                    self.gen_stat(s)?;
                    let floor = self.nactvar();
                    self.free_to(floor);
                }
                if self.pop_locals(keep) {
                    self.emit_close(base + 3);
                }
                self.patch_here(entry);
                self.set_line(stat.line);
                self.emit(Instr::abc(OpCode::TForCall, base, 0, names.len() as u32));
                let tforloop = self.emit(Instr::asbx(OpCode::TForLoop, base + 2, 0));
                self.patch_to(tforloop, body_start);
                self.leave_loop();
                self.pop_locals(keep - 3);
            }
            StatKind::Break => {
                if self.fs_ref().loops.is_empty() {
                    return Err(self.error(stat.line, "break outside a loop"));
                }
                let jmp = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.fs()
                    .loops
                    .last_mut()
                    .expect("emptiness checked above")
                    .breaks
                    .push(jmp);
            }
            StatKind::Goto(name) => {
                let nactvar = self.fs_ref().locals.len();
                let jmp = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                let line = stat.line;
                self.fs().gotos.push(PendingGoto {
                    name: name.clone(),
                    jmp,
                    nactvar,
                    line,
                });
            }
            StatKind::Label(name) => {
                let pc = self.fs_ref().pc();
                let nactvar = self.fs_ref().locals.len();
                self.fs().labels.insert(name.clone(), (pc, nactvar));
            }
        }
        Ok(())
    }

    fn gen_return(&mut self, exprs: &[Expr], line: u32) -> Result<(), CompileError> {
        if exprs.is_empty() {
            self.emit(Instr::abc(OpCode::Return, 0, 1, 0));
            return Ok(());
        }
        // `return f(...)` is a proper tail call: the callee takes over
        // the frame instead of growing the native stack.
        if exprs.len() == 1 {
            if let ExprKind::Call { .. } = &exprs[0].kind {
                let base = self.gen_call_multi(&exprs[0], CallResults::Tail)?;
                self.set_line(line);
                self.emit(Instr::abc(OpCode::Return, base, 0, 0));
                self.free_to(self.nactvar());
                return Ok(());
            }
        }
        let base = self.fs_ref().freereg;
        let last = &exprs[exprs.len() - 1];
        if is_multi_expr(last) {
            for e in &exprs[..exprs.len() - 1] {
                let r = self.reserve(1, e.line)?;
                self.expr_to_reg(e, r)?;
                self.fs().freereg = r + 1;
            }
            self.gen_multi_into_top(last)?;
            self.set_line(line);
            self.emit(Instr::abc(OpCode::Return, base, 0, 0));
        } else {
            self.expr_list_to_regs(exprs, exprs.len() as u32, line)?;
            self.set_line(line);
            self.emit(Instr::abc(OpCode::Return, base, exprs.len() as u32 + 1, 0));
        }
        self.free_to(self.nactvar());
        Ok(())
    }

    fn gen_assign(
        &mut self,
        targets: &[Expr],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        // Evaluate target prefixes left to right, then the value list,
        // then store right to left.
        let mut prepared = Vec::with_capacity(targets.len());
        for target in targets {
            let store = match &target.kind {
                ExprKind::Name(name) => match self.resolve(name, target.line)? {
                    NameRef::Local(reg) => StoreTarget::Local(reg),
                    NameRef::Upvalue(index) => StoreTarget::Upvalue(index),
                    NameRef::Global => {
                        let key = self.const_str(name.as_bytes());
                        let env = self.env_base(target.line)?;
                        StoreTarget::Table {
                            base: env,
                            key: instr::rk_as_k(key),
                        }
                    }
                },
                ExprKind::Index(table, key) => {
                    let base = self.index_base(table)?;
                    let key_rk = self.expr_to_rk(key)?;
                    StoreTarget::Table { base, key: key_rk }
                }
                _ => return Err(self.error(target.line, "cannot assign to this expression")),
            };
            prepared.push(store);
        }
        let value_base = self.expr_list_to_regs(values, targets.len() as u32, line)?;
        for (i, store) in prepared.into_iter().enumerate() {
            let value_reg = value_base + i as u32;
            self.set_line(line);
            match store {
                StoreTarget::Local(reg) => {
                    self.emit(Instr::abc(OpCode::Move, reg, value_reg, 0));
                }
                StoreTarget::Upvalue(index) => {
                    self.emit(Instr::abc(OpCode::SetUpval, value_reg, index, 0));
                }
                StoreTarget::Table { base, key } => match base {
                    IndexBase::Register(rb) => {
                        self.emit(Instr::abc(OpCode::SetTable, rb, key, value_reg));
                    }
                    IndexBase::Upvalue(up) => {
                        self.emit(Instr::abc(OpCode::SetTabUp, up, key, value_reg));
                    }
                },
            }
        }
        self.free_to(self.nactvar());
        Ok(())
    }

    fn store_into(&mut self, target: &Expr, value_reg: u32) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Name(name) => match self.resolve(name, target.line)? {
                NameRef::Local(reg) => {
                    self.emit(Instr::abc(OpCode::Move, reg, value_reg, 0));
                }
                NameRef::Upvalue(index) => {
                    self.emit(Instr::abc(OpCode::SetUpval, value_reg, index, 0));
                }
                NameRef::Global => {
                    let key = self.const_str(name.as_bytes());
                    match self.env_base(target.line)? {
                        IndexBase::Register(rb) => {
                            self.emit(Instr::abc(
                                OpCode::SetTable,
                                rb,
                                instr::rk_as_k(key),
                                value_reg,
                            ));
                        }
                        IndexBase::Upvalue(up) => {
                            self.emit(Instr::abc(
                                OpCode::SetTabUp,
                                up,
                                instr::rk_as_k(key),
                                value_reg,
                            ));
                        }
                    }
                }
            },
            ExprKind::Index(table, key) => {
                let base = self.index_base(table)?;
                let key_rk = self.expr_to_rk(key)?;
                match base {
                    IndexBase::Register(rb) => {
                        self.emit(Instr::abc(OpCode::SetTable, rb, key_rk, value_reg));
                    }
                    IndexBase::Upvalue(up) => {
                        self.emit(Instr::abc(OpCode::SetTabUp, up, key_rk, value_reg));
                    }
                }
            }
            _ => return Err(self.error(target.line, "cannot assign to this expression")),
        }
        Ok(())
    }

    /// Compiles a condition, emitting a jump taken when it is false.
    /// Returns the jump for the caller to patch.
    fn cond_false_jump(&mut self, e: &Expr) -> Result<usize, CompileError> {
        let mark = self.fs_ref().freereg;
        if let ExprKind::Binary(op, left, right) = &e.kind {
            if matches!(
                op,
                BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
            ) {
                let (opcode, a_truth, lhs, rhs) = comparison_plan(*op, left, right);
                let rb = self.expr_to_rk(lhs)?;
                let rc = self.expr_to_rk(rhs)?;
                self.set_line(e.line);
                // Skip the jump when the comparison result differs from
                // A, i.e. when the condition holds.
                self.emit(Instr::abc(opcode, 1 - a_truth, rb, rc));
                let jmp = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
                self.free_to(mark.max(self.nactvar()));
                return Ok(jmp);
            }
        }
        let reg = self.expr_to_anyreg(e)?;
        self.set_line(e.line);
        self.emit(Instr::abc(OpCode::Test, reg, 0, 0));
        let jmp = self.emit(Instr::asbx(OpCode::Jmp, 0, 0));
        self.free_to(mark.max(self.nactvar()));
        Ok(jmp)
    }

    // ----- loops ------------------------------------------------------

    fn enter_loop(&mut self) {
        let first_reg = self.nactvar();
        let first_local = self.fs_ref().locals.len();
        self.fs().loops.push(LoopCtx {
            first_reg,
            first_local,
            breaks: Vec::new(),
        });
    }

    /// Patches break jumps to the instruction after the loop, closing
    /// upvalues captured inside it on the way out.
    fn leave_loop(&mut self) {
        let ctx = self.fs().loops.pop().expect("leave_loop without enter_loop");
        let captured = self.fs_ref().locals[ctx.first_local.min(self.fs_ref().locals.len())..]
            .iter()
            .any(|slot| slot.captured)
            || self.fs_ref().captured_any;
        for jmp in ctx.breaks {
            self.patch_here(jmp);
            if captured {
                self.fs().code[jmp].set_a(ctx.first_reg + 1);
            }
        }
    }
}

enum CallResults {
    Multi,
    Fixed(u32),
    Tail,
}

fn is_multi_expr(e: &Expr) -> bool {
    matches!(e.kind, ExprKind::Call { .. } | ExprKind::Vararg)
}

/// Normalizes a comparison: opcode, the A operand meaning "condition
/// true", and the operand order (Gt/Ge swap onto Lt/Le).
fn comparison_plan<'e>(
    op: BinOp,
    left: &'e Expr,
    right: &'e Expr,
) -> (OpCode, u32, &'e Expr, &'e Expr) {
    match op {
        BinOp::Eq => (OpCode::Eq, 1, left, right),
        BinOp::Ne => (OpCode::Eq, 0, left, right),
        BinOp::Lt => (OpCode::Lt, 1, left, right),
        BinOp::Le => (OpCode::Le, 1, left, right),
        BinOp::Gt => (OpCode::Lt, 1, right, left),
        BinOp::Ge => (OpCode::Le, 1, right, left),
        _ => unreachable!("comparison_plan called with non-comparison BinOp"),
    }
}

/// Flattens `a .. b .. c` (right associative) into an operand list.
fn flatten_concat<'e>(left: &'e Expr, right: &'e Expr, out: &mut Vec<&'e Expr>) {
    out.push(left);
    if let ExprKind::Binary(BinOp::Concat, l, r) = &right.kind {
        flatten_concat(l, r, out);
    } else {
        out.push(right);
    }
}
