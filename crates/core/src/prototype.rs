//! Compiled function records
//!
//! A `Prototype` is the immutable output of the compiler and the only
//! path into the interpreter. Prototypes form an immutable forest rooted
//! at the loaded chunk and are freely shared between workers.

use std::sync::Arc;

use crate::instr::Instr;
use crate::value::Value;

/// Describes where a closure finds one upvalue when it is instantiated:
/// either a register of the enclosing frame (`in_stack`) or an upvalue of
/// the enclosing closure.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: String,
    pub in_stack: bool,
    pub index: u8,
}

/// Debug record for one local variable's live range (pc interval).
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// An immutable compiled function.
pub struct Prototype {
    /// Chunk name, used in error prefixes (`source:line: message`).
    pub source: String,
    pub linedefined: u32,
    pub lastlinedefined: u32,
    pub numparams: u8,
    pub is_vararg: bool,
    /// Registers needed by the function's frame.
    pub maxstacksize: u8,
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    pub protos: Vec<Arc<Prototype>>,
    pub upvalues: Vec<UpvalDesc>,
    pub locals: Vec<LocalVar>,
    /// Source line for each pc, parallel to `code`.
    pub lineinfo: Vec<u32>,
}

impl Prototype {
    /// Source line for a pc, or 0 when line info is absent.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lineinfo.get(pc).copied().unwrap_or(0)
    }

    /// `source:line` prefix for error messages at the given pc.
    pub fn location(&self, pc: usize) -> String {
        format!("{}:{}", self.source, self.line_at(pc))
    }
}

impl std::fmt::Debug for Prototype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prototype")
            .field("source", &self.source)
            .field("linedefined", &self.linedefined)
            .field("numparams", &self.numparams)
            .field("is_vararg", &self.is_vararg)
            .field("maxstacksize", &self.maxstacksize)
            .field("code", &self.code.len())
            .field("constants", &self.constants.len())
            .field("protos", &self.protos.len())
            .finish()
    }
}
