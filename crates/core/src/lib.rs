//! moat-core: the shared foundation of the Moat sandboxed Lua runtime
//!
//! Key design principles:
//! - `Value`: what scripts talk about (nil, booleans, numbers, strings,
//!   tables, functions, threads, userdata)
//! - `Prototype`: the immutable compiled form the interpreter consumes
//! - `Instr`: the packed bytecode word layout shared by the compiler and
//!   the interpreter
//!
//! This crate knows nothing about execution, budgets or the host; it is
//! consumed by both the compiler and the runtime.

pub mod error;
pub mod instr;
pub mod prototype;
pub mod string;
pub mod table;
pub mod value;

pub use error::ScriptError;
pub use instr::{Instr, OpCode};
pub use prototype::{LocalVar, Prototype, UpvalDesc};
pub use string::{LuaStr, drain_string_cache};
pub use table::{Table, TableError, WeakMode};
pub use value::{
    CoroHandle, Function, LuaClosure, NativeFunction, RegisterFile, TableRef, ThreadRef, Upvalue,
    UpvalueCell, Userdata, UserdataRef, Value, Varargs, fmt_number, new_table_value, parse_number,
};
