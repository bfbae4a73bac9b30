//! moat-runtime: the hardened interpreter runtime
//!
//! Executes untrusted scripts under hard resource bounds:
//! - a per-worker instruction budget charged before every opcode fetch,
//!   enforced from outside the script's control (`limiter`)
//! - an intermediate-string size cap guarding concatenation loops
//! - a reachable-memory estimator for host admission control (`memwalk`)
//! - a source-length cap at the load boundary (`globals`)
//! - a curated standard surface with no filesystem, process, or binary
//!   chunk access (`stdlib`)
//!
//! Workers (`sched`) turn the hard kill-switch into a schedulable unit:
//! a script at its budget is suspended, measured, reset, and resumed.

pub mod arith;
pub mod error;
pub mod globals;
pub mod limiter;
pub mod memwalk;
pub mod meta;
pub mod sched;
pub mod stdlib;
pub mod vm;

pub use error::RuntimeError;
pub use globals::{Globals, GlobalsConfig, Loader, LuaThread};
pub use limiter::{Limit, WorkerKey};
pub use memwalk::reachable_bytes;
pub use sched::{ORPHAN_CHECK_INTERVAL, Phase, ResumeOutcome};

// The value model is part of the embedding surface.
pub use moat_core::{
    Function, LuaStr, NativeFunction, Prototype, ScriptError, Table, TableRef, Value, Varargs,
};
