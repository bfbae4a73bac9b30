//! The host facade
//!
//! `Globals` is everything an embedding host touches: the environment
//! table, source loading under the length cap, synchronous calls, worker
//! spawning, budget installation, the bounded console queue and the
//! reachable-memory probe. One `Globals` is one sandbox; at most one
//! caller executes bytecode against it at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use moat_core::{
    Function, LuaClosure, NativeFunction, Prototype, ScriptError, Table, TableRef, Value, Varargs,
    UpvalueCell,
};
use tracing::debug;

use crate::error::RuntimeError;
use crate::limiter::{self, Limit, WorkerKey};
use crate::memwalk;
use crate::sched::{self, ResumeOutcome, WorkerShared};
use crate::stdlib;

/// Source compiler seam. The compiler crate implements this; the runtime
/// only ever consumes compiled prototypes. There is no path that accepts
/// precompiled bytecode.
pub trait Loader: Send + Sync {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String>;
}

/// Tunables fixed at sandbox construction.
#[derive(Debug, Clone)]
pub struct GlobalsConfig {
    /// Longest accepted source text, in bytes.
    pub max_source_len: usize,
    /// Console queue capacity; workers yield when it is full.
    pub console_capacity: usize,
}

impl Default for GlobalsConfig {
    fn default() -> Self {
        GlobalsConfig {
            max_source_len: 256 * 1024,
            console_capacity: 32,
        }
    }
}

/// Bounded host-console queue. Scripts enqueue through `print`; the host
/// drains with `try_dequeue`. A full queue is the back-pressure signal
/// that makes a chatty worker yield.
pub(crate) struct Console {
    queue: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Console {
    fn new(capacity: usize) -> Console {
        Console {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueues unless full. Returns false when full.
    pub(crate) fn try_push(&self, message: String) -> bool {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= self.capacity {
            return false;
        }
        q.push_back(message);
        true
    }

    /// Enqueues, evicting the oldest message when full. The main caller
    /// has no yield path, so boundedness wins over completeness there.
    pub(crate) fn push_evicting(&self, message: String) {
        let mut q = self.queue.lock().unwrap();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(message);
    }

    pub(crate) fn try_dequeue(&self) -> Option<String> {
        self.queue.lock().unwrap().pop_front()
    }
}

struct GlobalsCore {
    env: TableRef,
    console: Console,
    /// Class-level metatables for non-table values, keyed by type name.
    class_meta: Mutex<HashMap<&'static str, TableRef>>,
    loader: RwLock<Option<Arc<dyn Loader>>>,
    config: GlobalsConfig,
    /// Budget identity charged by synchronous `call`s.
    main_key: WorkerKey,
    /// Serializes host entry points so at most one caller executes
    /// bytecode against this sandbox.
    exec: Mutex<()>,
}

/// A sandbox instance. Cheap to clone; clones share the sandbox.
#[derive(Clone)]
pub struct Globals {
    core: Arc<GlobalsCore>,
}

/// Non-owning sandbox handle. Registered natives capture this instead of
/// `Globals` so the environment table does not keep itself alive through
/// its own builtins.
#[derive(Clone)]
pub(crate) struct WeakGlobals {
    core: std::sync::Weak<GlobalsCore>,
}

impl WeakGlobals {
    pub(crate) fn upgrade(&self) -> Result<Globals, moat_core::ScriptError> {
        self.core
            .upgrade()
            .map(|core| Globals { core })
            .ok_or_else(|| moat_core::ScriptError::Internal("sandbox torn down".to_string()))
    }
}

/// Host handle to a spawned worker. Dropping every handle (and every
/// `Value::Thread` clone) orphans the worker, which then terminates
/// itself at its next orphan check.
pub struct LuaThread {
    pub(crate) shared: Arc<WorkerShared>,
    owns_budget: bool,
}

impl LuaThread {
    /// The worker as a script value.
    pub fn value(&self) -> Value {
        Value::Thread(self.shared.clone())
    }

    pub fn status(&self) -> &'static str {
        use moat_core::CoroHandle;
        self.shared.status_name()
    }
}

impl Drop for LuaThread {
    fn drop(&mut self) {
        if self.owns_budget {
            limiter::remove(self.shared.limit_key());
        }
    }
}

impl Default for Globals {
    fn default() -> Self {
        Globals::new()
    }
}

impl Globals {
    /// A sandbox with the curated standard libraries registered.
    pub fn new() -> Globals {
        Globals::with_config(GlobalsConfig::default())
    }

    pub fn with_config(config: GlobalsConfig) -> Globals {
        let globals = Globals {
            core: Arc::new(GlobalsCore {
                env: Arc::new(Mutex::new(Table::new())),
                console: Console::new(config.console_capacity),
                class_meta: Mutex::new(HashMap::new()),
                loader: RwLock::new(None),
                config,
                main_key: limiter::allocate_key(),
                exec: Mutex::new(()),
            }),
        };
        stdlib::install(&globals);
        globals
    }

    pub(crate) fn downgrade(&self) -> WeakGlobals {
        WeakGlobals {
            core: Arc::downgrade(&self.core),
        }
    }

    /// The environment table scripts see as `_G` / `_ENV`.
    pub fn env(&self) -> TableRef {
        self.core.env.clone()
    }

    pub fn env_value(&self) -> Value {
        Value::Table(self.core.env.clone())
    }

    /// Reads a global by name.
    pub fn get(&self, name: &str) -> Value {
        self.core.env.lock().unwrap().get(&Value::from(name))
    }

    /// Writes a global by name.
    pub fn set(&self, name: &str, value: Value) {
        self.core
            .env
            .lock()
            .unwrap()
            .set(Value::from(name), value)
            .expect("string keys are always valid");
    }

    /// Registers a host callable under a global name. The host is
    /// responsible for charging instruction cost if the operation is
    /// expensive (`crate::vm::charge_budget`).
    pub fn register(
        &self,
        name: &str,
        func: impl Fn(Varargs) -> Result<Varargs, ScriptError> + Send + Sync + 'static,
    ) {
        let native = NativeFunction::new(name, func);
        self.set(name, Value::Function(Function::Native(native)));
    }

    /// Installs the source compiler. Usually done once at startup by the
    /// embedding shell.
    pub fn install_loader(&self, loader: Arc<dyn Loader>) {
        *self.core.loader.write().unwrap() = Some(loader);
    }

    pub(crate) fn loader(&self) -> Option<Arc<dyn Loader>> {
        self.core.loader.read().unwrap().clone()
    }

    pub(crate) fn console(&self) -> &Console {
        &self.core.console
    }

    /// Class-level metatable for non-table, non-userdata values.
    pub(crate) fn class_metatable(&self, type_name: &str) -> Option<TableRef> {
        self.core.class_meta.lock().unwrap().get(type_name).cloned()
    }

    pub(crate) fn set_class_metatable(&self, type_name: &'static str, mt: TableRef) {
        self.core.class_meta.lock().unwrap().insert(type_name, mt);
    }

    /// Validates and compiles source text into a callable closure bound
    /// to this sandbox's environment.
    pub fn load(&self, source: &[u8], chunk_name: &str) -> Result<Value, RuntimeError> {
        let max = self.core.config.max_source_len;
        if source.len() > max {
            return Err(RuntimeError::ScriptTooLong {
                len: source.len(),
                max,
            });
        }
        let loader = self
            .loader()
            .ok_or_else(|| RuntimeError::Internal("no compiler installed".to_string()))?;
        debug!(chunk = chunk_name, len = source.len(), "compiling chunk");
        let proto = loader
            .compile(source, chunk_name)
            .map_err(RuntimeError::Compile)?;
        Ok(Value::Function(Function::Lua(Arc::new(LuaClosure {
            proto,
            upvalues: vec![UpvalueCell::closed(self.env_value())],
        }))))
    }

    /// Synchronous execution on the caller's thread, charged against the
    /// main budget (if one is installed).
    pub fn call(&self, func: &Value, args: Varargs) -> Result<Varargs, RuntimeError> {
        let _exec = self.core.exec.lock().unwrap();
        let _budget = limiter::enter(self.core.main_key);
        debug!("synchronous call");
        crate::vm::call_value(self, func, args).map_err(RuntimeError::from)
    }

    /// Packages a function as a worker. The worker gets its own budget
    /// identity; install a budget before the first resume.
    pub fn spawn(&self, func: &Value) -> Result<LuaThread, RuntimeError> {
        let function = match func {
            Value::Function(f) => f.clone(),
            other => {
                return Err(RuntimeError::Internal(format!(
                    "cannot spawn a {} value",
                    other.type_name()
                )));
            }
        };
        let key = limiter::allocate_key();
        debug!(limit_key = key, "spawning worker");
        Ok(LuaThread {
            shared: sched::create(self, function, key, true),
            owns_budget: true,
        })
    }

    /// Resumes a worker, blocking until it yields or dies.
    pub fn resume(&self, worker: &LuaThread, args: Varargs) -> ResumeOutcome {
        let _exec = self.core.exec.lock().unwrap();
        sched::resume(&worker.shared, args)
    }

    /// Installs a worker's instruction budget and string cap. First call
    /// only; fails if a budget is already installed.
    pub fn install_limit(
        &self,
        worker: &LuaThread,
        max_instructions: u64,
        max_string_size: usize,
    ) -> Result<(), RuntimeError> {
        limiter::install(worker.shared.limit_key(), max_instructions, max_string_size)
            .map_err(|e| RuntimeError::Internal(e.to_string()))
    }

    /// Zeroes a worker's counter, preserving its caps.
    pub fn reset_limit(&self, worker: &LuaThread) -> bool {
        limiter::reset(worker.shared.limit_key())
    }

    /// Uninstalls a worker's budget. Re-budgeting a worker between
    /// scheduling epochs is remove + install.
    pub fn remove_limit(&self, worker: &LuaThread) -> bool {
        limiter::remove(worker.shared.limit_key())
    }

    /// A worker's budget snapshot.
    pub fn limit_of(&self, worker: &LuaThread) -> Option<Limit> {
        limiter::lookup(worker.shared.limit_key())
    }

    /// Budget for synchronous `call`s on this sandbox.
    pub fn install_main_limit(
        &self,
        max_instructions: u64,
        max_string_size: usize,
    ) -> Result<(), RuntimeError> {
        limiter::install(self.core.main_key, max_instructions, max_string_size)
            .map_err(|e| RuntimeError::Internal(e.to_string()))
    }

    pub fn reset_main_limit(&self) -> bool {
        limiter::reset(self.core.main_key)
    }

    pub fn main_limit(&self) -> Option<Limit> {
        limiter::lookup(self.core.main_key)
    }

    /// Removes the main budget entirely (test harness teardown).
    pub fn remove_main_limit(&self) -> bool {
        limiter::remove(self.core.main_key)
    }

    /// Estimated bytes reachable from the environment table. Advisory;
    /// the host decides what to do with the number.
    pub fn used_memory(&self) -> usize {
        memwalk::reachable_bytes(&self.env_value())
    }

    /// Non-blocking console drain for the host side.
    pub fn try_dequeue(&self) -> Option<String> {
        self.core.console.try_dequeue()
    }
}
