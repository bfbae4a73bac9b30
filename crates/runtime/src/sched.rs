//! Coroutine workers
//!
//! A worker packages a script function as a schedulable unit: it runs on
//! its own OS thread, can yield arbitrary values back to the resuming
//! caller, and is resumed with arbitrary arguments. Handoff uses one
//! mutex and a pair of condition variables — the resumer blocks until the
//! worker yields or dies, the worker blocks until the next resume — so at
//! most one side executes bytecode at any moment.
//!
//! Lifecycle:
//!
//! ```text
//!         resume(args)            body returns / raises
//! Initial ───────────► Running ─────────────────────────► Dead
//!                         │  ▲
//!              yield(vals)▼  │resume(args)
//!                      Suspended
//! ```
//!
//! A suspended worker holds only a weak backreference to its shared
//! record. It wakes every `ORPHAN_CHECK_INTERVAL` and, if the host has
//! dropped every handle, terminates itself with an orphan signal that no
//! protected call can intercept.

use std::any::Any;
use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use moat_core::{CoroHandle, Function, RegisterFile, ScriptError, Value, Varargs};
use tracing::{debug, trace};

use crate::globals::Globals;
use crate::limiter::{self, WorkerKey};

/// How often a suspended worker checks whether its host went away.
pub const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Running,
    Suspended,
    Dead,
}

/// Single-slot mailbox between resumer and worker.
enum Mailbox {
    Empty,
    /// Resume arguments travelling to the worker.
    ToWorker(Varargs),
    /// Yielded values travelling to the resumer.
    FromWorker(Varargs),
    /// The body returned; final results.
    Finished(Varargs),
    /// The body raised; the worker is dead.
    Failed(ScriptError),
}

struct State {
    phase: Phase,
    mailbox: Mailbox,
    /// Entry function, consumed when the backing thread spawns.
    entry: Option<Function>,
}

/// The record shared between the host handle, `Value::Thread` clones,
/// and the backing OS thread.
pub struct WorkerShared {
    state: Mutex<State>,
    /// Workers wait here for resume arguments.
    resumed: Condvar,
    /// Resumers wait here for a yield, return, or failure.
    yielded: Condvar,
    /// Budget identity this worker charges against.
    limit_key: WorkerKey,
    /// Host-spawned workers must have a budget installed before they
    /// execute; script-created coroutines inherit their creator's.
    require_limit: bool,
    globals: Globals,
    /// Recovers the typed `Arc` from a `Value::Thread` trait object.
    self_ref: Weak<WorkerShared>,
    /// Register files of the frames parked on the backing thread,
    /// outermost first. The interpreter registers each frame while it is
    /// live so the reachability walker can count a suspended worker's
    /// locals — captured or not.
    frames: Mutex<Vec<Arc<RegisterFile>>>,
}

impl WorkerShared {
    /// The typed shared handle behind a thread value.
    pub fn typed_arc(&self) -> Option<Arc<WorkerShared>> {
        self.self_ref.upgrade()
    }

    /// Registers a live frame's register file.
    pub fn push_frame(&self, regs: Arc<RegisterFile>) {
        self.frames.lock().unwrap().push(regs);
    }

    /// Unregisters the innermost frame on its way out.
    pub fn pop_frame(&self) {
        self.frames.lock().unwrap().pop();
    }

    /// Snapshot of the live frame register files, for the walker.
    pub fn live_registers(&self) -> Vec<Arc<RegisterFile>> {
        self.frames.lock().unwrap().clone()
    }
}

impl WorkerShared {
    pub fn limit_key(&self) -> WorkerKey {
        self.limit_key
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    /// Values parked in the mailbox, for the reachability walker.
    pub fn mailbox_values(&self) -> Varargs {
        let st = self.state.lock().unwrap();
        match &st.mailbox {
            Mailbox::ToWorker(v) | Mailbox::FromWorker(v) | Mailbox::Finished(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// The entry function while not yet spawned, for the walker.
    pub fn entry_function(&self) -> Option<Function> {
        self.state.lock().unwrap().entry.clone()
    }
}

impl CoroHandle for WorkerShared {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn status_name(&self) -> &'static str {
        match self.phase() {
            Phase::Initial | Phase::Suspended => "suspended",
            Phase::Running => "running",
            Phase::Dead => "dead",
        }
    }
}

/// Creates a worker record around an entry function. `require_limit`
/// distinguishes host-spawned workers (fresh budget identity, budget
/// mandatory) from script-created coroutines (inherit the creator's
/// budget identity).
pub fn create(
    globals: &Globals,
    entry: Function,
    limit_key: WorkerKey,
    require_limit: bool,
) -> Arc<WorkerShared> {
    Arc::new_cyclic(|self_ref| WorkerShared {
        state: Mutex::new(State {
            phase: Phase::Initial,
            mailbox: Mailbox::Empty,
            entry: Some(entry),
        }),
        resumed: Condvar::new(),
        yielded: Condvar::new(),
        limit_key,
        require_limit,
        globals: globals.clone(),
        self_ref: self_ref.clone(),
        frames: Mutex::new(Vec::new()),
    })
}

/// What a resume produced, as the host and `coroutine.resume` see it.
#[derive(Debug)]
pub enum ResumeOutcome {
    /// The worker yielded; it is suspended again.
    Yielded(Varargs),
    /// The body returned; the worker is dead.
    Returned(Varargs),
    /// The worker could not run or its body failed; the message is the
    /// second result of `coroutine.resume`.
    Error(String),
}

impl ResumeOutcome {
    pub fn ok(&self) -> bool {
        !matches!(self, ResumeOutcome::Error(_))
    }
}

thread_local! {
    /// The worker whose backing thread we are, when we are one.
    static CURRENT: RefCell<Option<Weak<WorkerShared>>> = const { RefCell::new(None) };
}

/// True when the current OS thread is a worker's backing thread.
pub fn in_worker() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// The currently executing worker, if any.
pub fn current_worker() -> Option<Arc<WorkerShared>> {
    CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

/// Whether the current execution context insists on an installed budget.
pub fn current_requires_limit() -> bool {
    current_worker().is_some_and(|w| w.require_limit)
}

/// Resumes a worker, blocking the caller until it yields or dies.
pub fn resume(shared: &Arc<WorkerShared>, args: Varargs) -> ResumeOutcome {
    let mut st = shared.state.lock().unwrap();
    match st.phase {
        Phase::Dead => return ResumeOutcome::Error("cannot resume dead coroutine".to_string()),
        Phase::Running => {
            return ResumeOutcome::Error("cannot resume non-suspended coroutine".to_string());
        }
        Phase::Initial => {
            let entry = st
                .entry
                .take()
                .expect("initial worker still holds its entry function");
            st.phase = Phase::Running;
            st.mailbox = Mailbox::ToWorker(args);
            drop(st);
            spawn_backing_thread(shared, entry);
            st = shared.state.lock().unwrap();
        }
        Phase::Suspended => {
            st.phase = Phase::Running;
            st.mailbox = Mailbox::ToWorker(args);
            shared.resumed.notify_one();
        }
    }
    loop {
        match &st.mailbox {
            Mailbox::FromWorker(_) | Mailbox::Finished(_) | Mailbox::Failed(_) => break,
            _ => st = shared.yielded.wait(st).unwrap(),
        }
    }
    match std::mem::replace(&mut st.mailbox, Mailbox::Empty) {
        Mailbox::FromWorker(vals) => ResumeOutcome::Yielded(vals),
        Mailbox::Finished(vals) => ResumeOutcome::Returned(vals),
        Mailbox::Failed(err) => ResumeOutcome::Error(err.to_string()),
        _ => unreachable!("loop above waits for a worker-side mailbox state"),
    }
}

fn spawn_backing_thread(shared: &Arc<WorkerShared>, entry: Function) {
    let weak = Arc::downgrade(shared);
    let globals = shared.globals.clone();
    let limit_key = shared.limit_key;
    debug!(limit_key, "spawning worker thread");
    std::thread::Builder::new()
        .name("moat-worker".to_string())
        .spawn(move || worker_main(weak, globals, entry, limit_key))
        .expect("worker thread spawn");
}

fn worker_main(weak: Weak<WorkerShared>, globals: Globals, entry: Function, key: WorkerKey) {
    CURRENT.with(|c| *c.borrow_mut() = Some(weak.clone()));
    let _binding = limiter::enter(key);

    // The first resume parked our arguments before the thread existed.
    let first_args = {
        let Some(shared) = weak.upgrade() else { return };
        let mut st = shared.state.lock().unwrap();
        match std::mem::replace(&mut st.mailbox, Mailbox::Empty) {
            Mailbox::ToWorker(args) => args,
            _ => {
                st.phase = Phase::Dead;
                st.mailbox = Mailbox::Failed(ScriptError::Internal(
                    "worker started without resume arguments".to_string(),
                ));
                shared.yielded.notify_all();
                return;
            }
        }
    };

    let result = crate::vm::call_value(&globals, &Value::Function(entry), first_args);

    if let Some(shared) = weak.upgrade() {
        let mut st = shared.state.lock().unwrap();
        st.phase = Phase::Dead;
        st.mailbox = match result {
            Ok(vals) => Mailbox::Finished(vals),
            Err(err) => {
                debug!(%err, "worker body failed");
                Mailbox::Failed(err)
            }
        };
        shared.yielded.notify_all();
    }
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Yields values to the resuming caller and blocks until the next resume,
/// whose arguments become the return value. While suspended, periodically
/// checks for orphaning.
///
/// Callable only from a worker's backing thread; elsewhere it raises the
/// script-level "yield from outside a coroutine" error.
pub fn yield_values(vals: Varargs) -> Result<Varargs, ScriptError> {
    let Some(shared) = current_worker() else {
        return Err(ScriptError::raised("attempt to yield from outside a coroutine"));
    };
    trace!("worker yielding");
    let mut st = shared.state.lock().unwrap();
    st.phase = Phase::Suspended;
    st.mailbox = Mailbox::FromWorker(vals);
    shared.yielded.notify_one();
    loop {
        let (guard, timeout) = shared
            .resumed
            .wait_timeout(st, ORPHAN_CHECK_INTERVAL)
            .unwrap();
        st = guard;
        if st.phase == Phase::Running {
            if let Mailbox::ToWorker(_) = &st.mailbox {
                match std::mem::replace(&mut st.mailbox, Mailbox::Empty) {
                    Mailbox::ToWorker(args) => return Ok(args),
                    _ => unreachable!(),
                }
            }
        }
        if timeout.timed_out() {
            // Our own upgrade is the only remaining reference: the host
            // dropped every handle while we were suspended.
            if Arc::strong_count(&shared) == 1 {
                debug!("suspended worker orphaned; terminating");
                st.phase = Phase::Dead;
                return Err(ScriptError::Orphaned);
            }
        }
    }
}

/// Parks the worker because its instruction budget is exhausted: yields a
/// single nil so the resumer's `resume` returns immediately without this
/// worker executing a single opcode. The interpreter re-checks the budget
/// after each wakeup, so a resume before `reset` just yields nil again.
pub fn yield_for_budget() -> Result<(), ScriptError> {
    yield_values(vec![Value::Nil]).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_outcome_ok() {
        assert!(ResumeOutcome::Yielded(vec![]).ok());
        assert!(ResumeOutcome::Returned(vec![]).ok());
        assert!(!ResumeOutcome::Error("x".into()).ok());
    }

    #[test]
    fn outside_worker_yield_is_a_script_error() {
        match yield_values(vec![]) {
            Err(e) => assert!(e.catchable()),
            Ok(_) => panic!("yield outside a worker must fail"),
        }
    }
}
