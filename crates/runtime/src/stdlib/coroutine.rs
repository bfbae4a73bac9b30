//! Coroutine library
//!
//! The script-side view of the worker scheduler. A coroutine created
//! here inherits its creator's budget identity, so everything a script
//! spawns keeps drawing down the same instruction budget — coroutines
//! are not a way to mint fresh budget.

use std::sync::Arc;

use moat_core::{Function, NativeFunction, ScriptError, Value};

use crate::globals::Globals;
use crate::limiter;
use crate::sched::{self, Phase, ResumeOutcome, WorkerShared};
use crate::stdlib::{arg, bad_arg, check_function, new_module, one, set_fn};

fn as_worker(v: &Value, index: usize, fname: &str) -> Result<Arc<WorkerShared>, ScriptError> {
    let Value::Thread(t) = v else {
        return Err(bad_arg(index, fname, "coroutine", v));
    };
    // The scheduler owns every thread value in this sandbox; anything
    // else behind the thread tag is a bug, not a script condition.
    t.as_any()
        .downcast_ref::<WorkerShared>()
        .and_then(WorkerShared::typed_arc)
        .ok_or_else(|| bad_arg(index, fname, "coroutine", v))
}

fn resume_results(outcome: ResumeOutcome) -> Vec<Value> {
    match outcome {
        ResumeOutcome::Yielded(mut vals) | ResumeOutcome::Returned(mut vals) => {
            let mut out = vec![Value::Boolean(true)];
            out.append(&mut vals);
            out
        }
        ResumeOutcome::Error(msg) => vec![Value::Boolean(false), Value::from(msg)],
    }
}

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "coroutine");

    {
        let weak = g.downgrade();
        set_fn(&module, "create", move |args| {
            let g = weak.upgrade()?;
            let f = check_function(&args, 1, "create")?;
            let Value::Function(func) = f else { unreachable!() };
            // Inherit the creator's budget identity; a fresh key would be
            // an uninstalled (and therefore unlimited) budget.
            let key = limiter::active_key().unwrap_or_else(limiter::allocate_key);
            let shared = sched::create(&g, func, key, false);
            one(Value::Thread(shared))
        });
    }

    set_fn(&module, "resume", |mut args| {
        if args.is_empty() {
            return Err(bad_arg(1, "resume", "coroutine", &Value::Nil));
        }
        let co = args.remove(0);
        let worker = as_worker(&co, 1, "resume")?;
        Ok(resume_results(sched::resume(&worker, args)))
    });

    set_fn(&module, "yield", |args| sched::yield_values(args));

    set_fn(&module, "status", |args| {
        let worker = as_worker(&arg(&args, 1), 1, "status")?;
        let current = sched::current_worker();
        let status = match worker.phase() {
            Phase::Dead => "dead",
            Phase::Initial | Phase::Suspended => "suspended",
            Phase::Running => {
                if current.is_some_and(|c| Arc::ptr_eq(&c, &worker)) {
                    "running"
                } else {
                    // Alive but resumed somebody else (or its resumer).
                    "normal"
                }
            }
        };
        one(Value::from(status))
    });

    set_fn(&module, "running", |_args| match sched::current_worker() {
        Some(worker) => Ok(vec![Value::Thread(worker), Value::Boolean(false)]),
        None => Ok(vec![Value::Nil, Value::Boolean(true)]),
    });

    {
        let weak = g.downgrade();
        set_fn(&module, "wrap", move |args| {
            let g = weak.upgrade()?;
            let f = check_function(&args, 1, "wrap")?;
            let Value::Function(func) = f else { unreachable!() };
            let key = limiter::active_key().unwrap_or_else(limiter::allocate_key);
            let shared = sched::create(&g, func, key, false);
            let wrapped = NativeFunction::new("coroutine.wrap", move |args| {
                match sched::resume(&shared, args) {
                    ResumeOutcome::Yielded(vals) | ResumeOutcome::Returned(vals) => Ok(vals),
                    ResumeOutcome::Error(msg) => Err(ScriptError::raised(msg)),
                }
            });
            one(Value::Function(Function::Native(wrapped)))
        });
    }
}
