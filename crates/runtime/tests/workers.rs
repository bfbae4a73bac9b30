//! Worker scheduling: suspend at the budget, measure, reset, resume —
//! the machinery that turns the kill-switch into a schedulable unit.

mod common;

use common::{run, sandbox};
use moat_core::Value;
use moat_runtime::{GlobalsConfig, ResumeOutcome};

#[test]
fn worker_at_its_budget_yields_instead_of_dying() {
    let g = sandbox();
    let f = g
        .load(b"local n = 0 while true do n = n + 1 end", "spin.lua")
        .unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 25, 1 << 20).unwrap();
    // The worker runs 25 instructions, then parks and hands back nil.
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Yielded(vals) => assert!(matches!(vals.as_slice(), [Value::Nil])),
        other => panic!("expected a budget yield, got {other:?}"),
    }
    assert_eq!(g.limit_of(&w).unwrap().current, 25);
    assert_eq!(w.status(), "suspended");
    // Without a reset the next resume makes no progress at all.
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Yielded(vals) => assert!(matches!(vals.as_slice(), [Value::Nil])),
        other => panic!("expected an immediate nil, got {other:?}"),
    }
    assert_eq!(g.limit_of(&w).unwrap().current, 25);
    // After a reset it runs another slice.
    assert!(g.reset_limit(&w));
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Yielded(vals) => assert!(matches!(vals.as_slice(), [Value::Nil])),
        other => panic!("expected another budget yield, got {other:?}"),
    }
    assert_eq!(g.limit_of(&w).unwrap().current, 25);
}

#[test]
fn scheduled_ticks_interleave_with_script_yields() {
    let g = sandbox();
    let f = g
        .load(
            b"local n = 0 while true do n = n + 1 coroutine.yield(n) end",
            "ticker.lua",
        )
        .unwrap();
    let w = g.spawn(&f).unwrap();
    // First epoch: a one-instruction budget parks the worker before it
    // can reach its first yield.
    g.install_limit(&w, 1, 100).unwrap();
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Yielded(vals) => assert!(matches!(vals.as_slice(), [Value::Nil])),
        other => panic!("expected a budget yield, got {other:?}"),
    }
    // Second epoch: a real budget; every tick advances by exactly one.
    assert!(g.remove_limit(&w));
    g.install_limit(&w, 500, 100).unwrap();
    let mut expected = 1i64;
    for _ in 0..5 {
        g.reset_limit(&w);
        match g.resume(&w, Vec::new()) {
            ResumeOutcome::Yielded(vals) => {
                assert_eq!(vals[0].display_string(), expected.to_string());
                expected += 1;
            }
            other => panic!("expected a script yield, got {other:?}"),
        }
    }
}

#[test]
fn resume_delivers_arguments_and_collects_results() {
    let g = sandbox();
    let f = g
        .load(
            b"local a = ... local b = coroutine.yield(a + 1) return b * 2",
            "echo.lua",
        )
        .unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 10_000, 100).unwrap();
    match g.resume(&w, vec![Value::Integer(10)]) {
        ResumeOutcome::Yielded(vals) => assert_eq!(vals[0].display_string(), "11"),
        other => panic!("expected a yield, got {other:?}"),
    }
    match g.resume(&w, vec![Value::Integer(7)]) {
        ResumeOutcome::Returned(vals) => assert_eq!(vals[0].display_string(), "14"),
        other => panic!("expected the final return, got {other:?}"),
    }
    assert_eq!(w.status(), "dead");
    // A dead worker refuses further resumes without blocking.
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Error(msg) => assert!(msg.contains("dead")),
        other => panic!("expected the dead-coroutine error, got {other:?}"),
    }
}

#[test]
fn worker_body_errors_surface_through_resume() {
    let g = sandbox();
    let f = g.load(b"error('worker exploded')", "bad.lua").unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 10_000, 100).unwrap();
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Error(msg) => assert!(msg.contains("worker exploded"), "got {msg}"),
        other => panic!("expected the body error, got {other:?}"),
    }
    assert_eq!(w.status(), "dead");
}

#[test]
fn worker_without_a_budget_fails_loudly() {
    let g = sandbox();
    let f = g.load(b"return 1", "nobudget.lua").unwrap();
    let w = g.spawn(&f).unwrap();
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Error(msg) => {
            assert!(msg.contains("instruction limit"), "got {msg}");
        }
        other => panic!("expected the missing-budget failure, got {other:?}"),
    }
}

#[test]
fn console_back_pressure_parks_a_chatty_worker() {
    let g = common::sandbox_with(GlobalsConfig {
        console_capacity: 2,
        ..GlobalsConfig::default()
    });
    let f = g
        .load(b"for i = 1, 5 do print('line ' .. i) end return 'done'", "chatty.lua")
        .unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 1_000_000, 1 << 20).unwrap();
    let mut seen = Vec::new();
    let done = loop {
        match g.resume(&w, Vec::new()) {
            ResumeOutcome::Yielded(_) => {
                // Queue full: drain it, then let the worker continue.
                while let Some(line) = g.try_dequeue() {
                    seen.push(line);
                }
            }
            ResumeOutcome::Returned(vals) => break vals,
            other => panic!("unexpected outcome {other:?}"),
        }
    };
    while let Some(line) = g.try_dequeue() {
        seen.push(line);
    }
    assert_eq!(done[0].display_string(), "done");
    assert_eq!(
        seen,
        (1..=5).map(|i| format!("line {i}")).collect::<Vec<_>>()
    );
}

#[test]
fn script_created_coroutines_draw_on_the_creator_budget() {
    let g = sandbox();
    g.install_main_limit(1_000_000, 1 << 20).unwrap();
    let values = run(
        &g,
        r#"
        local co = coroutine.create(function(a)
            local b = coroutine.yield(a + 1)
            return b * 2
        end)
        local ok1, v1 = coroutine.resume(co, 10)
        local ok2, v2 = coroutine.resume(co, 5)
        local ok3, err = coroutine.resume(co)
        return ok1, v1, ok2, v2, ok3, err
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "true");
    assert_eq!(values[1].display_string(), "11");
    assert_eq!(values[2].display_string(), "true");
    assert_eq!(values[3].display_string(), "10");
    assert_eq!(values[4].display_string(), "false");
    assert!(values[5].display_string().contains("dead"));
    // The coroutine's instructions landed on the main counter.
    assert!(g.main_limit().unwrap().current > 0);
    g.remove_main_limit();
}

#[test]
fn coroutine_wrap_and_status_from_script() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local gen = coroutine.wrap(function()
            for i = 1, 3 do coroutine.yield(i) end
        end)
        local sum = gen() + gen() + gen()
        local co = coroutine.create(function() end)
        local before = coroutine.status(co)
        coroutine.resume(co)
        local after = coroutine.status(co)
        return sum, before, after
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "6");
    assert_eq!(values[1].display_string(), "suspended");
    assert_eq!(values[2].display_string(), "dead");
}

#[test]
fn suspended_worker_counts_live_register_slots() {
    let g = sandbox();
    // `big` is a plain local: no closure captures it, so only the live
    // frame registers of the parked worker can account for it.
    let f = g
        .load(
            b"local big = string.rep('x', 4096) coroutine.yield() return #big",
            "mem.lua",
        )
        .unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 1_000_000, 1 << 20).unwrap();
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Yielded(_) => {}
        other => panic!("expected the worker to park, got {other:?}"),
    }
    let bytes = moat_runtime::reachable_bytes(&w.value());
    assert!(bytes >= 4096, "live locals went uncounted: {bytes}");
    // The frame unwinds on completion and stops being charged.
    match g.resume(&w, Vec::new()) {
        ResumeOutcome::Returned(vals) => assert_eq!(vals[0].display_string(), "4096"),
        other => panic!("expected the final return, got {other:?}"),
    }
    let after = moat_runtime::reachable_bytes(&w.value());
    assert!(after < 4096, "dead frames still counted: {after}");
}

#[test]
fn worker_value_identity_is_stable() {
    let g = sandbox();
    let f = g.load(b"coroutine.yield()", "idle.lua").unwrap();
    let w = g.spawn(&f).unwrap();
    g.install_limit(&w, 10_000, 100).unwrap();
    let a = w.value();
    let b = w.value();
    assert!(a.raw_eq(&b));
    assert_eq!(a.type_name(), "thread");
}
