//! Budget enforcement, end to end: real source through the compiler,
//! executed under installed instruction and string-size bounds.

mod common;

use common::{run, sandbox, sandbox_with};
use moat_runtime::{GlobalsConfig, RuntimeError};

#[test]
fn runaway_loop_hits_the_instruction_budget_exactly() {
    let g = sandbox();
    g.install_main_limit(50, 1 << 20).unwrap();
    let err = run(&g, "x = 0 for i = 1, 1e9 do x = x + 1 end return x").unwrap_err();
    match err {
        RuntimeError::LimitExceeded { max } => assert_eq!(max, 50),
        other => panic!("expected the budget error, got {other:?}"),
    }
    // The counter sits at exactly the budget: the failing charge does
    // not move it.
    assert_eq!(g.main_limit().unwrap().current, 50);
    g.remove_main_limit();
}

#[test]
fn counter_equals_opcodes_dispatched_on_success() {
    let g = sandbox();
    g.install_main_limit(1_000_000, 1 << 20).unwrap();
    run(&g, "return 1").unwrap();
    let first = g.main_limit().unwrap().current;
    assert!(first > 0);
    g.reset_main_limit();
    run(&g, "return 1").unwrap();
    // Same chunk, same dispatch count.
    assert_eq!(g.main_limit().unwrap().current, first);
    g.remove_main_limit();
}

#[test]
fn concat_doubling_trips_the_string_cap_early() {
    let g = sandbox();
    g.install_main_limit(10_000, 100).unwrap();
    let err = run(
        &g,
        r#"local s = "" for i = 1, 100 do s = s .. s .. "a" end return #s"#,
    )
    .unwrap_err();
    match err {
        RuntimeError::StringLimitExceeded { max } => assert_eq!(max, 100),
        other => panic!("expected the string cap error, got {other:?}"),
    }
    // Few instructions were needed to reach the cap.
    assert!(g.main_limit().unwrap().current < 10_000);
    g.remove_main_limit();
}

#[test]
fn concat_at_exactly_the_cap_succeeds() {
    let g = sandbox();
    g.install_main_limit(10_000, 8).unwrap();
    let values = run(&g, r#"return "aaaa" .. "bbbb""#).unwrap();
    assert_eq!(values[0].display_string(), "aaaabbbb");
    g.remove_main_limit();

    let g = sandbox();
    g.install_main_limit(10_000, 7).unwrap();
    let err = run(&g, r#"return "aaaa" .. "bbbb""#).unwrap_err();
    assert!(matches!(err, RuntimeError::StringLimitExceeded { max: 7 }));
    g.remove_main_limit();
}

#[test]
fn pcall_cannot_shield_the_budget() {
    let g = sandbox();
    g.install_main_limit(100, 1 << 20).unwrap();
    let err = run(&g, "return pcall(function() while true do end end)").unwrap_err();
    assert!(
        matches!(err, RuntimeError::LimitExceeded { max: 100 }),
        "pcall must not convert the budget error: {err:?}"
    );
    g.remove_main_limit();
}

#[test]
fn xpcall_cannot_shield_the_budget_either() {
    let g = sandbox();
    g.install_main_limit(100, 1 << 20).unwrap();
    let err = run(
        &g,
        "return xpcall(function() while true do end end, function(e) return e end)",
    )
    .unwrap_err();
    assert!(matches!(err, RuntimeError::LimitExceeded { .. }));
    g.remove_main_limit();
}

#[test]
fn pcall_still_catches_script_errors() {
    let g = sandbox();
    let values = run(&g, r#"local ok, e = pcall(function() error("boom") end) return ok, e"#)
        .unwrap();
    assert_eq!(values[0].display_string(), "false");
    let message = values[1].display_string();
    assert!(message.ends_with("boom"), "got {message}");
    assert!(message.contains(":"), "position prefix missing: {message}");
}

#[test]
fn source_length_cap_is_exact() {
    let config = GlobalsConfig {
        max_source_len: 20,
        ..GlobalsConfig::default()
    };
    let g = sandbox_with(config);
    // Exactly at the cap loads.
    let src = "return 1 --padding--"; // 20 bytes
    assert_eq!(src.len(), 20);
    assert!(g.load(src.as_bytes(), "ok").is_ok());
    // One byte over is rejected before the compiler sees it.
    let long = "return 1 --padding---";
    assert_eq!(long.len(), 21);
    match g.load(long.as_bytes(), "too-long").unwrap_err() {
        RuntimeError::ScriptTooLong { len, max } => {
            assert_eq!(len, 21);
            assert_eq!(max, 20);
        }
        other => panic!("expected the length cap error, got {other:?}"),
    }
}

#[test]
fn table_contains_charges_a_flat_ten() {
    let g = sandbox();
    g.install_main_limit(30, 1 << 20).unwrap();
    let values = run(&g, "return table.contains({1, 2, 3, 4, 5}, 4)").unwrap();
    assert_eq!(values[0].display_string(), "true");
    let spent = g.main_limit().unwrap().current;
    assert!(spent > 10, "flat charge missing: {spent}");
    assert!(spent <= 30, "cost scaled with the table: {spent}");
    g.remove_main_limit();
}

#[test]
fn string_rep_respects_the_cap() {
    let g = sandbox();
    g.install_main_limit(10_000, 10).unwrap();
    assert!(run(&g, r#"return ("ab"):rep(5)"#).is_ok());
    let err = run(&g, r#"return ("ab"):rep(6)"#).unwrap_err();
    assert!(matches!(err, RuntimeError::StringLimitExceeded { .. }));
    g.remove_main_limit();
}

#[test]
fn unlimited_main_caller_runs_without_a_budget() {
    let g = sandbox();
    let values = run(&g, "local n = 0 for i = 1, 10000 do n = n + i end return n").unwrap();
    assert_eq!(values[0].display_string(), "50005000");
}
