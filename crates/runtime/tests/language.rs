//! Language semantics, end to end: arithmetic coercion, tables and
//! borders, closures and upvalue lifetimes, metatables, the curated
//! standard surface.

mod common;

use common::{eval, eval_bool, eval_int, eval_str, run, sandbox};
use moat_core::Value;

// ----- numbers ---------------------------------------------------------

#[test]
fn integer_arithmetic_stays_integral() {
    let g = sandbox();
    assert!(matches!(eval(&g, "return 2 + 3"), Value::Integer(5)));
    assert!(matches!(eval(&g, "return 7 * 6"), Value::Integer(42)));
}

#[test]
fn integer_overflow_widens_to_double() {
    let g = sandbox();
    match eval(&g, "return 2147483647 + 1") {
        Value::Number(n) => assert_eq!(n, 2_147_483_648.0),
        other => panic!("expected a double, got {other:?}"),
    }
}

#[test]
fn division_is_always_a_double() {
    let g = sandbox();
    assert!(matches!(eval(&g, "return 6 / 3"), Value::Number(n) if n == 2.0));
}

#[test]
fn modulo_is_floored() {
    let g = sandbox();
    assert_eq!(eval_int(&g, "return (-5) % 3"), 1);
    assert_eq!(eval_int(&g, "return 5 % -3"), -1);
}

#[test]
fn numeric_strings_participate_as_doubles() {
    let g = sandbox();
    assert!(matches!(eval(&g, r#"return "10" + 5"#), Value::Number(n) if n == 15.0));
    let err = run(&g, r#"return {} + 1"#).unwrap_err();
    assert!(err.to_string().contains("arithmetic"), "{err}");
}

#[test]
fn integer_and_double_compare_by_value() {
    let g = sandbox();
    assert!(eval_bool(&g, "return 2 == 2.0"));
    assert!(eval_bool(&g, "return 1 < 1.5"));
}

// ----- tables ----------------------------------------------------------

#[test]
fn border_after_hole_is_a_valid_border() {
    let g = sandbox();
    let n = eval_int(
        &g,
        "local t = {} t[1] = 10 t[2] = 20 t[3] = 30 t[2] = nil return #t",
    );
    assert!(n == 1 || n == 3, "got {n}");
}

#[test]
fn deletion_is_observable_through_iteration() {
    let g = sandbox();
    let n = eval_int(
        &g,
        r#"
        local t = {a = 1, b = 2, c = 3}
        t.b = nil
        local count = 0
        for k, v in pairs(t) do
            assert(k ~= "b")
            count = count + 1
        end
        return count
        "#,
    );
    assert_eq!(n, 2);
}

#[test]
fn integral_double_keys_alias_integer_keys() {
    let g = sandbox();
    assert_eq!(eval_int(&g, "local t = {} t[2.0] = 9 return t[2]"), 9);
}

#[test]
fn table_library_round_trip() {
    let g = sandbox();
    assert_eq!(
        eval_str(
            &g,
            r#"
            local t = {"c", "a", "b"}
            table.insert(t, "d")
            table.insert(t, 1, "z")
            table.remove(t, 1)
            table.sort(t)
            return table.concat(t, "-")
            "#,
        ),
        "a-b-c-d"
    );
}

#[test]
fn table_pack_and_unpack() {
    let g = sandbox();
    let values = run(&g, "local p = table.pack(7, 8, 9) return p.n, table.unpack(p, 1, p.n)")
        .unwrap();
    assert_eq!(values.len(), 4);
    assert_eq!(values[0].display_string(), "3");
    assert_eq!(values[3].display_string(), "9");
}

// ----- closures and upvalues ------------------------------------------

#[test]
fn sibling_closures_share_one_cell() {
    let g = sandbox();
    let n = eval_int(
        &g,
        r#"
        local function make()
            local n = 0
            return function() n = n + 1 return n end, function() return n end
        end
        local inc, get = make()
        inc() inc()
        return get()
        "#,
    );
    assert_eq!(n, 2);
}

#[test]
fn loop_iterations_capture_distinct_variables() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local fns = {}
        for i = 1, 3 do fns[i] = function() return i end end
        return fns[1](), fns[2](), fns[3]()
        "#,
    )
    .unwrap();
    let rendered: Vec<String> = values.iter().map(|v| v.display_string()).collect();
    assert_eq!(rendered, vec!["1", "2", "3"]);
}

#[test]
fn upvalues_survive_the_defining_frame() {
    let g = sandbox();
    let n = eval_int(
        &g,
        r#"
        local function counter()
            local n = 10
            return function() n = n + 1 return n end
        end
        local c = counter()
        c() c()
        return c()
        "#,
    );
    assert_eq!(n, 13);
}

// ----- control flow ----------------------------------------------------

#[test]
fn goto_and_labels() {
    let g = sandbox();
    assert_eq!(
        eval_int(&g, "local i = 1 ::top:: i = i + 1 if i < 4 then goto top end return i"),
        4
    );
}

#[test]
fn repeat_until_sees_body_locals() {
    let g = sandbox();
    assert_eq!(
        eval_int(&g, "local n = 0 repeat local done = n > 2 n = n + 1 until done return n"),
        4
    );
}

#[test]
fn break_leaves_the_innermost_loop() {
    let g = sandbox();
    let n = eval_int(
        &g,
        r#"
        local hits = 0
        for i = 1, 3 do
            while true do break end
            hits = hits + 1
        end
        return hits
        "#,
    );
    assert_eq!(n, 3);
}

#[test]
fn numeric_for_descends_with_negative_step() {
    let g = sandbox();
    assert_eq!(
        eval_str(&g, r#"local s = "" for i = 3, 1, -1 do s = s .. i end return s"#),
        "321"
    );
}

#[test]
fn varargs_and_select() {
    let g = sandbox();
    let values = run(
        &g,
        "local function f(...) return select('#', ...), ... end return f(7, 8)",
    )
    .unwrap();
    let rendered: Vec<String> = values.iter().map(|v| v.display_string()).collect();
    assert_eq!(rendered, vec!["2", "7", "8"]);
}

#[test]
fn multiple_assignment_swaps() {
    let g = sandbox();
    let values = run(&g, "local a, b = 1, 2 a, b = b, a return a, b").unwrap();
    assert_eq!(values[0].display_string(), "2");
    assert_eq!(values[1].display_string(), "1");
}

#[test]
fn tail_calls_do_not_grow_the_native_stack() {
    let g = sandbox();
    // Far deeper than the native call-depth guard allows for plain
    // recursion; only proper tail calls can finish this.
    let n = eval_int(
        &g,
        r#"
        local function loop(i, acc)
            if i == 0 then return acc end
            return loop(i - 1, acc + 1)
        end
        return loop(5000, 0)
        "#,
    );
    assert_eq!(n, 5000);
}

#[test]
fn deep_plain_recursion_is_a_script_error() {
    let g = sandbox();
    let err = run(
        &g,
        "local function f(i) if i == 0 then return 0 end return 1 + f(i - 1) end return f(5000)",
    )
    .unwrap_err();
    assert!(err.to_string().contains("stack overflow"), "{err}");
}

// ----- metatables ------------------------------------------------------

#[test]
fn index_and_newindex_metamethods() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local store = {}
        local t = setmetatable({}, {
            __index = function(_, k) return "default:" .. k end,
            __newindex = function(_, k, v) store[k] = v end,
        })
        t.x = 5
        return t.y, store.x, rawget(t, "x")
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "default:y");
    assert_eq!(values[1].display_string(), "5");
    assert_eq!(values[2].display_string(), "nil");
}

#[test]
fn arithmetic_call_and_tostring_metamethods() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local v = setmetatable({n = 3}, {
            __add = function(a, b) return a.n + b end,
            __call = function(self, x) return self.n * x end,
            __tostring = function(self) return "<v" .. self.n .. ">" end,
            __len = function() return 99 end,
        })
        return v + 4, v(5), tostring(v), #v
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "7");
    assert_eq!(values[1].display_string(), "15");
    assert_eq!(values[2].display_string(), "<v3>");
    assert_eq!(values[3].display_string(), "99");
}

#[test]
fn eq_metamethod_applies_to_distinct_tables_only() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local mt = {__eq = function(a, b) return a.id == b.id end}
        local a = setmetatable({id = 1}, mt)
        local b = setmetatable({id = 1}, mt)
        local c = setmetatable({id = 2}, mt)
        return a == b, a == c, rawequal(a, b)
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "true");
    assert_eq!(values[1].display_string(), "false");
    assert_eq!(values[2].display_string(), "false");
}

#[test]
fn protected_metatables_cannot_be_replaced() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local t = setmetatable({}, {__metatable = "locked"})
        local ok, err = pcall(setmetatable, t, {})
        return getmetatable(t), ok
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "locked");
    assert_eq!(values[1].display_string(), "false");
}

// ----- strings ---------------------------------------------------------

#[test]
fn string_methods_through_the_class_metatable() {
    let g = sandbox();
    assert_eq!(eval_str(&g, r#"return ("abc"):upper()"#), "ABC");
    assert_eq!(eval_int(&g, r#"return ("hello"):len()"#), 5);
    assert_eq!(eval_str(&g, r#"return ("hello"):sub(2, 4)"#), "ell");
    assert_eq!(eval_str(&g, r#"return ("hello"):sub(-3)"#), "llo");
}

#[test]
fn string_patterns() {
    let g = sandbox();
    assert_eq!(
        eval_str(&g, r#"return ("key=value"):match("(%w+)=")"#),
        "key"
    );
    assert_eq!(
        eval_str(&g, r##"return ("a1b2c3"):gsub("%d", "#")"##),
        "a#b#c#"
    );
    let values = run(&g, r#"return ("hello world"):find("wor")"#).unwrap();
    assert_eq!(values[0].display_string(), "7");
    assert_eq!(values[1].display_string(), "9");
    assert_eq!(
        eval_int(
            &g,
            r#"
            local n = 0
            for word in ("one two three"):gmatch("%a+") do n = n + 1 end
            return n
            "#,
        ),
        3
    );
}

#[test]
fn string_format() {
    let g = sandbox();
    assert_eq!(
        eval_str(&g, r#"return string.format("%d/%s/%04d", 7, "x", 42)"#),
        "7/x/0042"
    );
    assert_eq!(
        eval_str(&g, r#"return string.format("%.2f", 1.5)"#),
        "1.50"
    );
}

#[test]
fn string_byte_char_rep_reverse() {
    let g = sandbox();
    assert_eq!(eval_int(&g, r#"return ("A"):byte()"#), 65);
    assert_eq!(eval_str(&g, "return string.char(104, 105)"), "hi");
    assert_eq!(eval_str(&g, r#"return ("ab"):rep(3)"#), "ababab");
    assert_eq!(eval_str(&g, r#"return ("abc"):reverse()"#), "cba");
}

#[test]
fn number_rendering() {
    let g = sandbox();
    assert_eq!(eval_str(&g, "return tostring(10)"), "10");
    assert_eq!(eval_str(&g, "return tostring(1.5)"), "1.5");
    assert_eq!(eval_str(&g, "return tostring(10 / 2)"), "5");
    assert_eq!(eval_str(&g, "return 1 .. 2"), "12");
}

// ----- base library ----------------------------------------------------

#[test]
fn print_goes_to_the_console_queue() {
    let g = sandbox();
    run(&g, r#"print("hello", 42)"#).unwrap();
    assert_eq!(g.try_dequeue().as_deref(), Some("hello\t42"));
    assert_eq!(g.try_dequeue(), None);
}

#[test]
fn tonumber_with_bases_and_failures() {
    let g = sandbox();
    assert_eq!(eval_int(&g, r#"return tonumber("ff", 16)"#), 255);
    assert_eq!(eval_int(&g, r#"return tonumber("101", 2)"#), 5);
    assert!(matches!(eval(&g, r#"return tonumber("nope")"#), Value::Nil));
}

#[test]
fn load_accepts_source_and_rejects_binary() {
    let g = sandbox();
    assert_eq!(eval_int(&g, r#"return load("return 1 + 1")()"#), 2);
    let values = run(&g, "local f, err = load('\\27precompiled') return f == nil, err").unwrap();
    assert_eq!(values[0].display_string(), "true");
    assert!(values[1].display_string().contains("binary"));
}

#[test]
fn xpcall_runs_the_handler_once() {
    let g = sandbox();
    let values = run(
        &g,
        r#"
        local ok, out = xpcall(
            function() error("inner") end,
            function(e) return "handled: " .. e end
        )
        return ok, out
        "#,
    )
    .unwrap();
    assert_eq!(values[0].display_string(), "false");
    assert!(values[1].display_string().starts_with("handled: "));

    // A failing handler degrades to the fixed message.
    let values = run(
        &g,
        r#"
        local ok, out = xpcall(
            function() error("inner") end,
            function() error("handler also fails") end
        )
        return ok, out
        "#,
    )
    .unwrap();
    assert_eq!(values[1].display_string(), "error in error handling");
}

#[test]
fn select_negative_indexes() {
    let g = sandbox();
    let values = run(&g, "return select(-1, 'a', 'b', 'c')").unwrap();
    assert_eq!(values[0].display_string(), "c");
}

#[test]
fn assert_passes_values_through() {
    let g = sandbox();
    let values = run(&g, "return assert(42, 'unused message')").unwrap();
    assert_eq!(values[0].display_string(), "42");
    let err = run(&g, "assert(false, 'custom failure')").unwrap_err();
    assert!(err.to_string().contains("custom failure"));
}

// ----- curated surface -------------------------------------------------

#[test]
fn dangerous_os_and_io_surfaces_are_absent() {
    let g = sandbox();
    assert!(eval_bool(&g, "return os.execute == nil"));
    assert!(eval_bool(&g, "return os.remove == nil"));
    assert!(eval_bool(&g, "return os.rename == nil"));
    assert!(eval_bool(&g, "return os.tmpname == nil"));
    assert!(eval_bool(&g, "return io == nil"));
    assert!(eval_bool(&g, "return dofile == nil"));
    assert!(eval_bool(&g, "return loadfile == nil"));
}

#[test]
fn read_only_clock_surface_is_present() {
    let g = sandbox();
    assert!(eval_int(&g, "return os.time()") > 1_500_000_000);
    assert_eq!(eval_int(&g, "return os.difftime(10, 4)"), 6);
    let values = run(&g, "local t = os.date('*t', 0) return t.year, t.month, t.day").unwrap();
    assert_eq!(values[0].display_string(), "1970");
    assert_eq!(values[1].display_string(), "1");
    assert_eq!(values[2].display_string(), "1");
    assert_eq!(
        eval_str(&g, "return os.date('%Y-%m-%d', 86400)"),
        "1970-01-02"
    );
}

#[test]
fn require_resolves_registered_module_sources() {
    let g = sandbox();
    g.register_module_source("greeting", "return { word = 'hi' }");
    assert_eq!(eval_str(&g, "return require('greeting').word"), "hi");
    // Cached: the same table comes back.
    assert!(eval_bool(
        &g,
        "return require('greeting') == require('greeting')"
    ));
    let err = run(&g, "return require('missing')").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn debug_surface_is_diagnostic_only() {
    let g = sandbox();
    let trace = eval_str(&g, "return debug.traceback('note')");
    assert!(trace.starts_with("note"));
    assert!(trace.contains("stack traceback"));
    // sethook exists but cannot weaken anything.
    run(&g, "debug.sethook(function() end, 'l')").unwrap();
}

#[test]
fn math_library_basics() {
    let g = sandbox();
    assert_eq!(eval_int(&g, "return math.floor(3.7)"), 3);
    assert_eq!(eval_int(&g, "return math.max(3, 9, 5)"), 9);
    assert!(eval_bool(&g, "return math.pi > 3.14 and math.pi < 3.15"));
    assert!(eval_bool(
        &g,
        "math.randomseed(42) local r = math.random(10) return r >= 1 and r <= 10"
    ));
}

#[test]
fn used_memory_reflects_reachable_data() {
    let g = sandbox();
    let before = g.used_memory();
    run(&g, "big = string.rep('x', 5000)").unwrap();
    let after = g.used_memory();
    assert!(after >= before + 5000, "{before} -> {after}");
}

#[test]
fn host_registered_callables_cross_the_boundary() {
    let g = sandbox();
    g.register("host_double", |args| {
        let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
        Ok(vec![Value::Number(n * 2.0)])
    });
    assert_eq!(eval_int(&g, "return host_double(21)"), 42);
}
