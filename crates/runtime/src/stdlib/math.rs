//! Math library
//!
//! Thin wrappers over the host float operations. Results that are exact
//! integers in range come back on the integer tag (`floor`, `ceil`,
//! `abs` of an integer); everything else is a double.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use moat_core::{ScriptError, Value};

use crate::globals::Globals;
use crate::meta;
use crate::stdlib::{arg, bad_arg, check_number, new_module, one, set_fn};

fn float_result(n: f64) -> Value {
    Value::Number(n)
}

/// Integral doubles in 32-bit range come back as integers.
fn integral_result(n: f64) -> Value {
    if n.fract() == 0.0 && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
        Value::Integer(n as i32)
    } else {
        Value::Number(n)
    }
}

fn unary(
    module: &moat_core::TableRef,
    name: &'static str,
    f: impl Fn(f64) -> Value + Send + Sync + 'static,
) {
    set_fn(module, name, move |args| {
        one(f(check_number(&args, 1, name)?))
    });
}

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "math");
    {
        let mut guard = module.lock().unwrap();
        guard
            .set(Value::from("pi"), Value::Number(std::f64::consts::PI))
            .expect("string key");
        guard
            .set(Value::from("huge"), Value::Number(f64::INFINITY))
            .expect("string key");
    }

    unary(&module, "abs", |n| integral_result(n.abs()));
    unary(&module, "ceil", |n| integral_result(n.ceil()));
    unary(&module, "floor", |n| integral_result(n.floor()));
    unary(&module, "sqrt", |n| float_result(n.sqrt()));
    unary(&module, "sin", |n| float_result(n.sin()));
    unary(&module, "cos", |n| float_result(n.cos()));
    unary(&module, "tan", |n| float_result(n.tan()));
    unary(&module, "asin", |n| float_result(n.asin()));
    unary(&module, "acos", |n| float_result(n.acos()));
    unary(&module, "exp", |n| float_result(n.exp()));
    unary(&module, "rad", |n| float_result(n.to_radians()));
    unary(&module, "deg", |n| float_result(n.to_degrees()));

    set_fn(&module, "atan", |args| {
        let y = check_number(&args, 1, "atan")?;
        if arg(&args, 2).is_nil() {
            one(float_result(y.atan()))
        } else {
            let x = check_number(&args, 2, "atan")?;
            one(float_result(y.atan2(x)))
        }
    });

    set_fn(&module, "log", |args| {
        let x = check_number(&args, 1, "log")?;
        if arg(&args, 2).is_nil() {
            one(float_result(x.ln()))
        } else {
            let base = check_number(&args, 2, "log")?;
            one(float_result(x.ln() / base.ln()))
        }
    });

    set_fn(&module, "fmod", |args| {
        let a = check_number(&args, 1, "fmod")?;
        let b = check_number(&args, 2, "fmod")?;
        one(float_result(a % b))
    });

    set_fn(&module, "modf", |args| {
        let n = check_number(&args, 1, "modf")?;
        let int = n.trunc();
        Ok(vec![integral_result(int), float_result(n - int)])
    });

    set_fn(&module, "pow", |args| {
        let a = check_number(&args, 1, "pow")?;
        let b = check_number(&args, 2, "pow")?;
        one(float_result(a.powf(b)))
    });

    set_fn(&module, "max", |args| {
        if args.is_empty() {
            return Err(bad_arg(1, "max", "number", &Value::Nil));
        }
        let mut best = check_number(&args, 1, "max")?;
        for i in 2..=args.len() {
            best = best.max(check_number(&args, i, "max")?);
        }
        one(integral_result(best))
    });

    set_fn(&module, "min", |args| {
        if args.is_empty() {
            return Err(bad_arg(1, "min", "number", &Value::Nil));
        }
        let mut best = check_number(&args, 1, "min")?;
        for i in 2..=args.len() {
            best = best.min(check_number(&args, i, "min")?);
        }
        one(integral_result(best))
    });

    // One generator per sandbox, lazily seeded from the OS.
    let rng: std::sync::Arc<Mutex<Option<StdRng>>> = std::sync::Arc::new(Mutex::new(None));

    {
        let rng = rng.clone();
        set_fn(&module, "random", move |args| {
            let mut guard = rng.lock().unwrap();
            let generator = guard.get_or_insert_with(StdRng::from_entropy);
            match args.len() {
                0 => one(Value::Number(generator.gen_range(0.0..1.0))),
                1 => {
                    let m = check_number(&args, 1, "random")?.floor() as i64;
                    if m < 1 {
                        return Err(ScriptError::raised(
                            "bad argument #1 to 'random' (interval is empty)",
                        ));
                    }
                    one(meta::int_or_number(generator.gen_range(1..=m)))
                }
                _ => {
                    let m = check_number(&args, 1, "random")?.floor() as i64;
                    let n = check_number(&args, 2, "random")?.floor() as i64;
                    if m > n {
                        return Err(ScriptError::raised(
                            "bad argument #2 to 'random' (interval is empty)",
                        ));
                    }
                    one(meta::int_or_number(generator.gen_range(m..=n)))
                }
            }
        });
    }

    {
        let rng = rng.clone();
        set_fn(&module, "randomseed", move |args| {
            let seed = check_number(&args, 1, "randomseed")?;
            *rng.lock().unwrap() = Some(StdRng::seed_from_u64(seed.to_bits()));
            Ok(Vec::new())
        });
    }
}
