//! Restricted os library
//!
//! Read-only clock and calendar access: `time`, `date`, `difftime`,
//! `clock`. Everything that touches the filesystem or spawns processes
//! (`execute`, `remove`, `rename`, `tmpname`) is deliberately absent,
//! as is the whole `io` library. Calendar math is done in-process
//! against UTC; no locale or environment is consulted.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use moat_core::{ScriptError, Table, Value};

use crate::globals::Globals;
use crate::meta;
use crate::stdlib::{arg, check_table, new_module, one, set_fn};

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Civil date from days since the epoch (Gregorian, proleptic).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    ((if m <= 2 { y + 1 } else { y }), m, d)
}

fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = i64::from(if m > 2 { m - 3 } else { m + 9 });
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

struct Broken {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
    yday: u32,
    wday: u32,
}

fn break_down(epoch: i64) -> Broken {
    let days = epoch.div_euclid(86_400);
    let secs = epoch.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let jan1 = days_from_civil(year, 1, 1);
    Broken {
        year,
        month,
        day,
        hour: (secs / 3600) as u32,
        min: (secs % 3600 / 60) as u32,
        sec: (secs % 60) as u32,
        yday: (days - jan1 + 1) as u32,
        // 1 = Sunday, matching the script-facing convention.
        wday: ((days + 4).rem_euclid(7) + 1) as u32,
    }
}

fn format_date(fmt: &str, b: &Broken, epoch: i64) -> String {
    const WEEKDAYS: [&str; 7] = ["Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday"];
    const MONTHS: [&str; 12] = [
        "January", "February", "March", "April", "May", "June", "July", "August", "September",
        "October", "November", "December",
    ];
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&b.year.to_string()),
            Some('y') => out.push_str(&format!("{:02}", b.year.rem_euclid(100))),
            Some('m') => out.push_str(&format!("{:02}", b.month)),
            Some('d') => out.push_str(&format!("{:02}", b.day)),
            Some('H') => out.push_str(&format!("{:02}", b.hour)),
            Some('M') => out.push_str(&format!("{:02}", b.min)),
            Some('S') => out.push_str(&format!("{:02}", b.sec)),
            Some('j') => out.push_str(&format!("{:03}", b.yday)),
            Some('w') => out.push_str(&(b.wday - 1).to_string()),
            Some('A') => out.push_str(WEEKDAYS[(b.wday - 1) as usize]),
            Some('a') => out.push_str(&WEEKDAYS[(b.wday - 1) as usize][..3]),
            Some('B') => out.push_str(MONTHS[(b.month - 1) as usize]),
            Some('b') => out.push_str(&MONTHS[(b.month - 1) as usize][..3]),
            Some('x') => out.push_str(&format!("{:02}/{:02}/{:02}", b.month, b.day, b.year.rem_euclid(100))),
            Some('X') => out.push_str(&format!("{:02}:{:02}:{:02}", b.hour, b.min, b.sec)),
            Some('c') => out.push_str(&format!(
                "{} {} {:2} {:02}:{:02}:{:02} {}",
                &WEEKDAYS[(b.wday - 1) as usize][..3],
                &MONTHS[(b.month - 1) as usize][..3],
                b.day,
                b.hour,
                b.min,
                b.sec,
                b.year
            )),
            Some('s') => out.push_str(&epoch.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

pub(crate) fn install(g: &Globals) {
    let module = new_module(g, "os");

    set_fn(&module, "time", |args| {
        match arg(&args, 1) {
            Value::Nil => one(meta::int_or_number(now_epoch())),
            Value::Table(_) => {
                let t = check_table(&args, 1, "time")?;
                let guard = t.lock().unwrap();
                let field = |name: &str, default: Option<i64>| -> Result<i64, ScriptError> {
                    let v = guard.get(&Value::from(name));
                    match v.as_integer() {
                        Some(n) => Ok(n),
                        None => default.ok_or_else(|| {
                            ScriptError::raised(format!("field '{name}' missing in date table"))
                        }),
                    }
                };
                let year = field("year", None)?;
                let month = field("month", None)?;
                let day = field("day", None)?;
                let hour = field("hour", Some(12))?;
                let min = field("min", Some(0))?;
                let sec = field("sec", Some(0))?;
                let days = days_from_civil(year, month.clamp(1, 12) as u32, day.clamp(1, 31) as u32);
                one(meta::int_or_number(days * 86_400 + hour * 3600 + min * 60 + sec))
            }
            other => Err(crate::stdlib::bad_arg(1, "time", "table", &other)),
        }
    });

    set_fn(&module, "date", |args| {
        let fmt = match arg(&args, 1) {
            Value::Nil => "%c".to_string(),
            Value::Str(s) => s.display().into_owned(),
            other => return Err(crate::stdlib::bad_arg(1, "date", "string", &other)),
        };
        let epoch = match arg(&args, 2) {
            Value::Nil => now_epoch(),
            v => v
                .as_integer()
                .ok_or_else(|| crate::stdlib::bad_arg(2, "date", "number", &v))?,
        };
        // '!' (explicit UTC) is accepted; all output is UTC regardless.
        let fmt = fmt.strip_prefix('!').unwrap_or(&fmt).to_string();
        let b = break_down(epoch);
        if fmt == "*t" {
            let table = moat_core::new_table_value(Table::new());
            {
                let t = table.as_table().expect("just built");
                let mut guard = t.lock().unwrap();
                let mut put = |k: &str, v: i64| {
                    guard
                        .set(Value::from(k), meta::int_or_number(v))
                        .expect("string key");
                };
                put("year", b.year);
                put("month", i64::from(b.month));
                put("day", i64::from(b.day));
                put("hour", i64::from(b.hour));
                put("min", i64::from(b.min));
                put("sec", i64::from(b.sec));
                put("yday", i64::from(b.yday));
                put("wday", i64::from(b.wday));
                guard
                    .set(Value::from("isdst"), Value::Boolean(false))
                    .expect("string key");
            }
            return one(table);
        }
        one(Value::from(format_date(&fmt, &b, epoch)))
    });

    set_fn(&module, "difftime", |args| {
        let t2 = crate::stdlib::check_number(&args, 1, "difftime")?;
        let t1 = if arg(&args, 2).is_nil() {
            0.0
        } else {
            crate::stdlib::check_number(&args, 2, "difftime")?
        };
        one(Value::Number(t2 - t1))
    });

    set_fn(&module, "clock", |_args| {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        one(Value::Number(start.elapsed().as_secs_f64()))
    });
}
