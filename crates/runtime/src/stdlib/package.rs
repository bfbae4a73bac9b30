//! Module system
//!
//! `require` resolves through a searcher list, and every built-in
//! searcher loads *source text* only: `package.preload` for host- or
//! script-registered loader functions, and `package.sources` for raw
//! module source registered by the host. There is no filesystem path
//! search and no precompiled chunk loading.

use moat_core::{ScriptError, Value};

use crate::globals::Globals;
use crate::stdlib::{arg, bad_arg, new_module, one};
use crate::vm;

/// Leading byte of precompiled chunks; rejected by the source searcher.
const BYTECODE_MARKER: u8 = 0x1b;

pub(crate) fn install(g: &Globals) {
    let package = new_module(g, "package");
    {
        let mut guard = package.lock().unwrap();
        for table_name in ["loaded", "preload", "sources"] {
            guard
                .set(
                    Value::from(table_name),
                    moat_core::new_table_value(moat_core::Table::new()),
                )
                .expect("string key");
        }
    }

    let weak = g.downgrade();
    let package_ref = package.clone();
    g.register("require", move |args| {
        let g = weak.upgrade()?;
        let name = match arg(&args, 1) {
            Value::Str(s) => s,
            other => return Err(bad_arg(1, "require", "string", &other)),
        };
        let field = |key: &str| package_ref.lock().unwrap().get(&Value::from(key));

        let loaded = field("loaded");
        if let Some(loaded_table) = loaded.as_table() {
            let existing = loaded_table.lock().unwrap().get(&Value::Str(name.clone()));
            if !existing.is_nil() {
                return one(existing);
            }
        }

        // Searcher 1: preload functions.
        let mut loader: Option<Value> = None;
        let mut tried = vec![format!("no field package.preload['{name}']")];
        if let Some(preload) = field("preload").as_table() {
            let f = preload.lock().unwrap().get(&Value::Str(name.clone()));
            if !f.is_nil() {
                loader = Some(f);
                tried.clear();
            }
        }

        // Searcher 2: host-registered module source text.
        if loader.is_none() {
            if let Some(sources) = field("sources").as_table() {
                let src = sources.lock().unwrap().get(&Value::Str(name.clone()));
                match &src {
                    Value::Str(text) => {
                        if text.as_bytes().first() == Some(&BYTECODE_MARKER) {
                            return Err(ScriptError::raised(format!(
                                "module '{name}' is a binary chunk; only source text is accepted"
                            )));
                        }
                        // Module sources obey the same length cap as any
                        // other loaded chunk.
                        let chunk_name = format!("={name}");
                        let chunk = g.load(text.as_bytes(), &chunk_name).map_err(|e| {
                            ScriptError::raised(format!("error loading module '{name}': {e}"))
                        })?;
                        loader = Some(chunk);
                        tried.clear();
                    }
                    _ => tried.push(format!("no entry package.sources['{name}']")),
                }
            }
        }

        let Some(loader) = loader else {
            return Err(ScriptError::raised(format!(
                "module '{name}' not found:\n\t{}",
                tried.join("\n\t")
            )));
        };

        let results = vm::call_value(&g, &loader, vec![Value::Str(name.clone())])?;
        let value = match results.into_iter().next() {
            Some(Value::Nil) | None => Value::Boolean(true),
            Some(v) => v,
        };
        if let Some(loaded_table) = field("loaded").as_table() {
            loaded_table
                .lock()
                .unwrap()
                .set(Value::Str(name), value.clone())
                .map_err(|e| ScriptError::raised(e.to_string()))?;
        }
        one(value)
    });
}

impl Globals {
    /// Registers module source text resolvable via `require(name)`.
    pub fn register_module_source(&self, name: &str, source: &str) {
        if let Some(package) = self.get("package").as_table() {
            let sources = package.lock().unwrap().get(&Value::from("sources"));
            if let Some(sources) = sources.as_table() {
                sources
                    .lock()
                    .unwrap()
                    .set(Value::from(name), Value::from(source))
                    .expect("string keys are valid");
            }
        }
    }
}
