//! moat-compiler: Lua 5.2 source to bytecode
//!
//! The only path into the interpreter: source text in, an immutable
//! prototype forest out. Binary chunks do not exist on this surface at
//! all — the runtime's loader seam only ever receives what this crate
//! produces from text.
//!
//! Phases: `lexer` (tokens), `parser` (syntax tree), `codegen`
//! (register allocation and bytecode emission).

pub mod ast;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;

use std::sync::Arc;

use moat_core::Prototype;

pub use error::CompileError;
pub use parser::Parser;

/// Compiles a chunk of source text. The chunk name appears in error
/// messages and tracebacks (`name:line: message`).
pub fn compile(source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, CompileError> {
    let parser = Parser::new(source, chunk_name)?;
    let block = parser.parse_chunk()?;
    codegen::generate(chunk_name, &block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moat_core::instr::OpCode;

    fn compile_ok(src: &str) -> Arc<Prototype> {
        compile(src.as_bytes(), "test").unwrap_or_else(|e| panic!("compile failed: {e}"))
    }

    #[test]
    fn empty_chunk() {
        let p = compile_ok("");
        assert!(p.is_vararg);
        assert_eq!(p.numparams, 0);
        // Just the implicit return.
        assert_eq!(p.code.len(), 1);
        assert_eq!(p.code[0].opcode(), Some(OpCode::Return));
    }

    #[test]
    fn main_chunk_has_env_upvalue() {
        let p = compile_ok("x = 1");
        assert_eq!(p.upvalues.len(), 1);
        assert_eq!(p.upvalues[0].name, "_ENV");
    }

    #[test]
    fn globals_compile_to_tabup_access() {
        let p = compile_ok("x = y");
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::GetTabUp)));
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::SetTabUp)));
    }

    #[test]
    fn locals_use_registers() {
        let p = compile_ok("local a = 1 local b = a return b");
        assert!(p.maxstacksize >= 2);
        assert!(!p.code.iter().any(|i| i.opcode() == Some(OpCode::GetTabUp)));
    }

    #[test]
    fn numeric_for_emits_prep_and_loop() {
        let p = compile_ok("for i = 1, 10 do end");
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::ForPrep)));
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::ForLoop)));
    }

    #[test]
    fn generic_for_emits_tfor_pair() {
        let p = compile_ok("for k, v in pairs(t) do end");
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::TForCall)));
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::TForLoop)));
    }

    #[test]
    fn nested_function_captures_upvalue() {
        let p = compile_ok("local x = 1 return function() return x end");
        assert_eq!(p.protos.len(), 1);
        let inner = &p.protos[0];
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].in_stack);
        assert_eq!(inner.upvalues[0].name, "x");
    }

    #[test]
    fn nested_global_access_chains_env() {
        let p = compile_ok("return function() return g end");
        let inner = &p.protos[0];
        // The inner function reaches _ENV through the chain.
        assert!(inner.upvalues.iter().any(|u| u.name == "_ENV"));
    }

    #[test]
    fn table_constructor_emits_setlist() {
        let p = compile_ok("return {1, 2, 3, x = 4}");
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::NewTable)));
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::SetList)));
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::SetTable)));
    }

    #[test]
    fn method_call_uses_self() {
        let p = compile_ok("local t = {} t:m(1)");
        assert!(p.code.iter().any(|i| i.opcode() == Some(OpCode::SelfOp)));
    }

    #[test]
    fn constants_are_deduplicated() {
        let p = compile_ok("return 'a', 'a', 'a'");
        let strings = p
            .constants
            .iter()
            .filter(|c| matches!(c, moat_core::Value::Str(_)))
            .count();
        assert_eq!(strings, 1);
    }

    #[test]
    fn line_info_matches_code() {
        let p = compile_ok("local a = 1\nlocal b = 2\nreturn a + b");
        assert_eq!(p.code.len(), p.lineinfo.len());
        assert!(p.lineinfo.contains(&1));
        assert!(p.lineinfo.contains(&3));
    }

    #[test]
    fn vararg_functions() {
        let p = compile_ok("return function(...) return ... end");
        assert!(p.protos[0].is_vararg);
        assert!(
            p.protos[0]
                .code
                .iter()
                .any(|i| i.opcode() == Some(OpCode::Vararg))
        );
    }

    #[test]
    fn goto_resolves_labels() {
        compile_ok("do goto done end ::done::");
        compile_ok("::top:: if x then goto top end");
    }

    #[test]
    fn syntax_errors_carry_positions() {
        let err = compile(b"local = 5", "chunk").unwrap_err();
        assert_eq!(err.chunk, "chunk");
        assert_eq!(err.line, 1);
        let err = compile(b"\n\nreturn )", "chunk").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn unresolved_goto_is_an_error() {
        assert!(compile(b"goto nowhere", "chunk").is_err());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert!(compile(b"break", "chunk").is_err());
    }

    #[test]
    fn vararg_outside_vararg_function_is_an_error() {
        assert!(compile(b"return function() return ... end", "chunk").is_err());
    }
}
