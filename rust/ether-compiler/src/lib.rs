//! Ether Compiler
//!
//! The four-stage lowering pipeline: source text is lexed and parsed into an
//! AST, lowered into an IR with resolved variables, linearized into SSA with
//! reference-count placement, and finally flattened into register bytecode.

pub mod ast;
pub mod bytecode_builder;
pub mod ir;
pub mod ir_builder;
pub mod lexer;
pub mod parser;
pub mod ssa;
pub mod ssa_builder;

use ether_core::bytecode::Chunk;
use ether_core::module::Module;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Build(#[from] ir_builder::BuildError),
    #[error(transparent)]
    Ssa(#[from] ssa_builder::SsaError),
}

/// Compile a source string against a root environment, without collecting
/// public definitions. Returns the chunk for the whole script body.
pub fn compile_expr(src: &str, root: &Module) -> Result<Rc<Chunk>, CompileError> {
    let tokens = lexer::Lexer::new(src).tokenize()?;
    let ast = parser::Parser::new(tokens).parse_program()?;
    let unit = ir_builder::build_ir(&ast, root, None)?;
    let ssa = ssa_builder::build_ssa(&unit.ir, None)?;
    Ok(bytecode_builder::build_bytecode(&ssa))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_produces_a_chunk() {
        let root = Module::new("root");
        let chunk = compile_expr("1 + 2", &root).unwrap();
        assert!(!chunk.code.is_empty());
    }
}
