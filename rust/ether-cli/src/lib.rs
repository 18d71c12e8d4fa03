//! Ether CLI: shared pieces of the `ether` binary.

pub mod repl;
pub mod trace;
