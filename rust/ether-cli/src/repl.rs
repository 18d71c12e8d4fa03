//! Interactive REPL.

use crate::trace::{print_exception, TraceLimit};
use ether_compiler::CompileError;
use ether_core::log::{bold, cyan, gray};
use ether_core::value::Value;
use ether_vm::{LoadError, Root};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const HELP: &str = "\
:help          show this help
:quit          leave the REPL
Anything else is evaluated as an expression.";

/// Unfinished input (an open `let`, unbalanced parens) continues on the next
/// line rather than erroring out.
fn is_incomplete(err: &LoadError) -> bool {
    matches!(
        err,
        LoadError::Compile(CompileError::Parse(
            ether_compiler::parser::ParseError::UnexpectedEof
        ))
    )
}

pub fn run(root: &mut Root, trace_limit: TraceLimit, batch: bool) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("cannot start line editor: {}", err);
            return 1;
        }
    };

    if !batch {
        println!("{}", bold(&format!("ether {}", env!("CARGO_PKG_VERSION"))));
        println!("{}", gray("type :help for help, :quit to leave"));
    }

    let mut buffer = String::new();
    let mut count = 0usize;
    loop {
        let prompt = if batch {
            String::new()
        } else if buffer.is_empty() {
            cyan("> ")
        } else {
            cyan("... ")
        };
        match editor.readline(&prompt) {
            Ok(line) => {
                if buffer.is_empty() {
                    match line.trim() {
                        "" => continue,
                        ":quit" | ":q" => return 0,
                        ":help" | ":h" => {
                            println!("{}", HELP);
                            continue;
                        }
                        _ => {}
                    }
                }
                buffer.push_str(&line);
                buffer.push('\n');

                count += 1;
                let name = format!("<repl:{}>", count);
                match root.run_source_interactive(&buffer, &name) {
                    Ok((value, module)) => {
                        let _ = editor.add_history_entry(buffer.trim_end());
                        buffer.clear();
                        // definitions persist across inputs
                        root.merge(&module);
                        if !matches!(value, Value::Nil) {
                            println!("{}", value);
                        }
                    }
                    Err(err) if is_incomplete(&err) => {
                        // keep reading
                    }
                    Err(LoadError::Uncaught { exn }) => {
                        let _ = editor.add_history_entry(buffer.trim_end());
                        buffer.clear();
                        print_exception(&exn, trace_limit);
                    }
                    Err(err) => {
                        let _ = editor.add_history_entry(buffer.trim_end());
                        buffer.clear();
                        eprintln!("{}", err);
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => return 0,
            Err(err) => {
                eprintln!("readline error: {}", err);
                return 1;
            }
        }
    }
}
