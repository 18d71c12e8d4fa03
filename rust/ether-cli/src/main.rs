//! The `ether` executable: run a script, or drop into the REPL.

use clap::{Parser as ClapParser, ValueEnum};
use ether_cli::repl;
use ether_cli::trace::{print_exception, TraceLimit};
use ether_core::attr::Attr;
use ether_core::log::{set_log_level, LogLevel};
use ether_core::value::Value;
use ether_vm::{LoadError, Root};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Debug,
    Warning,
    Error,
}

#[derive(ClapParser)]
#[command(
    name = "ether",
    version,
    about = "The ether programming language",
    long_about = "An ML-flavored functional language running on a register-bytecode VM.\n\n\
                  With no script, an interactive REPL is started."
)]
struct Cli {
    /// Prepend DIR to the module search path (repeatable)
    #[arg(short = 'L', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Installation prefix; <PREFIX>/lib/ether joins the module path
    #[arg(long, value_name = "PREFIX")]
    prefix: Option<PathBuf>,

    /// Colon-separated directories prepended to the module path
    #[arg(long, value_name = "PATH")]
    module_path: Option<String>,

    /// Diagnostics verbosity
    #[arg(long, value_enum, default_value = "warning")]
    log_level: LogLevelArg,

    /// Trace print limit: HEAD or HEAD,TAIL raise sites
    #[arg(long, value_name = "HEAD[,TAIL]")]
    trace_limit: Option<TraceLimit>,

    /// Plain prompts and no banner (for piping into the REPL)
    #[arg(short = 'b', long)]
    batch_mode: bool,

    /// Print the compiled bytecode of the script instead of running it
    #[arg(long)]
    dump_bytecode: bool,

    /// Script to run; omit for the REPL
    script: Option<PathBuf>,

    /// Arguments passed to the script as `command_line`
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    set_log_level(match cli.log_level {
        LogLevelArg::Debug => LogLevel::Debug,
        LogLevelArg::Warning => LogLevel::Warning,
        LogLevelArg::Error => LogLevel::Error,
    });
    let trace_limit = cli.trace_limit.unwrap_or_default();

    let mut root = match Root::new() {
        Ok(root) => root,
        Err(err) => {
            eprintln!("failed to set up the root environment: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = cli.module_path.as_deref() {
        for dir in path.split(':').rev() {
            if !dir.is_empty() {
                root.add_module_path(PathBuf::from(dir));
            }
        }
    }
    if let Some(prefix) = &cli.prefix {
        root.add_module_path(prefix.join("lib").join("ether"));
    }
    for dir in cli.include.iter().rev() {
        root.add_module_path(dir.clone());
    }

    let Some(script) = &cli.script else {
        let status = repl::run(&mut root, trace_limit, cli.batch_mode);
        return ExitCode::from(status as u8);
    };

    let command_line = Value::list(cli.args.iter().map(|a| Value::str(a.as_str())).collect::<Vec<_>>());
    root.define("command_line", command_line, Attr::builtin());

    if let Some(dir) = script.parent() {
        if !dir.as_os_str().is_empty() {
            root.add_module_path(dir.to_path_buf());
        }
    }

    if cli.dump_bytecode {
        return dump_bytecode(&mut root, script);
    }

    match root.run_script(script) {
        Ok(status) => ExitCode::from(status.clamp(0, 255) as u8),
        Err(LoadError::Uncaught { exn }) => {
            print_exception(&exn, trace_limit);
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn dump_bytecode(root: &mut Root, script: &PathBuf) -> ExitCode {
    use ether_compiler::ir_builder::build_ir;
    use ether_compiler::lexer::Lexer;
    use ether_compiler::parser::Parser;
    use ether_compiler::ssa_builder::build_ssa;

    let src = match std::fs::read_to_string(script) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("cannot read '{}': {}", script.display(), err);
            return ExitCode::FAILURE;
        }
    };
    let name: std::rc::Rc<str> = std::rc::Rc::from(script.to_string_lossy().as_ref());
    let result = (|| -> Result<_, ether_compiler::CompileError> {
        let tokens = Lexer::new(&src).tokenize()?;
        let ast = Parser::new(tokens).with_file(Some(name)).parse_program()?;
        let env = root.env();
        let prog = build_ir(&ast, &env, None)?;
        let ssa = build_ssa(&prog.ir, Some(&prog.defs))?;
        Ok(ether_compiler::bytecode_builder::build_bytecode(&ssa))
    })();
    match result {
        Ok(chunk) => {
            println!("{}", serde_json::to_string_pretty(&chunk.dump_json()).expect("valid json"));
            eprintln!("{}", chunk.disassemble());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
