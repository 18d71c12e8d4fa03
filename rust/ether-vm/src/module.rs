//! Module loading: compile a source unit against the root environment, run
//! it, and expose its public bindings. Module search resolves `name` to
//! `name.eth` or `name/__main__.eth` across the module path.

use crate::builtins;
use crate::vm::Vm;
use ether_compiler::ast::AstRef;
use ether_compiler::ir_builder::{build_ir, MacroEvaluator, ModuleDef};
use ether_compiler::lexer::Lexer;
use ether_compiler::parser::Parser;
use ether_compiler::ssa_builder::build_ssa;
use ether_compiler::{bytecode_builder, CompileError};
use ether_core::attr::Attr;
use ether_core::module::Module;
use ether_core::value::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

const PRELUDE: &str = include_str!("prelude.eth");

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("module '{name}' not found in the module path")]
    NotFound { name: String },
    #[error("uncaught exception: {exn}")]
    Uncaught { exn: Value },
    #[error("module body returned a malformed value")]
    MalformedModule,
}

/// The top-level environment: builtins plus the prelude, a module search
/// path, and a cache of loaded modules.
pub struct Root {
    env: Rc<Module>,
    search: Vec<PathBuf>,
    modules: HashMap<String, Rc<Module>>,
    vm: Vm,
    scratch: usize,
}

impl Root {
    pub fn new() -> Result<Root, LoadError> {
        let mut env = Module::new("root");
        builtins::install(&mut env);
        let mut root = Root {
            env: Rc::new(env),
            search: vec![PathBuf::from(".")],
            modules: HashMap::new(),
            vm: Vm::new(),
            scratch: 0,
        };
        let (_, prelude) = root.run_source(PRELUDE, "prelude")?;
        root.merge(&prelude);
        Ok(root)
    }

    pub fn env(&self) -> Rc<Module> {
        self.env.clone()
    }

    /// Prepend a directory to the module search path.
    pub fn add_module_path(&mut self, dir: PathBuf) {
        self.search.insert(0, dir);
    }

    /// Install an extra root binding (builtins of embedders and tests).
    pub fn define(&mut self, name: &str, val: Value, attr: Attr) {
        Rc::make_mut(&mut self.env).define(name, val, attr);
    }

    /// Fold a module's definitions into the root environment (prelude setup
    /// and REPL persistence).
    pub fn merge(&mut self, module: &Module) {
        let env = Rc::make_mut(&mut self.env);
        for def in module.defs() {
            env.define(&def.ident, def.val.clone(), def.attr.clone());
        }
    }

    /// Like `run_source`, with every top-level binding forced public so an
    /// interactive session can keep it.
    pub fn run_source_interactive(
        &mut self,
        src: &str,
        name: &str,
    ) -> Result<(Value, Module), LoadError> {
        let file: Rc<str> = Rc::from(name);
        let tokens = Lexer::new(src).tokenize().map_err(CompileError::from)?;
        let ast = Parser::new(tokens)
            .with_file(Some(file))
            .with_toplevel_pub(true)
            .parse_program()
            .map_err(CompileError::from)?;
        self.run_ast(&ast, name)
    }

    /// Compile and run a parsed unit; returns the body's value and a module
    /// holding the unit's public bindings.
    pub fn run_ast(&mut self, ast: &AstRef, name: &str) -> Result<(Value, Module), LoadError> {
        let env = self.env.clone();
        let prog = build_ir(ast, &env, Some(self)).map_err(CompileError::from)?;
        let ssa = build_ssa(&prog.ir, Some(&prog.defs)).map_err(CompileError::from)?;
        let chunk = bytecode_builder::build_bytecode(&ssa);

        let packed = self.vm.run_chunk(chunk);
        if packed.is_exn() {
            return Err(LoadError::Uncaught { exn: packed });
        }
        // the compiled unit returns (result, def...)
        let Value::Record(tup) = &packed else {
            return Err(LoadError::MalformedModule);
        };
        if !tup.ty.is_tuple() || tup.vals.len() != prog.defs.len() + 1 {
            return Err(LoadError::MalformedModule);
        }
        let mut module = Module::new(name);
        for (def, val) in prog.defs.iter().zip(tup.vals[1..].iter()) {
            module.define(&def.ident, val.clone(), def.attr.clone());
        }
        Ok((tup.vals[0].clone(), module))
    }

    pub fn run_source(&mut self, src: &str, name: &str) -> Result<(Value, Module), LoadError> {
        let file: Rc<str> = Rc::from(name);
        let tokens = Lexer::new(src).tokenize().map_err(CompileError::from)?;
        let ast = Parser::new(tokens)
            .with_file(Some(file))
            .parse_program()
            .map_err(CompileError::from)?;
        self.run_ast(&ast, name)
    }

    /// Resolve a module name against the search path.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.search {
            let flat = dir.join(format!("{}.eth", name));
            if flat.is_file() {
                return Some(flat);
            }
            let main = dir.join(name).join("__main__.eth");
            if main.is_file() {
                return Some(main);
            }
        }
        None
    }

    /// Load a module by name, caching the result. The module's public
    /// bindings become importable constants.
    pub fn load_module(&mut self, name: &str) -> Result<Rc<Module>, LoadError> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }
        let path = self
            .resolve(name)
            .ok_or_else(|| LoadError::NotFound { name: name.to_string() })?;
        let module = self.load_path(&path, name)?;
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }

    pub fn load_path(&mut self, path: &Path, name: &str) -> Result<Rc<Module>, LoadError> {
        let src = std::fs::read_to_string(path)
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
        let (_, module) = self.run_source(&src, name)?;
        Ok(Rc::new(module))
    }

    /// Run a script file; returns its exit status. An uncaught exception
    /// carrying an exit object passes its status through; any other uncaught
    /// exception reports failure.
    pub fn run_script(&mut self, path: &Path) -> Result<i32, LoadError> {
        let src = std::fs::read_to_string(path)
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
        let name = path.to_string_lossy().into_owned();
        match self.run_source(&src, &name) {
            Ok(_) => Ok(0),
            Err(LoadError::Uncaught { exn }) => {
                if let Value::Exn(e) = &exn {
                    if let Value::Exit(x) = &e.what {
                        return Ok(x.status);
                    }
                }
                Err(LoadError::Uncaught { exn })
            }
            Err(err) => Err(err),
        }
    }
}

impl MacroEvaluator for Root {
    /// `$( ... )` loads the inner expression as a scratch module and yields
    /// its value to the enclosing build.
    fn eval(&mut self, ast: &AstRef) -> Result<Value, String> {
        self.scratch += 1;
        let name = format!("<mac{}>", self.scratch);
        match self.run_ast(ast, &name) {
            Ok((value, _)) => Ok(value),
            Err(err) => Err(err.to_string()),
        }
    }

    /// `import name` binds the module's public values as constants in the
    /// importing unit.
    fn load(&mut self, module: &str) -> Result<Vec<ModuleDef>, String> {
        match self.load_module(module) {
            Ok(module) => Ok(module
                .defs()
                .iter()
                .map(|def| (def.ident.clone(), def.val.clone(), def.attr.clone()))
                .collect()),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        let mut root = Root::new().unwrap();
        root.run_source(src, "<test>").unwrap().0
    }

    #[test]
    fn test_simple_expression() {
        assert!(eval("1 + 2 * 3").equal(&Value::num(7)));
    }

    #[test]
    fn test_prelude_is_available() {
        let v = eval("length [1, 2, 3]");
        assert!(v.equal(&Value::num(3)), "got {}", v);
    }

    #[test]
    fn test_public_defs_are_collected() {
        let mut root = Root::new().unwrap();
        let (_, module) = root.run_source("let pub x = 40\nlet pub f y = y + x\nnil", "<m>").unwrap();
        assert!(module.get("x").unwrap().val.equal(&Value::num(40)));
        let f = module.get("f").unwrap().val.clone();
        assert!(matches!(f, Value::Func(_)));
    }

    #[test]
    fn test_module_search_and_import(){
        let dir = std::env::temp_dir().join(format!("ether-mod-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("answers.eth"), "let pub answer = 42\nnil").unwrap();

        let mut root = Root::new().unwrap();
        root.add_module_path(dir.clone());
        let module = root.load_module("answers").unwrap();
        assert!(module.get("answer").unwrap().val.equal(&Value::num(42)));
        // cached on the second load
        let again = root.load_module("answers").unwrap();
        assert!(Rc::ptr_eq(&module, &again));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_binds_public_values() {
        let dir = std::env::temp_dir().join(format!("ether-import-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("geometry.eth"), "let pub origin = (0, 0)\nnil").unwrap();

        let mut root = Root::new().unwrap();
        root.add_module_path(dir.clone());
        let v = root
            .run_source("import geometry\nlet (x, y) = origin in x + y", "<t>")
            .unwrap()
            .0;
        assert!(v.equal(&Value::num(0)), "got {}", v);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_compile_time_evaluation() {
        // the macro body runs during the build, so the result is a constant
        assert!(eval("$( 6 * 7 )").equal(&Value::num(42)));
    }

    #[test]
    fn test_uncaught_exception_reports() {
        let mut root = Root::new().unwrap();
        let err = root.run_source("raise `boom", "<t>").unwrap_err();
        assert!(matches!(err, LoadError::Uncaught { .. }));
    }
}
