//! Interpreter session: RustPython VM lifecycle with a persistent namespace.
//!
//! One [`InterpreterSession`] lives inside one worker process and owns all
//! RustPython API calls. Unlike a throwaway evaluator, the execution scope is
//! created once and reused: names defined by one `run_code` request are
//! visible to the next. Capture hooks are activated around each execution
//! and restored afterwards, so the hook set never changes mid-request.
//!
//! ## Trailing-expression results
//!
//! `run_code` splits the source into a statements block and an optional
//! trailing expression by parsing it: when the last top-level statement is a
//! bare expression, it is rewritten to `__cillow_result__ = <expr>` before
//! compilation and the value is read back out of the namespace afterwards
//! (then removed again). A snippet ending in a statement yields a null
//! result.

use std::collections::HashSet;
use std::path::PathBuf;

use rustpython_parser::{ast, Parse};
use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyStr},
    compiler::Mode,
    scope::Scope,
    AsObject, Interpreter, PyObjectRef, TryFromObject, VirtualMachine,
};

use crate::error::{ErrorKind, Exception};
use crate::hooks::{with_hooks, CaptureHook};
use crate::inspect::ResolveContext;
use crate::protocol::{Environment, FrameSink};

/// Namespace slot the trailing expression is assigned to.
const RESULT_NAME: &str = "__cillow_result__";

// ── Session ──────────────────────────────────────────────────────────────────

/// A configured interpreter bundled with its persistent execution scope and
/// the resolution context used by the dependency inspector.
///
/// Not `Send`: the session is confined to the worker's main thread, which is
/// what keeps the namespace coherent without locks.
pub struct InterpreterSession {
    interp: Interpreter,
    scope: Option<Scope>,
    resolve: ResolveContext,
}

impl InterpreterSession {
    /// Build a session bound to `env`.
    ///
    /// A directory environment contributes its `site-packages` to the module
    /// search path ahead of the host stdlib paths; the sentinel environment
    /// uses the ambient paths only.
    pub fn new(env: &Environment) -> Self {
        let mut search_paths = Vec::new();
        if let Some(site) = env.site_packages() {
            search_paths.push(site);
        }
        search_paths.extend(python_stdlib_paths());

        let mut settings = rustpython_vm::Settings::default();
        for path in &search_paths {
            settings.path_list.push(path.to_string_lossy().into_owned());
        }

        let interp = Interpreter::with_init(settings, |vm| {
            // Native (Rust-implemented) stdlib modules: math, _json, zlib, …
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
        });

        // Names importable without installing anything: everything already in
        // sys.modules after init, plus the compiled-in module names.
        let mut builtin_modules: HashSet<String> = rustpython_stdlib::get_module_inits()
            .map(|(name, _)| name.into_owned())
            .collect();
        // The capture seam registered by the artifact hook.
        builtin_modules.insert("_cillow".to_string());
        interp.enter(|vm| {
            collect_resolvable_modules(vm, &mut builtin_modules);
        });

        Self {
            interp,
            scope: None,
            resolve: ResolveContext::new(builtin_modules, search_paths),
        }
    }

    /// Resolution context for the dependency inspector.
    pub fn resolve_context(&self) -> &ResolveContext {
        &self.resolve
    }

    /// Execute `source` against the persistent namespace with `hooks`
    /// active, returning the trailing expression's value (if any) as JSON.
    pub fn run_code(
        &mut self,
        source: &str,
        hooks: &[Box<dyn CaptureHook>],
        sink: &FrameSink,
    ) -> Result<Option<serde_json::Value>, Exception> {
        let prepared = wrap_trailing_expression(source);
        let scope_slot = &mut self.scope;

        self.interp.enter(|vm| {
            let code = match vm.compile(&prepared, Mode::Exec, "<run_code>".to_owned()) {
                Ok(code) => code,
                Err(err) => return Err(syntax_exception(&err)),
            };

            let scope = scope_slot
                .get_or_insert_with(|| {
                    let scope = vm.new_scope_with_builtins();
                    let _ = scope.globals.set_item(
                        "__name__",
                        vm.ctx.new_str("__main__").into(),
                        vm,
                    );
                    scope
                })
                .clone();

            let outcome = with_hooks(vm, hooks, sink, |vm| vm.run_code_obj(code, scope.clone()));

            match outcome {
                Ok(_) => Ok(take_result_value(vm, &scope)),
                Err(exc) => Err(user_code_exception(vm, exc)),
            }
        })
    }
}

// ── Source preparation ───────────────────────────────────────────────────────

/// Rewrite a trailing bare-expression statement as an assignment to
/// [`RESULT_NAME`]. Source that does not parse is returned unchanged so the
/// compiler reports the syntax error through the normal path.
pub fn wrap_trailing_expression(source: &str) -> String {
    let Ok(program) = ast::Suite::parse(source, "<input>") else {
        return source.to_string();
    };
    let Some(ast::Stmt::Expr(last)) = program.last() else {
        return source.to_string();
    };
    let start = usize::from(last.range.start());
    format!("{}{RESULT_NAME} = {}", &source[..start], &source[start..])
}

// ── VM helpers ───────────────────────────────────────────────────────────────

/// Candidate filesystem paths for a host Python standard library.
///
/// RustPython loads pure-Python stdlib modules (os, json, collections, …)
/// from a host installation when present; the native modules registered via
/// `rustpython_stdlib` shadow any compiled extensions on the same path.
fn python_stdlib_paths() -> Vec<PathBuf> {
    let candidates = [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/local/lib/python3.10",
        "/usr/lib/python3",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3.10",
    ];
    let mut paths = Vec::new();
    for candidate in candidates {
        let root = PathBuf::from(candidate);
        if !root.is_dir() {
            continue;
        }
        // Package dirs alongside the stdlib, so ambient installs resolve too.
        for packages in [root.join("site-packages"), root.join("dist-packages")] {
            if packages.is_dir() {
                paths.push(packages);
            }
        }
        paths.push(root);
    }
    let dist = PathBuf::from("/usr/lib/python3/dist-packages");
    if dist.is_dir() {
        paths.push(dist);
    }
    paths
}

/// Add every module name the freshly initialized VM can already resolve:
/// the contents of `sys.modules` plus `sys.builtin_module_names`.
fn collect_resolvable_modules(vm: &VirtualMachine, out: &mut HashSet<String>) {
    if let Ok(modules) = vm.sys_module.get_attr("modules", vm) {
        if let Ok(keys) = vm.call_method(&modules, "keys", ()) {
            collect_str_items(vm, &keys, out);
        }
    }
    if let Ok(names) = vm.sys_module.get_attr("builtin_module_names", vm) {
        collect_str_items(vm, &names, out);
    }
}

fn collect_str_items(vm: &VirtualMachine, iterable: &PyObjectRef, out: &mut HashSet<String>) {
    let Ok(iter) = vm.call_method(iterable, "__iter__", ()) else {
        return;
    };
    loop {
        match vm.call_method(&iter, "__next__", ()) {
            Ok(item) => {
                if let Ok(s) = item.str(vm) {
                    out.insert(s.as_str().to_owned());
                }
            }
            Err(_) => break, // StopIteration
        }
    }
}

/// Read and remove the trailing-expression value from the scope. Returns
/// `None` when no trailing expression was assigned (a `None` value from an
/// actual expression maps to JSON null instead).
fn take_result_value(vm: &VirtualMachine, scope: &Scope) -> Option<serde_json::Value> {
    let globals: PyObjectRef = scope.globals.as_object().to_owned();
    let present = vm
        .call_method(&globals, "__contains__", (vm.ctx.new_str(RESULT_NAME),))
        .ok()
        .and_then(|flag| bool::try_from_object(vm, flag).ok())
        .unwrap_or(false);
    if !present {
        return None;
    }
    let value = vm
        .call_method(&globals, "get", (vm.ctx.new_str(RESULT_NAME),))
        .ok()?;
    let _ = vm.call_method(&globals, "__delitem__", (vm.ctx.new_str(RESULT_NAME),));
    Some(py_to_json(vm, &value, 0))
}

/// Nesting bound for container conversion; self-referential containers fall
/// back to repr instead of recursing forever.
const MAX_JSON_DEPTH: usize = 32;

/// Convert a Python value into JSON where it has a natural mapping
/// (`None`/bool/int/float/str/list/tuple); anything else becomes its repr.
fn py_to_json(vm: &VirtualMachine, obj: &PyObjectRef, depth: usize) -> serde_json::Value {
    use serde_json::Value;

    if vm.is_none(obj) {
        return Value::Null;
    }
    if obj.fast_isinstance(&vm.ctx.types.bool_type) {
        if let Ok(b) = bool::try_from_object(vm, obj.clone()) {
            return Value::Bool(b);
        }
    }
    if obj.fast_isinstance(&vm.ctx.types.int_type) {
        if let Ok(i) = i64::try_from_object(vm, obj.clone()) {
            return Value::from(i);
        }
    }
    if obj.fast_isinstance(&vm.ctx.types.float_type) {
        if let Ok(f) = f64::try_from_object(vm, obj.clone()) {
            if let Some(number) = serde_json::Number::from_f64(f) {
                return Value::Number(number);
            }
        }
    }
    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Value::String(s.as_str().to_owned());
    }
    if depth < MAX_JSON_DEPTH
        && (obj.fast_isinstance(&vm.ctx.types.list_type)
            || obj.fast_isinstance(&vm.ctx.types.tuple_type))
    {
        if let Ok(items) = vm.extract_elements_with::<PyObjectRef, _>(obj, Ok) {
            return Value::Array(
                items
                    .iter()
                    .map(|item| py_to_json(vm, item, depth + 1))
                    .collect(),
            );
        }
    }
    match obj.repr(vm) {
        Ok(repr) => Value::String(repr.as_str().to_owned()),
        Err(_) => Value::String("<unrepresentable>".to_string()),
    }
}

fn syntax_exception(err: &rustpython_vm::compiler::CompileError) -> Exception {
    let (line, col) = err.python_location();
    Exception::new(
        ErrorKind::UserCodeError,
        format!("SyntaxError: {err} (line {line}, column {col})"),
    )
}

/// Convert a raised Python exception, keeping the original type name in the
/// message and the formatted traceback alongside.
fn user_code_exception(vm: &VirtualMachine, exc: PyBaseExceptionRef) -> Exception {
    let type_name = exc.class().name().to_owned();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);
    Exception::with_traceback(
        ErrorKind::UserCodeError,
        format!("{type_name}: {message}"),
        traceback,
    )
}
